//! RFCOMM connection management over BlueZ.
//!
//! Outgoing sockets resolve their channel through an SDP directory lookup
//! that can be cancelled from another thread and falls back to a channel
//! derived from the service identifier. Listening sockets hand out accepted
//! connections and keep a service record alive while they are open. Every
//! socket can be closed from any thread, including while another thread is
//! blocked inside it.

pub mod bluetooth;
pub mod config;
pub mod error;
pub mod event;
pub mod sdp;
pub mod socket;

pub use bluetooth::{
   address::{Channel, PeerAddress, ServiceId},
   transport::BondState,
};
pub use config::Config;
pub use error::{Result, RfcommError};
pub use socket::{RfcommListener, RfcommSocket, ServiceAdapter};
