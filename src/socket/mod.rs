//! Socket layer: connection endpoints, listeners and the adapter that
//! creates them.

pub mod adapter;
pub mod endpoint;
pub mod server;
pub mod stream;

pub use adapter::{AdapterOptions, ServiceAdapter, ServiceRecord};
pub use endpoint::RfcommSocket;
pub use server::{ListenerState, RfcommListener};
pub use stream::{RfcommInputStream, RfcommOutputStream};
