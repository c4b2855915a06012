//! Low-level transport contract the socket layer is written against.
//!
//! A [`Transport`] is one RFCOMM handle. All of its methods take `&self` because
//! [`Transport::shutdown`] must be callable from another thread while a peer
//! thread is blocked in `connect`, `accept` or `read` on the same handle.

use std::{io, time::Duration};

use smallvec::SmallVec;
use thiserror::Error;

use crate::bluetooth::address::{Channel, PeerAddress};

/// `EBADF`
const EBADF: i32 = 9;
/// `EBADFD`
const EBADFD: i32 = 77;
/// `EADDRINUSE`
const EADDRINUSE: i32 = 98;

/// Snapshot of the peers with an active baseband link.
pub type Peers = SmallVec<[PeerAddress; 8]>;

/// Error codes surfaced by the transport.
#[derive(Error, Debug)]
pub enum TransportError {
   #[error("address in use")]
   AddressInUse,

   #[error("handle closed")]
   Closed,

   #[error(transparent)]
   Io(io::Error),
}

impl From<io::Error> for TransportError {
   fn from(e: io::Error) -> Self {
      match e.raw_os_error() {
         Some(EADDRINUSE) => Self::AddressInUse,
         Some(EBADF | EBADFD) => Self::Closed,
         _ if e.kind() == io::ErrorKind::AddrInUse => Self::AddressInUse,
         _ => Self::Io(e),
      }
   }
}

impl From<TransportError> for io::Error {
   fn from(e: TransportError) -> Self {
      match e {
         TransportError::AddressInUse => Self::from(io::ErrorKind::AddrInUse),
         TransportError::Closed => Self::new(io::ErrorKind::NotConnected, "handle closed"),
         TransportError::Io(e) => e,
      }
   }
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Listen backlog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backlog {
   /// Let the kernel cap the queue.
   Unbounded,
   Bounded(u32),
}

/// One RFCOMM handle.
///
/// Once [`shutdown`](Transport::shutdown) has been requested, every blocking
/// call in flight or issued later returns [`TransportError::Closed`] promptly.
pub trait Transport: Send + Sync {
   /// Binds to `channel` on the local adapter (`None` binds any adapter).
   fn bind(&self, local: Option<PeerAddress>, channel: Channel) -> TransportResult<()>;

   fn listen(&self, backlog: Backlog) -> TransportResult<()>;

   /// Blocks until the link to `peer` on `channel` is up.
   fn connect(&self, peer: PeerAddress, channel: Channel) -> TransportResult<()>;

   /// Blocks until a peer connects or `timeout` elapses (`None` waits forever).
   ///
   /// The peer address is intentionally not reported.
   fn accept(&self, timeout: Option<Duration>) -> TransportResult<Box<dyn Transport>>;

   fn read(&self, buf: &mut [u8]) -> TransportResult<usize>;

   fn write(&self, buf: &[u8]) -> TransportResult<usize>;

   fn flush(&self) -> TransportResult<()>;

   fn shutdown_input(&self) -> TransportResult<()>;

   fn shutdown_output(&self) -> TransportResult<()>;

   /// Unblocks any in-flight call on this handle.
   fn shutdown(&self) -> TransportResult<()>;

   /// Releases the handle. Only valid after [`shutdown`](Transport::shutdown).
   fn destroy(&self);
}

/// Whether a remote device is paired with the local adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BondState {
   None,
   Bonded,
}

/// Queries and settings of the local adapter and the devices it knows.
///
/// Every method blocks; call from threads that are not driving the runtime.
pub trait LocalAdapter: Send + Sync {
   fn address(&self) -> TransportResult<PeerAddress>;

   /// Friendly name shown to remote devices.
   fn name(&self) -> TransportResult<String>;

   fn set_name(&self, name: &str) -> TransportResult<()>;

   fn is_powered(&self) -> TransportResult<bool>;

   fn set_powered(&self, powered: bool) -> TransportResult<()>;

   /// Devices paired with this adapter, connected or not.
   fn bonded_devices(&self) -> TransportResult<Peers>;

   /// The remote device's advertised name, if it has been seen.
   fn remote_name(&self, peer: PeerAddress) -> TransportResult<Option<String>>;

   fn bond_state(&self, peer: PeerAddress) -> TransportResult<BondState>;
}

/// The radio stack: creates handles and enumerates linked peers.
pub trait Stack: LocalAdapter {
   fn create(&self) -> TransportResult<Box<dyn Transport>>;

   fn active_connections(&self) -> TransportResult<Peers>;
}
