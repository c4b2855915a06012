//! Service discovery: resolving which RFCOMM channel a peer exposes a service
//! on, and choosing the channel a local listener binds.

pub mod dbus;
pub mod policy;
pub mod resolver;

#[cfg(test)]
pub(crate) mod mock;

use crate::bluetooth::address::PeerAddress;

pub use resolver::LookupCallback;

/// Client of the remote service directory.
pub trait DirectoryClient: Send + Sync {
   /// Starts a channel query for `service16` on `peer`.
   ///
   /// Returns whether the query was accepted. The answer is delivered later,
   /// on any thread, through [`LookupCallback::on_result`].
   fn start_lookup(&self, peer: PeerAddress, service16: u16, callback: LookupCallback) -> bool;
}
