//! Error types for the RFCOMM service.
//!
//! Transport-level failures are caught at the socket boundary and re-raised
//! as one of the failure kinds below, so callers can decide between retrying
//! and giving up without inspecting raw error codes.

use thiserror::Error;

use crate::bluetooth::{address::Channel, transport::TransportError};

/// Main error type for the RFCOMM service.
#[derive(Error, Debug)]
pub enum RfcommError {
   #[error("Invalid Bluetooth address: {0}")]
   InvalidAddress(String),

   #[error("Invalid service identifier: {0}")]
   InvalidServiceId(String),

   #[error("Socket closed")]
   SocketClosed,

   #[error("Connect failed: {0}")]
   ConnectFailed(#[source] TransportError),

   #[error("Socket has no remote device")]
   NoRemoteDevice,

   #[error("Unable to start service discovery")]
   DirectoryUnavailable,

   /// Only produced inside the resolver, where it becomes the fallback channel.
   #[error("Service discovery timed out")]
   LookupTimeout,

   #[error("Service discovery canceled")]
   LookupCancelled,

   #[error("RFCOMM channel {0} in use")]
   AddressInUse(Channel),

   #[error("Accept failed: {0}")]
   AcceptFailed(#[source] TransportError),

   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Worker task panicked: {0}")]
   WorkerPanicked(#[from] tokio::task::JoinError),
}

impl RfcommError {
   /// Whether the failure is transient, i.e. the same call may succeed later.
   pub const fn is_retryable(&self) -> bool {
      matches!(
         self,
         Self::ConnectFailed(_)
            | Self::DirectoryUnavailable
            | Self::AddressInUse(_)
            | Self::AcceptFailed(_)
      )
   }
}

/// Convenience type alias for Results with `RfcommError`.
pub type Result<T> = std::result::Result<T, RfcommError>;
