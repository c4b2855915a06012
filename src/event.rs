//! Close notifications for listening sockets.
//!
//! An owner that keeps external state keyed by a listener (a service record,
//! for instance) registers itself as a [`CloseObserver`] and is told exactly
//! once when that listener closes.

use std::sync::Weak;

/// Identifies the record an observer associated with a listener.
pub type RecordHandle = u32;

/// Trait for receiving listener close notifications.
pub trait CloseObserver: Send + Sync {
   /// Called once, before the listener's transport is shut down.
   fn listener_closed(&self, handle: RecordHandle);
}

/// Observers are held weakly; a dropped observer is simply not notified.
pub type WeakObserver = Weak<dyn CloseObserver>;
