//! Blocking, cancellable channel lookups.
//!
//! A lookup is a one-shot cell: the directory answer and a cancellation race
//! to fill it and the first one wins. The resolving thread waits on the cell's
//! condition variable for at most the lookup timeout, after which it falls
//! back to the channel derived from the service identifier.

use std::{
   fmt,
   sync::{Arc, Weak},
   time::Duration,
};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::{
   bluetooth::address::{Channel, PeerAddress, ServiceId},
   error::{Result, RfcommError},
   sdp::DirectoryClient,
};

/// Upper bound on a directory lookup; the answer should always arrive first.
pub const LOOKUP_TIMEOUT: Duration = Duration::from_secs(12);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
   Pending,
   Answered(i32),
   Cancelled,
   /// The resolver stopped waiting.
   Expired,
}

#[derive(Debug)]
struct LookupInner {
   peer: PeerAddress,
   service: ServiceId,
   outcome: Mutex<Outcome>,
   signal: Condvar,
}

impl LookupInner {
   /// Fills the cell if it is still empty.
   fn settle(&self, outcome: Outcome) -> bool {
      let mut slot = self.outcome.lock();
      if *slot != Outcome::Pending {
         return false;
      }
      *slot = outcome;
      self.signal.notify_all();
      true
   }

   fn is_cancelled(&self) -> bool {
      *self.outcome.lock() == Outcome::Cancelled
   }
}

/// Translates `(peer, service)` into a usable channel.
pub struct ChannelResolver {
   directory: Arc<dyn DirectoryClient>,
   timeout: Duration,
}

impl fmt::Debug for ChannelResolver {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("ChannelResolver")
         .field("timeout", &self.timeout)
         .finish_non_exhaustive()
   }
}

impl ChannelResolver {
   pub fn new(directory: Arc<dyn DirectoryClient>, timeout: Duration) -> Self {
      Self { directory, timeout }
   }

   pub const fn timeout(&self) -> Duration {
      self.timeout
   }

   /// Prepares a lookup. The returned handle cancels it from any thread.
   pub fn lookup(&self, peer: PeerAddress, service: ServiceId) -> (PendingLookup, LookupHandle) {
      let inner = Arc::new(LookupInner {
         peer,
         service,
         outcome: Mutex::new(Outcome::Pending),
         signal: Condvar::new(),
      });
      let handle = LookupHandle(inner.clone());
      (
         PendingLookup {
            inner,
            directory: self.directory.clone(),
            timeout: self.timeout,
         },
         handle,
      )
   }

   /// Convenience wrapper for a lookup nobody else needs to cancel.
   pub fn resolve(&self, peer: PeerAddress, service: ServiceId) -> Result<Channel> {
      self.lookup(peer, service).0.resolve()
   }
}

/// An outstanding directory query. Consumed by [`PendingLookup::resolve`].
pub struct PendingLookup {
   inner: Arc<LookupInner>,
   directory: Arc<dyn DirectoryClient>,
   timeout: Duration,
}

impl fmt::Debug for PendingLookup {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("PendingLookup")
         .field("peer", &self.inner.peer)
         .field("service", &self.inner.service)
         .finish_non_exhaustive()
   }
}

impl PendingLookup {
   /// Blocks until the directory answers, the lookup is cancelled, or the
   /// timeout elapses.
   pub fn resolve(self) -> Result<Channel> {
      let (peer, service) = (self.inner.peer, self.inner.service);
      match self.await_answer() {
         Err(RfcommError::LookupTimeout) => {
            let channel = service.fallback_channel();
            debug!("No SDP answer from {peer} for {service}, using channel {channel}");
            Ok(channel)
         },
         Ok(channel) => {
            debug!("SDP: {service} on {peer} is channel {channel}");
            Ok(channel)
         },
         Err(e) => Err(e),
      }
   }

   fn await_answer(&self) -> Result<Channel> {
      let inner = &self.inner;
      if inner.is_cancelled() {
         return Err(RfcommError::LookupCancelled);
      }

      let callback = LookupCallback(Arc::downgrade(inner));
      if !self
         .directory
         .start_lookup(inner.peer, inner.service.short(), callback)
      {
         return Err(RfcommError::DirectoryUnavailable);
      }

      let mut outcome = inner.outcome.lock();
      inner
         .signal
         .wait_while_for(&mut outcome, |o| *o == Outcome::Pending, self.timeout);

      let settled = *outcome;
      match settled {
         Outcome::Pending | Outcome::Expired => {
            // Late answers are ignored from now on.
            *outcome = Outcome::Expired;
            Err(RfcommError::LookupTimeout)
         },
         Outcome::Cancelled => Err(RfcommError::LookupCancelled),
         Outcome::Answered(raw) => Channel::new(raw).ok_or_else(|| {
            warn!("Directory returned invalid channel {raw} for {}", inner.peer);
            RfcommError::LookupTimeout
         }),
      }
   }
}

/// Cancels a lookup. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct LookupHandle(Arc<LookupInner>);

impl LookupHandle {
   /// Wakes the resolving thread with `LookupCancelled`. Idempotent; has no
   /// effect once the directory has answered.
   pub fn cancel(&self) {
      if self.0.settle(Outcome::Cancelled) {
         debug!("SDP lookup for {} canceled", self.0.peer);
      }
   }

   pub fn is_cancelled(&self) -> bool {
      self.0.is_cancelled()
   }
}

/// Token handed to the directory client to deliver its answer.
#[derive(Debug, Clone)]
pub struct LookupCallback(Weak<LookupInner>);

impl LookupCallback {
   /// Delivers the directory's answer. Answers for another peer are ignored.
   pub fn on_result(&self, peer: PeerAddress, channel: i32) {
      let Some(inner) = self.0.upgrade() else {
         return;
      };
      if inner.peer != peer {
         debug!("Ignoring SDP result for {peer}, waiting for {}", inner.peer);
         return;
      }
      inner.settle(Outcome::Answered(channel));
   }

   /// Whether the lookup is still waiting for its answer.
   pub fn is_live(&self) -> bool {
      self
         .0
         .upgrade()
         .is_some_and(|inner| *inner.outcome.lock() == Outcome::Pending)
   }

   pub fn same_lookup(&self, other: &Self) -> bool {
      Weak::ptr_eq(&self.0, &other.0)
   }
}
