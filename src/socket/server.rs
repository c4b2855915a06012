//! Listening endpoint bound to one RFCOMM channel.

use std::{sync::Arc, time::Duration};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      address::{Channel, ServiceId},
      transport::{Backlog, Stack},
   },
   error::{Result, RfcommError},
   event::{RecordHandle, WeakObserver},
   sdp::policy::ChannelPolicy,
   socket::endpoint::RfcommSocket,
};

/// Lifecycle of a listener. A listener only exists once bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum ListenerState {
   Bound,
   Accepting,
   Closed,
}

/// A listening RFCOMM socket that hands out connected [`RfcommSocket`]s.
pub struct RfcommListener {
   socket: RfcommSocket,
   name: SmolStr,
   service: ServiceId,
   channel: Channel,
   state: AtomicCell<ListenerState>,
   /// Accepts in flight; the state only returns to `Bound` when the last one
   /// finishes.
   accepting: Mutex<usize>,
   observer: Mutex<Option<(WeakObserver, RecordHandle)>>,
}

impl RfcommListener {
   /// Binds the first free channel offered by `policy` and starts listening.
   pub(crate) fn bind(
      stack: Arc<dyn Stack>,
      name: impl Into<SmolStr>,
      service: ServiceId,
      policy: ChannelPolicy,
   ) -> Result<Self> {
      let name = name.into();
      let mut candidates = policy.candidates(service).peekable();

      let (socket, channel) = loop {
         let Some(channel) = candidates.next() else {
            return Err(RfcommError::AddressInUse(service.fallback_channel()));
         };
         let socket = RfcommSocket::listening(stack.clone())?;
         match socket.bind(channel) {
            Ok(()) => break (socket, channel),
            Err(RfcommError::AddressInUse(_)) if candidates.peek().is_some() => {
               debug!("RFCOMM channel {channel} in use, trying next");
               socket.close();
            },
            Err(e) => {
               debug!("Failed to bind RFCOMM channel {channel} for {name}: {e}");
               socket.close();
               return Err(e);
            },
         }
      };

      if let Err(e) = socket.listen(Backlog::Unbounded) {
         socket.close();
         return Err(e);
      }

      info!("Listening for {name} ({service}) on RFCOMM channel {channel}");
      Ok(Self {
         socket,
         name,
         service,
         channel,
         state: AtomicCell::new(ListenerState::Bound),
         accepting: Mutex::new(0),
         observer: Mutex::new(None),
      })
   }

   /// Blocks until a peer connects.
   pub fn accept(&self) -> Result<RfcommSocket> {
      self.accept_with(None)
   }

   pub fn accept_timeout(&self, timeout: Duration) -> Result<RfcommSocket> {
      self.accept_with(Some(timeout))
   }

   /// Millisecond variant where a negative value blocks forever.
   pub fn accept_millis(&self, timeout_ms: i32) -> Result<RfcommSocket> {
      let timeout = u64::try_from(timeout_ms).ok().map(Duration::from_millis);
      self.accept_with(timeout)
   }

   fn accept_with(&self, timeout: Option<Duration>) -> Result<RfcommSocket> {
      {
         let mut accepting = self.accepting.lock();
         if let Err(ListenerState::Closed) = self
            .state
            .compare_exchange(ListenerState::Bound, ListenerState::Accepting)
         {
            return Err(RfcommError::SocketClosed);
         }
         *accepting += 1;
      }

      let accepted = self.socket.accept(timeout);
      {
         let mut accepting = self.accepting.lock();
         *accepting -= 1;
         if *accepting == 0 {
            // A concurrent close wins over the transition back.
            let _ = self
               .state
               .compare_exchange(ListenerState::Accepting, ListenerState::Bound);
         }
      }

      let socket = accepted?;
      match socket.remote_address() {
         Some(peer) => info!("{} accepted connection from {peer}", self.name),
         None => info!("{} accepted connection", self.name),
      }
      Ok(socket)
   }

   /// Registers who to tell when this listener closes. Replaces any earlier
   /// registration that has not fired yet.
   pub(crate) fn set_close_observer(&self, observer: WeakObserver, handle: RecordHandle) {
      *self.observer.lock() = Some((observer, handle));
   }

   /// Closes the listener, unblocking any pending accept. Idempotent.
   pub fn close(&self) {
      if self.state.swap(ListenerState::Closed) == ListenerState::Closed {
         return;
      }

      let target = self.observer.lock().take();
      if let Some((observer, handle)) = target {
         match observer.upgrade() {
            Some(observer) => observer.listener_closed(handle),
            None => warn!("Close observer for {} already dropped", self.name),
         }
      }

      self.socket.close();
      debug!("Listener {} on channel {} closed", self.name, self.channel);
   }

   pub fn state(&self) -> ListenerState {
      self.state.load()
   }

   pub fn name(&self) -> &str {
      &self.name
   }

   pub const fn service(&self) -> ServiceId {
      self.service
   }

   pub const fn channel(&self) -> Channel {
      self.channel
   }
}

impl Drop for RfcommListener {
   fn drop(&mut self) {
      self.close();
   }
}

impl std::fmt::Debug for RfcommListener {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("RfcommListener")
         .field("name", &self.name)
         .field("service", &self.service)
         .field("channel", &self.channel)
         .field("state", &self.state.load())
         .finish_non_exhaustive()
   }
}
