//! In-memory radio stack for tests.
//!
//! Blocking calls poll their handle's shutdown flag, so a `shutdown()` from
//! another thread unblocks them the way the real transport does.

use std::{
   collections::{HashMap, HashSet, VecDeque},
   io,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
   thread,
   time::{Duration, Instant},
};

use parking_lot::Mutex;

use crate::bluetooth::{
   address::{Channel, PeerAddress},
   transport::{
      Backlog, BondState, LocalAdapter, Peers, Stack, Transport, TransportError,
      TransportResult,
   },
};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
/// Address of the simulated local adapter.
pub const LOCAL_ADDRESS: [u8; 6] = [0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13];

/// Per-handle state, observable from tests.
#[derive(Default)]
pub struct HandleState {
   pub shutdown: AtomicBool,
   pub destroyed: AtomicBool,
   pub listening: AtomicBool,
   pub input_shut: AtomicBool,
   pub output_shut: AtomicBool,
   pub bound: Mutex<Option<Channel>>,
   pub inbox: Mutex<VecDeque<u8>>,
   pub outbox: Mutex<Vec<u8>>,
}

#[derive(Default)]
pub struct Radio {
   /// Channels already bound by someone else.
   pub busy: Mutex<HashSet<Channel>>,
   /// Peers with an active link.
   pub linked: Mutex<Peers>,
   /// Peers that will connect to the next `accept` calls.
   pub incoming: Mutex<VecDeque<PeerAddress>>,
   /// Outgoing connects, in call order.
   pub connects: Mutex<Vec<(PeerAddress, Channel)>>,
   /// Make `connect` block until shutdown.
   pub hang_connect: AtomicBool,
   pub fail_listen: AtomicBool,
   pub fail_enumeration: AtomicBool,
   pub handles: Mutex<Vec<Arc<HandleState>>>,
   pub enumerations: AtomicUsize,
   /// Local adapter alias.
   pub alias: Mutex<String>,
   pub powered: AtomicBool,
   /// Paired peers.
   pub bonded: Mutex<Peers>,
   /// Names of remote devices that have been seen.
   pub names: Mutex<HashMap<PeerAddress, String>>,
}

#[derive(Clone, Default)]
pub struct MockStack(pub Arc<Radio>);

impl MockStack {
   pub fn new() -> Self {
      Self::default()
   }

   pub fn radio(&self) -> &Radio {
      &self.0
   }

   pub fn handle(&self, index: usize) -> Arc<HandleState> {
      self.0.handles.lock()[index].clone()
   }

   pub fn handle_count(&self) -> usize {
      self.0.handles.lock().len()
   }

   fn new_transport(&self) -> MockTransport {
      let state = Arc::new(HandleState::default());
      self.0.handles.lock().push(state.clone());
      MockTransport {
         radio: self.0.clone(),
         state,
      }
   }
}

impl LocalAdapter for MockStack {
   fn address(&self) -> TransportResult<PeerAddress> {
      Ok(PeerAddress::from(bluer::Address::new(LOCAL_ADDRESS)))
   }

   fn name(&self) -> TransportResult<String> {
      Ok(self.0.alias.lock().clone())
   }

   fn set_name(&self, name: &str) -> TransportResult<()> {
      *self.0.alias.lock() = name.to_string();
      Ok(())
   }

   fn is_powered(&self) -> TransportResult<bool> {
      Ok(self.0.powered.load(Ordering::Acquire))
   }

   fn set_powered(&self, powered: bool) -> TransportResult<()> {
      self.0.powered.store(powered, Ordering::Release);
      Ok(())
   }

   fn bonded_devices(&self) -> TransportResult<Peers> {
      Ok(self.0.bonded.lock().clone())
   }

   fn remote_name(&self, peer: PeerAddress) -> TransportResult<Option<String>> {
      Ok(self.0.names.lock().get(&peer).cloned())
   }

   fn bond_state(&self, peer: PeerAddress) -> TransportResult<BondState> {
      if self.0.bonded.lock().contains(&peer) {
         Ok(BondState::Bonded)
      } else {
         Ok(BondState::None)
      }
   }
}

impl Stack for MockStack {
   fn create(&self) -> TransportResult<Box<dyn Transport>> {
      Ok(Box::new(self.new_transport()))
   }

   fn active_connections(&self) -> TransportResult<Peers> {
      self.0.enumerations.fetch_add(1, Ordering::Relaxed);
      if self.0.fail_enumeration.load(Ordering::Relaxed) {
         return Err(TransportError::Io(io::Error::other("enumeration failed")));
      }
      Ok(self.0.linked.lock().clone())
   }
}

struct MockTransport {
   radio: Arc<Radio>,
   state: Arc<HandleState>,
}

impl MockTransport {
   fn check_open(&self) -> TransportResult<()> {
      if self.state.shutdown.load(Ordering::Acquire) {
         Err(TransportError::Closed)
      } else {
         Ok(())
      }
   }
}

impl Transport for MockTransport {
   fn bind(&self, _local: Option<PeerAddress>, channel: Channel) -> TransportResult<()> {
      self.check_open()?;
      if !self.radio.busy.lock().insert(channel) {
         return Err(TransportError::AddressInUse);
      }
      *self.state.bound.lock() = Some(channel);
      Ok(())
   }

   fn listen(&self, _backlog: Backlog) -> TransportResult<()> {
      self.check_open()?;
      if self.radio.fail_listen.load(Ordering::Relaxed) {
         return Err(TransportError::Io(io::Error::other("listen failed")));
      }
      self.state.listening.store(true, Ordering::Release);
      Ok(())
   }

   fn connect(&self, peer: PeerAddress, channel: Channel) -> TransportResult<()> {
      self.check_open()?;
      self.radio.connects.lock().push((peer, channel));
      while self.radio.hang_connect.load(Ordering::Acquire) {
         self.check_open()?;
         thread::sleep(POLL_INTERVAL);
      }
      self.check_open()
   }

   fn accept(&self, timeout: Option<Duration>) -> TransportResult<Box<dyn Transport>> {
      let deadline = timeout.map(|t| Instant::now() + t);
      loop {
         self.check_open()?;
         if let Some(peer) = self.radio.incoming.lock().pop_front() {
            let mut linked = self.radio.linked.lock();
            if !linked.contains(&peer) {
               linked.push(peer);
            }
            let stack = MockStack(self.radio.clone());
            return Ok(Box::new(stack.new_transport()));
         }
         if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(TransportError::Io(io::ErrorKind::TimedOut.into()));
         }
         thread::sleep(POLL_INTERVAL);
      }
   }

   fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
      self.check_open()?;
      if self.state.input_shut.load(Ordering::Acquire) {
         return Ok(0);
      }
      let mut inbox = self.state.inbox.lock();
      let n = buf.len().min(inbox.len());
      for (dst, src) in buf.iter_mut().zip(inbox.drain(..n)) {
         *dst = src;
      }
      Ok(n)
   }

   fn write(&self, buf: &[u8]) -> TransportResult<usize> {
      self.check_open()?;
      if self.state.output_shut.load(Ordering::Acquire) {
         return Err(TransportError::Io(io::ErrorKind::BrokenPipe.into()));
      }
      self.state.outbox.lock().extend_from_slice(buf);
      Ok(buf.len())
   }

   fn flush(&self) -> TransportResult<()> {
      self.check_open()
   }

   fn shutdown_input(&self) -> TransportResult<()> {
      self.state.input_shut.store(true, Ordering::Release);
      Ok(())
   }

   fn shutdown_output(&self) -> TransportResult<()> {
      self.state.output_shut.store(true, Ordering::Release);
      Ok(())
   }

   fn shutdown(&self) -> TransportResult<()> {
      self.state.shutdown.store(true, Ordering::Release);
      Ok(())
   }

   fn destroy(&self) {
      assert!(
         self.state.shutdown.load(Ordering::Acquire),
         "destroy before shutdown"
      );
      if !self.state.destroyed.swap(true, Ordering::AcqRel)
         && let Some(channel) = self.state.bound.lock().take()
      {
         self.radio.busy.lock().remove(&channel);
      }
   }
}
