//! Connection endpoint: one RFCOMM socket, outgoing or accepted.
//!
//! Every operation that touches the transport holds the socket's guard in
//! shared mode, including `close`. Blocking calls therefore never stop `close`
//! from running; instead `close` marks the socket closed, cancels a pending
//! SDP lookup and asks the transport to shut down, which makes any thread
//! blocked in the transport return with an error. Destroying the handle
//! happens afterwards, outside the guard.

use std::{
   fmt,
   sync::{
      Arc,
      atomic::{AtomicBool, Ordering},
   },
   time::Duration,
};

use crossbeam::atomic::AtomicCell;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::{
   bluetooth::{
      address::{Channel, PeerAddress},
      transport::{Backlog, Peers, Stack, Transport, TransportError},
   },
   error::{Result, RfcommError},
   sdp::resolver::{LookupHandle, PendingLookup},
   socket::stream::{RfcommInputStream, RfcommOutputStream},
};

/// Where an outgoing socket connects to.
#[derive(Debug)]
pub enum Target {
   /// Resolve the channel through SDP first.
   Lookup(PendingLookup, LookupHandle),
   /// Connect straight to a known channel.
   Channel(Channel),
}

/// An RFCOMM socket.
///
/// Safe to share between a thread blocked in [`connect`](Self::connect) and a
/// thread calling [`close`](Self::close).
pub struct RfcommSocket {
   stack: Arc<dyn Stack>,
   transport: Arc<dyn Transport>,
   peer: Option<PeerAddress>,
   lookup: Mutex<Option<PendingLookup>>,
   cancel: Option<LookupHandle>,
   channel: AtomicCell<Option<Channel>>,
   guard: RwLock<()>,
   closed: AtomicBool,
}

impl RfcommSocket {
   fn new(
      stack: Arc<dyn Stack>,
      transport: Box<dyn Transport>,
      peer: Option<PeerAddress>,
      channel: Option<Channel>,
   ) -> Self {
      Self {
         stack,
         transport: Arc::from(transport),
         peer,
         lookup: Mutex::new(None),
         cancel: None,
         channel: AtomicCell::new(channel),
         guard: RwLock::new(()),
         closed: AtomicBool::new(false),
      }
   }

   /// Creates an unconnected socket aimed at `peer`.
   pub(crate) fn outgoing(stack: Arc<dyn Stack>, peer: PeerAddress, target: Target) -> Result<Self> {
      let transport = stack.create().map_err(|e| RfcommError::Io(e.into()))?;
      let mut socket = Self::new(stack, transport, Some(peer), None);
      match target {
         Target::Lookup(lookup, handle) => {
            socket.lookup = Mutex::new(Some(lookup));
            socket.cancel = Some(handle);
         },
         Target::Channel(channel) => socket.channel.store(Some(channel)),
      }
      Ok(socket)
   }

   /// Creates a socket that will be bound and put into listening mode.
   pub(crate) fn listening(stack: Arc<dyn Stack>) -> Result<Self> {
      let transport = stack.create().map_err(|e| RfcommError::Io(e.into()))?;
      Ok(Self::new(stack, transport, None, None))
   }

   /// Connects to the remote device, resolving the channel first if needed.
   ///
   /// Blocks. A concurrent [`close`](Self::close) makes it fail promptly.
   /// Must be called at most once.
   pub fn connect(&self) -> Result<()> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }
      let peer = self.peer.ok_or(RfcommError::NoRemoteDevice)?;

      let pending = self.lookup.lock().take();
      let channel = match pending {
         Some(lookup) => {
            let channel = lookup.resolve()?;
            self.channel.store(Some(channel));
            channel
         },
         // The one-shot lookup was spent by an earlier attempt.
         None => self.channel.load().ok_or(RfcommError::LookupCancelled)?,
      };

      self
         .transport
         .connect(peer, channel)
         .map_err(|e| self.failure(e, RfcommError::ConnectFailed))?;
      info!("Connected to {peer} on RFCOMM channel {channel}");
      Ok(())
   }

   /// Waits for a peer to connect to this listening socket.
   ///
   /// The transport does not report who connected, so the peer is identified
   /// by comparing the linked peers before and after the accept.
   pub(crate) fn accept(&self, timeout: Option<Duration>) -> Result<Self> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }

      let before = self.linked_peers();
      let incoming = self
         .transport
         .accept(timeout)
         .map_err(|e| self.failure(e, RfcommError::AcceptFailed))?;
      let after = self.linked_peers();

      let peer = identify_peer(&before, &after);
      match peer {
         Some(peer) => debug!("Accepted RFCOMM connection from {peer}"),
         None => warn!("Accepted RFCOMM connection from an unknown peer"),
      }
      Ok(Self::new(
         self.stack.clone(),
         incoming,
         peer,
         self.channel.load(),
      ))
   }

   pub(crate) fn bind(&self, channel: Channel) -> Result<()> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }
      match self.transport.bind(None, channel) {
         Ok(()) => {
            self.channel.store(Some(channel));
            Ok(())
         },
         Err(TransportError::AddressInUse) => Err(RfcommError::AddressInUse(channel)),
         Err(e) => Err(self.failure(e, RfcommError::AcceptFailed)),
      }
   }

   pub(crate) fn listen(&self, backlog: Backlog) -> Result<()> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }
      self
         .transport
         .listen(backlog)
         .map_err(|e| self.failure(e, RfcommError::AcceptFailed))
   }

   /// Closes the socket. Idempotent and safe to call while another thread is
   /// blocked in `connect` or `accept`; never fails.
   pub fn close(&self) {
      {
         let _guard = self.guard.read();
         if self.closed.swap(true, Ordering::AcqRel) {
            return;
         }
         if let Some(lookup) = &self.cancel {
            lookup.cancel();
         }
         if let Err(e) = self.transport.shutdown() {
            warn!("Failed to shut down RFCOMM socket: {e}");
         }
      }

      // Blocked transport calls return promptly once shutdown is requested.
      self.transport.destroy();
      match self.peer {
         Some(peer) => debug!("Closed RFCOMM socket to {peer}"),
         None => debug!("Closed RFCOMM socket"),
      }
   }

   pub fn is_closed(&self) -> bool {
      self.closed.load(Ordering::Acquire)
   }

   pub fn input_stream(&self) -> Result<RfcommInputStream> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }
      Ok(RfcommInputStream::new(self.transport.clone()))
   }

   pub fn output_stream(&self) -> Result<RfcommOutputStream> {
      let _guard = self.guard.read();
      if self.is_closed() {
         return Err(RfcommError::SocketClosed);
      }
      Ok(RfcommOutputStream::new(self.transport.clone()))
   }

   /// The remote device; `None` for listening sockets and for accepted
   /// sockets whose peer could not be identified.
   pub const fn remote_address(&self) -> Option<PeerAddress> {
      self.peer
   }

   /// The channel this socket is bound or connected to, once known.
   pub fn channel(&self) -> Option<Channel> {
      self.channel.load()
   }

   fn failure(&self, e: TransportError, kind: fn(TransportError) -> RfcommError) -> RfcommError {
      if self.is_closed() {
         debug!("Transport call aborted by close: {e}");
         RfcommError::SocketClosed
      } else {
         kind(e)
      }
   }

   fn linked_peers(&self) -> Peers {
      self.stack.active_connections().unwrap_or_else(|e| {
         warn!("Failed to list active connections: {e}");
         Peers::new()
      })
   }
}

impl Drop for RfcommSocket {
   fn drop(&mut self) {
      self.close();
   }
}

impl fmt::Debug for RfcommSocket {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("RfcommSocket")
         .field("peer", &self.peer)
         .field("channel", &self.channel.load())
         .field("closed", &self.is_closed())
         .finish_non_exhaustive()
   }
}

/// Picks the peer that appeared during an accept.
///
/// Best effort: with several simultaneous inbound connections the new peer
/// cannot be isolated and the first linked peer is assumed instead.
fn identify_peer(before: &Peers, after: &Peers) -> Option<PeerAddress> {
   if let Some(new) = after.iter().find(|p| !before.contains(p)) {
      return Some(*new);
   }
   let guess = after.first().copied();
   if let Some(guess) = guess {
      warn!("Could not isolate accepted peer, assuming {guess}");
   }
   guess
}

#[cfg(test)]
mod tests {
   use std::{
      io::{Read, Write},
      sync::atomic::Ordering,
      thread,
      time::{Duration, Instant},
   };

   use smallvec::smallvec;

   use super::*;
   use crate::{
      bluetooth::{address::ServiceId, mock::MockStack},
      sdp::{
         mock::{Answer, MockDirectory},
         resolver::ChannelResolver,
      },
   };

   fn addr(s: &str) -> PeerAddress {
      PeerAddress::parse(s).unwrap()
   }

   fn direct_socket(stack: &MockStack, channel: u8) -> RfcommSocket {
      RfcommSocket::outgoing(
         Arc::new(stack.clone()),
         addr("00:11:22:AA:BB:CC"),
         Target::Channel(Channel::new(i32::from(channel)).unwrap()),
      )
      .unwrap()
   }

   #[test]
   fn test_connect_direct_channel() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.connect().unwrap();

      let connects = stack.radio().connects.lock().clone();
      assert_eq!(connects.len(), 1);
      assert_eq!(connects[0].1.get(), 5);
      assert_eq!(socket.channel().map(Channel::get), Some(5));
   }

   #[test]
   fn test_connect_resolves_channel() {
      let stack = MockStack::new();
      let resolver = ChannelResolver::new(
         Arc::new(MockDirectory::new(Answer::Immediate(17))),
         Duration::from_secs(12),
      );
      let peer = addr("00:11:22:AA:BB:CC");
      let (lookup, handle) = resolver.lookup(peer, ServiceId::SERIAL_PORT);
      let socket =
         RfcommSocket::outgoing(Arc::new(stack.clone()), peer, Target::Lookup(lookup, handle))
            .unwrap();

      socket.connect().unwrap();
      assert_eq!(stack.radio().connects.lock()[0], (peer, Channel::new(17).unwrap()));
   }

   #[test]
   fn test_connect_directory_unavailable() {
      let stack = MockStack::new();
      let resolver = ChannelResolver::new(
         Arc::new(MockDirectory::new(Answer::Refuse)),
         Duration::from_secs(12),
      );
      let peer = addr("00:11:22:AA:BB:CC");
      let (lookup, handle) = resolver.lookup(peer, ServiceId::SERIAL_PORT);
      let socket =
         RfcommSocket::outgoing(Arc::new(stack.clone()), peer, Target::Lookup(lookup, handle))
            .unwrap();

      assert!(matches!(
         socket.connect(),
         Err(RfcommError::DirectoryUnavailable)
      ));
      assert!(stack.radio().connects.lock().is_empty());
   }

   #[test]
   fn test_connect_after_close() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.close();
      assert!(matches!(socket.connect(), Err(RfcommError::SocketClosed)));
   }

   #[test]
   fn test_close_twice() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.close();
      socket.close();
      assert!(socket.is_closed());

      let handle = stack.handle(0);
      assert!(handle.shutdown.load(Ordering::Acquire));
      assert!(handle.destroyed.load(Ordering::Acquire));
   }

   #[test]
   fn test_close_unblocks_connect() {
      let stack = MockStack::new();
      stack.radio().hang_connect.store(true, Ordering::Release);
      let socket = Arc::new(direct_socket(&stack, 5));

      let connector = {
         let socket = socket.clone();
         thread::spawn(move || {
            let start = Instant::now();
            (socket.connect(), start.elapsed())
         })
      };

      while stack.radio().connects.lock().is_empty() {
         thread::sleep(Duration::from_millis(5));
      }
      socket.close();

      let (result, elapsed) = connector.join().unwrap();
      assert!(matches!(result, Err(RfcommError::SocketClosed)));
      assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
   }

   #[test]
   fn test_close_cancels_lookup() {
      let stack = MockStack::new();
      let resolver = ChannelResolver::new(
         Arc::new(MockDirectory::new(Answer::Never)),
         Duration::from_secs(12),
      );
      let peer = addr("00:11:22:AA:BB:CC");
      let (lookup, handle) = resolver.lookup(peer, ServiceId::SERIAL_PORT);
      let socket = Arc::new(
         RfcommSocket::outgoing(Arc::new(stack.clone()), peer, Target::Lookup(lookup, handle))
            .unwrap(),
      );

      let connector = {
         let socket = socket.clone();
         thread::spawn(move || {
            let start = Instant::now();
            (socket.connect(), start.elapsed())
         })
      };

      thread::sleep(Duration::from_millis(100));
      socket.close();

      let (result, elapsed) = connector.join().unwrap();
      assert!(matches!(result, Err(RfcommError::LookupCancelled)));
      assert!(elapsed < Duration::from_secs(1), "took {elapsed:?}");
      assert!(stack.radio().connects.lock().is_empty());
   }

   #[test]
   fn test_streams() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.connect().unwrap();

      let handle = stack.handle(0);
      handle.inbox.lock().extend(b"ping");

      let mut input = socket.input_stream().unwrap();
      let mut output = socket.output_stream().unwrap();

      let mut buf = [0u8; 16];
      let n = input.read(&mut buf).unwrap();
      assert_eq!(&buf[..n], b"ping");

      output.write_all(b"pong").unwrap();
      output.flush().unwrap();
      assert_eq!(handle.outbox.lock().as_slice(), b"pong");
   }

   #[test]
   fn test_stream_half_close() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.connect().unwrap();
      let handle = stack.handle(0);

      let mut input = socket.input_stream().unwrap();
      let mut output = socket.output_stream().unwrap();
      input.close();

      assert!(handle.input_shut.load(Ordering::Acquire));
      assert!(!handle.output_shut.load(Ordering::Acquire));
      assert!(!handle.shutdown.load(Ordering::Acquire));
      assert!(input.read(&mut [0u8; 4]).is_err());

      // The other direction still works
      output.write_all(b"still open").unwrap();
      drop(output);
      assert!(handle.output_shut.load(Ordering::Acquire));
      assert!(!socket.is_closed());
   }

   #[test]
   fn test_streams_after_close() {
      let stack = MockStack::new();
      let socket = direct_socket(&stack, 5);
      socket.close();
      assert!(matches!(
         socket.input_stream(),
         Err(RfcommError::SocketClosed)
      ));
      assert!(matches!(
         socket.output_stream(),
         Err(RfcommError::SocketClosed)
      ));
   }

   #[test]
   fn test_identify_new_peer() {
      let a = addr("00:00:00:00:00:0A");
      let b = addr("00:00:00:00:00:0B");
      let before: Peers = smallvec![a];
      let after: Peers = smallvec![a, b];
      assert_eq!(identify_peer(&before, &after), Some(b));
   }

   #[test]
   fn test_identify_ambiguous_peer() {
      let a = addr("00:00:00:00:00:0A");
      let b = addr("00:00:00:00:00:0B");
      let both: Peers = smallvec![a, b];
      // Nothing new: fall back to a member of the post-accept set
      let guess = identify_peer(&both, &both).unwrap();
      assert!(both.contains(&guess));
      assert_eq!(identify_peer(&both, &Peers::new()), None);
   }
}
