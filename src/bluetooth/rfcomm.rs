//! RFCOMM transport backed by BlueZ.
//!
//! `bluer` exposes RFCOMM sockets as async types. Each [`BluezTransport`] drives
//! them to completion on a tokio runtime handle and races every blocking call
//! against a shutdown signal, which is what lets another thread unblock a
//! pending `connect`/`accept`/`read` by calling [`Transport::shutdown`].
//!
//! The blocking methods call [`Handle::block_on`] and must therefore be used
//! from threads that are not driving the runtime (plain OS threads or
//! `spawn_blocking`).

use std::{future::Future, io, mem, sync::Arc, time::Duration};

use bluer::{
   Adapter, Address, Device, Session,
   rfcomm::{
      Listener, Socket, SocketAddr, Stream,
      stream::{OwnedReadHalf, OwnedWriteHalf},
   },
};
use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
   io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
   runtime::Handle,
   select,
   sync::{self, watch},
   time,
};

use crate::{
   bluetooth::{
      address::{Channel, PeerAddress},
      transport::{
         Backlog, BondState, LocalAdapter, Peers, Stack, Transport, TransportError,
         TransportResult,
      },
   },
   error::{Result, RfcommError},
};

/// Largest backlog handed to `listen(2)`; the kernel caps it at `somaxconn`.
const UNBOUNDED_BACKLOG: u32 = i32::MAX as u32;

fn bluer_error(e: bluer::Error) -> TransportError {
   TransportError::Io(io::Error::other(e))
}

fn invalid_state(what: &'static str) -> TransportError {
   TransportError::Io(io::Error::new(io::ErrorKind::InvalidInput, what))
}

/// The local BlueZ adapter as an RFCOMM [`Stack`].
pub struct BluezStack {
   runtime: Handle,
   adapter: Adapter,
   _session: Session,
}

impl BluezStack {
   /// Opens the named adapter, or the default one, and powers it on.
   ///
   /// Must be called from within a tokio runtime; the runtime is captured and
   /// used to drive every socket created later.
   pub async fn open(adapter_name: Option<&str>) -> Result<Self> {
      let session = Session::new().await?;
      let adapter = match adapter_name {
         Some(name) => session
            .adapter(name)
            .map_err(|_| RfcommError::AdapterNotFound)?,
         None => session.default_adapter().await?,
      };

      if !adapter.is_powered().await? {
         adapter.set_powered(true).await?;
         info!("Powered on adapter: {}", adapter.name());
      }
      info!(
         "Using adapter {} ({})",
         adapter.name(),
         adapter.address().await?
      );

      Ok(Self {
         runtime: Handle::current(),
         adapter,
         _session: session,
      })
   }
}

impl BluezStack {
   /// Peers among the adapter's known devices for which `check` holds.
   fn devices_where<F, Fut>(&self, check: F) -> TransportResult<Peers>
   where
      F: Fn(Device) -> Fut,
      Fut: Future<Output = bluer::Result<bool>>,
   {
      self.runtime.block_on(async {
         let addresses = self
            .adapter
            .device_addresses()
            .await
            .map_err(bluer_error)?;
         let check = &check;
         let checks = addresses.into_iter().map(|addr| async move {
            let device = self.adapter.device(addr).ok()?;
            let matched = check(device).await.ok()?;
            matched.then_some(PeerAddress::from(addr))
         });
         Ok(future::join_all(checks).await.into_iter().flatten().collect())
      })
   }

   fn device(&self, peer: PeerAddress) -> TransportResult<Device> {
      self.adapter.device(peer.into()).map_err(bluer_error)
   }
}

impl LocalAdapter for BluezStack {
   fn address(&self) -> TransportResult<PeerAddress> {
      let address = self
         .runtime
         .block_on(self.adapter.address())
         .map_err(bluer_error)?;
      Ok(PeerAddress::from(address))
   }

   fn name(&self) -> TransportResult<String> {
      self
         .runtime
         .block_on(self.adapter.alias())
         .map_err(bluer_error)
   }

   fn set_name(&self, name: &str) -> TransportResult<()> {
      self
         .runtime
         .block_on(self.adapter.set_alias(name.to_string()))
         .map_err(bluer_error)
   }

   fn is_powered(&self) -> TransportResult<bool> {
      self
         .runtime
         .block_on(self.adapter.is_powered())
         .map_err(bluer_error)
   }

   fn set_powered(&self, powered: bool) -> TransportResult<()> {
      self
         .runtime
         .block_on(self.adapter.set_powered(powered))
         .map_err(bluer_error)?;
      info!("Adapter {} powered {}", self.adapter.name(), if powered { "on" } else { "off" });
      Ok(())
   }

   fn bonded_devices(&self) -> TransportResult<Peers> {
      self.devices_where(|device| async move { device.is_paired().await })
   }

   fn remote_name(&self, peer: PeerAddress) -> TransportResult<Option<String>> {
      let device = self.device(peer)?;
      self.runtime.block_on(device.name()).map_err(bluer_error)
   }

   fn bond_state(&self, peer: PeerAddress) -> TransportResult<BondState> {
      let device = self.device(peer)?;
      let paired = self
         .runtime
         .block_on(device.is_paired())
         .map_err(bluer_error)?;
      Ok(if paired { BondState::Bonded } else { BondState::None })
   }
}

impl Stack for BluezStack {
   fn create(&self) -> TransportResult<Box<dyn Transport>> {
      let _rt = self.runtime.enter();
      let socket = Socket::new()?;
      Ok(Box::new(BluezTransport::new(
         self.runtime.clone(),
         Slot::Idle(socket),
      )))
   }

   fn active_connections(&self) -> TransportResult<Peers> {
      self.devices_where(|device| async move { device.is_connected().await })
   }
}

/// Read and write halves of a connected stream.
///
/// Each direction has its own shutdown flag. Shutting a direction down never
/// waits for its lock: a read or write in flight observes the flag and
/// returns, so half-closing is safe from any thread, inside the runtime or not.
struct Halves<R, W> {
   reader: sync::Mutex<Option<R>>,
   writer: sync::Mutex<Option<W>>,
   input_shut: watch::Sender<bool>,
   output_shut: watch::Sender<bool>,
}

impl<R, W> Halves<R, W>
where
   R: AsyncRead + Unpin,
   W: AsyncWrite + Unpin,
{
   fn new(reader: R, writer: W) -> Self {
      Self {
         reader: sync::Mutex::new(Some(reader)),
         writer: sync::Mutex::new(Some(writer)),
         input_shut: watch::channel(false).0,
         output_shut: watch::channel(false).0,
      }
   }

   /// Returns 0 once the input is shut down.
   async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
      let mut shut = self.input_shut.subscribe();
      select! {
         res = async {
            match self.reader.lock().await.as_mut() {
               Some(reader) => reader.read(buf).await,
               None => Ok(0),
            }
         } => res,
         _ = shut.wait_for(|shut| *shut) => Ok(0),
      }
   }

   async fn write(&self, buf: &[u8]) -> io::Result<usize> {
      let mut shut = self.output_shut.subscribe();
      select! {
         res = async {
            match self.writer.lock().await.as_mut() {
               Some(writer) => writer.write(buf).await,
               None => Err(io::ErrorKind::BrokenPipe.into()),
            }
         } => res,
         _ = shut.wait_for(|shut| *shut) => Err(io::ErrorKind::BrokenPipe.into()),
      }
   }

   async fn flush(&self) -> io::Result<()> {
      let mut shut = self.output_shut.subscribe();
      select! {
         res = async {
            match self.writer.lock().await.as_mut() {
               Some(writer) => writer.flush().await,
               None => Ok(()),
            }
         } => res,
         _ = shut.wait_for(|shut| *shut) => Ok(()),
      }
   }

   fn shutdown_input(&self) {
      self.input_shut.send_replace(true);
      // Dropping the read half stops delivery; the link stays up for writes.
      if let Ok(mut reader) = self.reader.try_lock() {
         reader.take();
      }
   }

   /// Hands back the write half for a graceful shutdown, unless a write in
   /// flight still holds it.
   fn shutdown_output(&self) -> Option<W> {
      self.output_shut.send_replace(true);
      self.writer.try_lock().ok().and_then(|mut writer| writer.take())
   }
}

type StreamHalves = Halves<OwnedReadHalf, OwnedWriteHalf>;

enum Slot {
   Idle(Socket),
   Listening(Arc<Listener>),
   Connected(Arc<StreamHalves>),
   Released,
}

impl Slot {
   fn split(stream: Stream) -> Self {
      let (reader, writer) = stream.into_split();
      Self::Connected(Arc::new(Halves::new(reader, writer)))
   }
}

/// A single RFCOMM handle.
pub struct BluezTransport {
   runtime: Handle,
   slot: Mutex<Slot>,
   shutdown: watch::Sender<bool>,
}

impl BluezTransport {
   fn new(runtime: Handle, slot: Slot) -> Self {
      let (shutdown, _) = watch::channel(false);
      Self {
         runtime,
         slot: Mutex::new(slot),
         shutdown,
      }
   }

   fn connected(runtime: Handle, stream: Stream) -> Self {
      Self::new(runtime, Slot::split(stream))
   }

   fn is_shut_down(&self) -> bool {
      *self.shutdown.borrow()
   }

   /// Runs `fut` to completion unless shutdown is requested first.
   fn block_on<T>(&self, fut: impl Future<Output = io::Result<T>>) -> TransportResult<T> {
      let mut shutdown = self.shutdown.subscribe();
      self.runtime.block_on(async move {
         select! {
            res = fut => res.map_err(TransportError::from),
            _ = shutdown.wait_for(|closed| *closed) => Err(TransportError::Closed),
         }
      })
   }

   fn take_socket(&self) -> TransportResult<Socket> {
      let mut slot = self.slot.lock();
      match mem::replace(&mut *slot, Slot::Released) {
         Slot::Idle(socket) => Ok(socket),
         Slot::Released => Err(TransportError::Closed),
         other => {
            *slot = other;
            Err(invalid_state("socket already in use"))
         },
      }
   }

   fn halves(&self) -> TransportResult<Arc<StreamHalves>> {
      match &*self.slot.lock() {
         Slot::Connected(halves) => Ok(halves.clone()),
         Slot::Released => Err(TransportError::Closed),
         _ => Err(invalid_state("socket not connected")),
      }
   }

   fn install(&self, slot: Slot) -> TransportResult<()> {
      let mut current = self.slot.lock();
      if self.is_shut_down() {
         return Err(TransportError::Closed);
      }
      *current = slot;
      Ok(())
   }
}

impl Transport for BluezTransport {
   fn bind(&self, local: Option<PeerAddress>, channel: Channel) -> TransportResult<()> {
      let addr = SocketAddr::new(local.map_or_else(Address::any, Address::from), channel.get());
      match &*self.slot.lock() {
         Slot::Idle(socket) => Ok(socket.bind(addr)?),
         Slot::Released => Err(TransportError::Closed),
         _ => Err(invalid_state("socket already in use")),
      }
   }

   fn listen(&self, backlog: Backlog) -> TransportResult<()> {
      let backlog = match backlog {
         Backlog::Unbounded => UNBOUNDED_BACKLOG,
         Backlog::Bounded(n) => n,
      };
      let socket = self.take_socket()?;
      let _rt = self.runtime.enter();
      let listener = socket.listen(backlog)?;
      self.install(Slot::Listening(Arc::new(listener)))
   }

   fn connect(&self, peer: PeerAddress, channel: Channel) -> TransportResult<()> {
      let socket = self.take_socket()?;
      let addr = SocketAddr::new(peer.into(), channel.get());
      debug!("Connecting RFCOMM socket to {peer}:{channel}");
      let stream = self.block_on(socket.connect(addr))?;
      self.install(Slot::split(stream))
   }

   fn accept(&self, timeout: Option<Duration>) -> TransportResult<Box<dyn Transport>> {
      let listener = match &*self.slot.lock() {
         Slot::Listening(listener) => listener.clone(),
         Slot::Released => return Err(TransportError::Closed),
         _ => return Err(invalid_state("socket not listening")),
      };
      let (stream, addr) = self.block_on(async move {
         match timeout {
            Some(timeout) => time::timeout(timeout, listener.accept())
               .await
               .unwrap_or_else(|_| Err(io::ErrorKind::TimedOut.into())),
            None => listener.accept().await,
         }
      })?;
      debug!("Accepted RFCOMM link from {}:{}", addr.addr, addr.channel);
      Ok(Box::new(Self::connected(self.runtime.clone(), stream)))
   }

   fn read(&self, buf: &mut [u8]) -> TransportResult<usize> {
      let halves = self.halves()?;
      self.block_on(halves.read(buf))
   }

   fn write(&self, buf: &[u8]) -> TransportResult<usize> {
      let halves = self.halves()?;
      self.block_on(halves.write(buf))
   }

   fn flush(&self) -> TransportResult<()> {
      let halves = self.halves()?;
      self.block_on(halves.flush())
   }

   fn shutdown_input(&self) -> TransportResult<()> {
      self.halves()?.shutdown_input();
      Ok(())
   }

   fn shutdown_output(&self) -> TransportResult<()> {
      let Some(mut writer) = self.halves()?.shutdown_output() else {
         return Ok(());
      };
      if Handle::try_current().is_ok() {
         // Streams are dropped on runtime threads too, where blocking panics.
         self.runtime.spawn(async move {
            if let Err(e) = writer.shutdown().await {
               debug!("RFCOMM output shutdown failed: {e}");
            }
         });
         Ok(())
      } else {
         self.block_on(writer.shutdown())
      }
   }

   fn shutdown(&self) -> TransportResult<()> {
      if !self.shutdown.send_replace(true) {
         debug!("RFCOMM handle shut down");
      }
      Ok(())
   }

   fn destroy(&self) {
      if !self.is_shut_down() {
         warn!("Destroying RFCOMM handle before shutdown");
         self.shutdown.send_replace(true);
      }
      let _rt = self.runtime.enter();
      let released = mem::replace(&mut *self.slot.lock(), Slot::Released);
      drop(released);
   }
}
