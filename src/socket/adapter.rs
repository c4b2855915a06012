//! Service adapter: the entry point that creates sockets and listeners.
//!
//! The adapter owns its radio stack and directory client explicitly. Nothing
//! here is process-global; tests build an adapter over the mock stack.

use std::{
   collections::BTreeMap,
   sync::{
      Arc,
      atomic::{AtomicU32, Ordering},
   },
   time::Duration,
};

use log::{debug, info};
use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::{
   bluetooth::{
      address::{Channel, PeerAddress, ServiceId},
      rfcomm::BluezStack,
      transport::{BondState, Peers, Stack, TransportError},
   },
   config::Config,
   error::{Result, RfcommError},
   event::{CloseObserver, RecordHandle, WeakObserver},
   sdp::{
      DirectoryClient, dbus::DbusDirectory, policy::ChannelPolicy, resolver::ChannelResolver,
   },
   socket::{
      endpoint::{RfcommSocket, Target},
      server::RfcommListener,
   },
};

/// Tunables for a [`ServiceAdapter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterOptions {
   pub lookup_timeout: Duration,
   pub channel_policy: ChannelPolicy,
}

impl Default for AdapterOptions {
   fn default() -> Self {
      Self::from(&Config::default())
   }
}

impl From<&Config> for AdapterOptions {
   fn from(config: &Config) -> Self {
      Self {
         lookup_timeout: config.lookup_timeout(),
         channel_policy: config.channel_policy,
      }
   }
}

/// A service published by one of this adapter's listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceRecord {
   pub handle: RecordHandle,
   pub name: SmolStr,
   pub service: ServiceId,
   pub channel: Channel,
}

/// Keeps the records of live listeners; a record is dropped when its
/// listener closes.
#[derive(Debug, Default)]
pub struct ServiceRecords {
   next: AtomicU32,
   records: Mutex<BTreeMap<RecordHandle, ServiceRecord>>,
}

impl ServiceRecords {
   fn insert(&self, name: SmolStr, service: ServiceId, channel: Channel) -> RecordHandle {
      let handle = self.next.fetch_add(1, Ordering::Relaxed) + 1;
      self.records.lock().insert(
         handle,
         ServiceRecord {
            handle,
            name,
            service,
            channel,
         },
      );
      handle
   }

   pub fn list(&self) -> Vec<ServiceRecord> {
      self.records.lock().values().cloned().collect()
   }
}

impl CloseObserver for ServiceRecords {
   fn listener_closed(&self, handle: RecordHandle) {
      if let Some(record) = self.records.lock().remove(&handle) {
         debug!(
            "Removed service record {handle} ({} on channel {})",
            record.name, record.channel
         );
      }
   }
}

/// Creates RFCOMM sockets and listeners over a radio stack.
pub struct ServiceAdapter {
   stack: Arc<dyn Stack>,
   resolver: ChannelResolver,
   policy: ChannelPolicy,
   records: Arc<ServiceRecords>,
}

impl ServiceAdapter {
   pub fn new(
      stack: Arc<dyn Stack>,
      directory: Arc<dyn DirectoryClient>,
      options: AdapterOptions,
   ) -> Self {
      Self {
         stack,
         resolver: ChannelResolver::new(directory, options.lookup_timeout),
         policy: options.channel_policy,
         records: Arc::new(ServiceRecords::default()),
      }
   }

   /// Opens the BlueZ adapter and the system bus directory client.
   pub async fn default_adapter(config: &Config) -> Result<Self> {
      let stack = BluezStack::open(config.adapter.as_deref()).await?;
      let directory = DbusDirectory::connect().await?;
      info!(
         "Service adapter ready (lookup timeout {:?}, channel policy {})",
         config.lookup_timeout(),
         config.channel_policy
      );
      Ok(Self::new(
         Arc::new(stack),
         Arc::new(directory),
         AdapterOptions::from(config),
      ))
   }

   pub fn check_address(address: &str) -> bool {
      PeerAddress::check(address)
   }

   pub fn remote_device(&self, address: &str) -> Result<PeerAddress> {
      PeerAddress::parse(address)
   }

   /// Address of the local adapter.
   pub fn address(&self) -> Result<PeerAddress> {
      self.stack.address().map_err(adapter_error)
   }

   pub fn name(&self) -> Result<String> {
      self.stack.name().map_err(adapter_error)
   }

   pub fn set_name(&self, name: &str) -> Result<()> {
      self.stack.set_name(name).map_err(adapter_error)?;
      info!("Adapter name set to {name:?}");
      Ok(())
   }

   /// Whether the radio is powered.
   pub fn is_enabled(&self) -> Result<bool> {
      self.stack.is_powered().map_err(adapter_error)
   }

   pub fn enable(&self) -> Result<()> {
      self.set_powered(true)
   }

   pub fn disable(&self) -> Result<()> {
      self.set_powered(false)
   }

   fn set_powered(&self, powered: bool) -> Result<()> {
      self.stack.set_powered(powered).map_err(adapter_error)?;
      info!("Adapter powered {}", if powered { "on" } else { "off" });
      Ok(())
   }

   pub fn bonded_devices(&self) -> Result<Peers> {
      self.stack.bonded_devices().map_err(adapter_error)
   }

   /// Advertised name of `peer`, `None` when the device was never seen.
   pub fn remote_name(&self, peer: PeerAddress) -> Result<Option<String>> {
      self.stack.remote_name(peer).map_err(adapter_error)
   }

   pub fn bond_state(&self, peer: PeerAddress) -> Result<BondState> {
      self.stack.bond_state(peer).map_err(adapter_error)
   }

   /// Binds a listener for `service` and records it until the listener closes.
   pub fn listen_with_service_record(
      &self,
      name: &str,
      service: ServiceId,
   ) -> Result<RfcommListener> {
      let name = SmolStr::new(name);
      let listener =
         RfcommListener::bind(self.stack.clone(), name.clone(), service, self.policy)?;

      let handle = self.records.insert(name, service, listener.channel());
      let records: Arc<dyn CloseObserver> = self.records.clone();
      let observer: WeakObserver = Arc::downgrade(&records);
      listener.set_close_observer(observer, handle);
      Ok(listener)
   }

   /// Socket that resolves the channel for `service` over SDP when connecting.
   pub fn create_socket(&self, peer: PeerAddress, service: ServiceId) -> Result<RfcommSocket> {
      let (lookup, handle) = self.resolver.lookup(peer, service);
      RfcommSocket::outgoing(self.stack.clone(), peer, Target::Lookup(lookup, handle))
   }

   /// Socket that connects straight to `channel`, skipping service discovery.
   pub fn create_insecure_socket(
      &self,
      peer: PeerAddress,
      channel: Channel,
   ) -> Result<RfcommSocket> {
      RfcommSocket::outgoing(self.stack.clone(), peer, Target::Channel(channel))
   }

   pub fn records(&self) -> Vec<ServiceRecord> {
      self.records.list()
   }

   pub const fn channel_policy(&self) -> ChannelPolicy {
      self.policy
   }
}

fn adapter_error(e: TransportError) -> RfcommError {
   RfcommError::Io(e.into())
}

impl std::fmt::Debug for ServiceAdapter {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("ServiceAdapter")
         .field("resolver", &self.resolver)
         .field("policy", &self.policy)
         .finish_non_exhaustive()
   }
}
