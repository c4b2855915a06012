//! Directory client talking to the service registry over the system bus.
//!
//! Queries go out as `GetRemoteServiceChannel` method calls; answers come back
//! asynchronously as `RemoteServiceChannel` signals, which a background task
//! routes to the callbacks waiting on that peer and service.

use std::{collections::HashMap, sync::Arc};

use futures::stream::StreamExt;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smallvec::SmallVec;
use tokio::{runtime::Handle, task::JoinHandle};
use zbus::{Connection, proxy};

use crate::{
   bluetooth::address::PeerAddress,
   error::Result,
   sdp::{DirectoryClient, LookupCallback},
};

#[proxy(
   interface = "org.rfcommd.Directory1",
   default_service = "org.rfcommd.Directory",
   default_path = "/org/rfcommd/directory"
)]
trait Directory {
   /// Returns whether the query was started.
   fn get_remote_service_channel(&self, address: &str, uuid16: u16) -> zbus::Result<bool>;

   #[zbus(signal)]
   fn remote_service_channel(&self, address: &str, uuid16: u16, channel: i32)
   -> zbus::Result<()>;
}

type LookupKey = (PeerAddress, u16);

/// Callbacks waiting for a directory answer, keyed by peer and 16-bit service.
#[derive(Debug, Default)]
struct Waiters(Mutex<HashMap<LookupKey, SmallVec<[LookupCallback; 2]>>>);

impl Waiters {
   fn register(&self, key: LookupKey, callback: LookupCallback) {
      let mut waiters = self.0.lock();
      prune(&mut waiters);
      waiters.entry(key).or_default().push(callback);
   }

   fn forget(&self, key: LookupKey, callback: &LookupCallback) {
      let mut waiters = self.0.lock();
      if let Some(pending) = waiters.get_mut(&key) {
         pending.retain(|cb| !cb.same_lookup(callback));
         if pending.is_empty() {
            waiters.remove(&key);
         }
      }
   }

   /// Hands `channel` to every lookup of `service16` on `peer`. Returns how
   /// many were waiting.
   fn deliver(&self, peer: PeerAddress, service16: u16, channel: i32) -> usize {
      let pending = {
         let mut waiters = self.0.lock();
         let pending = waiters.remove(&(peer, service16)).unwrap_or_default();
         prune(&mut waiters);
         pending
      };
      for callback in &pending {
         callback.on_result(peer, channel);
      }
      pending.len()
   }

   #[cfg(test)]
   fn len(&self) -> usize {
      self.0.lock().values().map(SmallVec::len).sum()
   }
}

/// Drops callbacks whose lookup finished, timed out or was cancelled.
fn prune(waiters: &mut HashMap<LookupKey, SmallVec<[LookupCallback; 2]>>) {
   waiters.retain(|_, pending| {
      pending.retain(|cb| cb.is_live());
      !pending.is_empty()
   });
}

/// [`DirectoryClient`] backed by the D-Bus registry.
pub struct DbusDirectory {
   runtime: Handle,
   proxy: DirectoryProxy<'static>,
   waiters: Arc<Waiters>,
   dispatcher: JoinHandle<()>,
}

impl DbusDirectory {
   /// Connects to the system bus and subscribes to lookup results.
   pub async fn connect() -> Result<Self> {
      let connection = Connection::system().await?;
      let proxy = DirectoryProxy::new(&connection).await?;
      let results = proxy.receive_remote_service_channel().await?;

      let waiters = Arc::new(Waiters::default());
      let dispatcher = tokio::spawn(dispatch_results(results, waiters.clone()));
      info!("Connected to service directory at {}", proxy.inner().destination());

      Ok(Self {
         runtime: Handle::current(),
         proxy,
         waiters,
         dispatcher,
      })
   }
}

impl Drop for DbusDirectory {
   fn drop(&mut self) {
      self.dispatcher.abort();
   }
}

impl DirectoryClient for DbusDirectory {
   fn start_lookup(&self, peer: PeerAddress, service16: u16, callback: LookupCallback) -> bool {
      // Registered first: the answer may arrive before the call returns.
      let key = (peer, service16);
      self.waiters.register(key, callback.clone());

      let address = peer.to_string();
      let started = self
         .runtime
         .block_on(self.proxy.get_remote_service_channel(&address, service16));
      match started {
         Ok(true) => {
            debug!("SDP lookup started for {peer} (uuid16 {service16:#06x})");
            true
         },
         Ok(false) => {
            self.waiters.forget(key, &callback);
            false
         },
         Err(e) => {
            warn!("SDP lookup for {peer} failed: {e}");
            self.waiters.forget(key, &callback);
            false
         },
      }
   }
}

async fn dispatch_results(mut results: RemoteServiceChannelStream, waiters: Arc<Waiters>) {
   while let Some(signal) = results.next().await {
      let args = match signal.args() {
         Ok(args) => args,
         Err(e) => {
            warn!("Malformed SDP result: {e}");
            continue;
         },
      };
      let Ok(peer) = PeerAddress::parse(args.address()) else {
         warn!("SDP result for invalid address {}", args.address());
         continue;
      };
      let (service16, channel) = (*args.uuid16(), *args.channel());

      let delivered = waiters.deliver(peer, service16, channel);
      debug!("SDP result for {peer} uuid16 {service16:#06x}: channel {channel} ({delivered} waiting)");
   }
   warn!("Service directory result stream ended");
}
