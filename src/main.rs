//! RFCOMM echo daemon
//!
//! Listens for every service in the configuration and echoes back whatever a
//! connected peer sends. Useful for exercising the channel resolution and
//! socket lifecycle against real hardware.

use std::{
   collections::HashMap,
   io::{Read, Write},
   sync::{
      Arc,
      atomic::{AtomicU64, Ordering},
   },
   thread::{self, JoinHandle},
   time::Duration,
};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::{signal, task};

use rfcommd::{
   Config, RfcommError, RfcommListener, RfcommSocket, Result, ServiceAdapter,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting rfcommd...");

   // Load configuration
   let config = Config::load()?;
   info!(
      "Loaded configuration with {} services",
      config.services.len()
   );

   let adapter = Arc::new(ServiceAdapter::default_adapter(&config).await?);

   // Socket calls block, keep them off the runtime threads
   let listeners = {
      let adapter = adapter.clone();
      let services = config.services.clone();
      task::spawn_blocking(move || {
         services
            .iter()
            .filter_map(|entry| {
               match adapter.listen_with_service_record(&entry.name, entry.uuid) {
                  Ok(listener) => Some(Arc::new(listener)),
                  Err(e) => {
                     error!("Failed to listen for {} ({}): {e}", entry.name, entry.uuid);
                     None
                  },
               }
            })
            .collect::<Vec<_>>()
      })
      .await?
   };

   if listeners.is_empty() {
      warn!("No service could be published, exiting");
      return Ok(());
   }

   let server = EchoServer::new(config.echo_buffer_size, config.accept_timeout_ms);
   let accept_loops: Vec<_> = listeners
      .iter()
      .map(|listener| server.spawn_accept_loop(listener.clone()))
      .collect();

   info!("rfcommd serving {} services", listeners.len());
   for record in adapter.records() {
      info!(
         "  {} ({}) on channel {}",
         record.name, record.service, record.channel
      );
   }

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down rfcommd...");

   task::spawn_blocking(move || {
      for listener in &listeners {
         listener.close();
      }
      for handle in accept_loops {
         if handle.join().is_err() {
            error!("Accept loop panicked");
         }
      }
      server.shutdown();
   })
   .await?;

   Ok(())
}

/// Serves accepted connections by writing every received chunk back.
struct EchoServer {
   buffer_size: usize,
   accept_timeout_ms: i32,
   next_id: AtomicU64,
   active: Mutex<HashMap<u64, Arc<RfcommSocket>>>,
   workers: Workers,
}

impl EchoServer {
   fn new(buffer_size: usize, accept_timeout_ms: i32) -> Arc<Self> {
      Arc::new(Self {
         buffer_size: buffer_size.max(1),
         accept_timeout_ms,
         next_id: AtomicU64::new(0),
         active: Mutex::new(HashMap::new()),
         workers: Workers::default(),
      })
   }

   fn spawn_accept_loop(self: &Arc<Self>, listener: Arc<RfcommListener>) -> JoinHandle<()> {
      let server = self.clone();
      thread::spawn(move || server.accept_loop(&listener))
   }

   fn accept_loop(self: Arc<Self>, listener: &RfcommListener) {
      loop {
         match listener.accept_millis(self.accept_timeout_ms) {
            Ok(socket) => self.spawn_worker(listener.name(), socket),
            Err(RfcommError::SocketClosed) => break,
            Err(e) if e.is_retryable() => {
               debug!("{}: accept returned {e}, retrying", listener.name());
               // Avoid spinning on a persistently failing listener
               thread::sleep(Duration::from_millis(100));
            },
            Err(e) => {
               error!("{}: accept failed: {e}", listener.name());
               break;
            },
         }
      }
      debug!("Accept loop for {} finished", listener.name());
   }

   fn spawn_worker(self: &Arc<Self>, service: &str, socket: RfcommSocket) {
      let id = self.next_id.fetch_add(1, Ordering::Relaxed);
      let socket = Arc::new(socket);
      self.active.lock().insert(id, socket.clone());

      let server = self.clone();
      let service = service.to_string();
      self.workers.spawn(move || {
         if let Err(e) = server.echo(&socket) {
            if socket.is_closed() {
               debug!("{service}: connection {id} closed");
            } else {
               warn!("{service}: connection {id} failed: {e}");
            }
         }
         socket.close();
         server.active.lock().remove(&id);
      });
   }

   fn echo(&self, socket: &RfcommSocket) -> Result<()> {
      let peer = socket
         .remote_address()
         .map_or_else(|| "unknown peer".to_string(), |p| p.to_string());
      let mut input = socket.input_stream()?;
      let mut output = socket.output_stream()?;
      let mut buf = vec![0u8; self.buffer_size];

      info!("Echoing for {peer}");
      loop {
         let n = input.read(&mut buf)?;
         if n == 0 {
            info!("{peer} disconnected");
            return Ok(());
         }
         debug!("{peer} -> {}", hex::encode(&buf[..n]));
         output.write_all(&buf[..n])?;
         output.flush()?;
      }
   }

   /// Closes every live connection and waits for the workers.
   fn shutdown(&self) {
      let active: Vec<_> = self.active.lock().drain().map(|(_, s)| s).collect();
      for socket in active {
         socket.close();
      }
      self.workers.join_all();
   }
}

/// Echo worker threads. Finished workers are joined whenever a new one is
/// spawned, so a long-running daemon does not pile up handles.
#[derive(Default)]
struct Workers(Mutex<Vec<JoinHandle<()>>>);

impl Workers {
   fn spawn(&self, work: impl FnOnce() + Send + 'static) {
      self.reap();
      self.0.lock().push(thread::spawn(work));
   }

   /// Joins the workers that have already finished.
   fn reap(&self) -> usize {
      let finished: Vec<_> = {
         let mut workers = self.0.lock();
         let (finished, running): (Vec<_>, Vec<_>) =
            workers.drain(..).partition(JoinHandle::is_finished);
         *workers = running;
         finished
      };
      let count = finished.len();
      for worker in finished {
         join_worker(worker);
      }
      count
   }

   fn join_all(&self) {
      let workers = std::mem::take(&mut *self.0.lock());
      for worker in workers {
         join_worker(worker);
      }
   }

   #[cfg(test)]
   fn len(&self) -> usize {
      self.0.lock().len()
   }
}

fn join_worker(worker: JoinHandle<()>) {
   if worker.join().is_err() {
      error!("Echo worker panicked");
   }
}
