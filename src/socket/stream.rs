//! Byte streams over a connected socket.
//!
//! Closing a stream shuts down only its own direction; the socket and the
//! opposite stream keep working until the socket itself is closed.

use std::{
   fmt,
   io::{self, Read, Write},
   sync::Arc,
};

use log::warn;

use crate::bluetooth::transport::Transport;

fn stream_closed() -> io::Error {
   io::Error::new(io::ErrorKind::NotConnected, "stream closed")
}

/// Reading half of an RFCOMM socket.
pub struct RfcommInputStream {
   transport: Arc<dyn Transport>,
   closed: bool,
}

impl RfcommInputStream {
   pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
      Self {
         transport,
         closed: false,
      }
   }

   /// Shuts down the input direction. Errors are logged, not returned.
   pub fn close(&mut self) {
      if self.closed {
         return;
      }
      self.closed = true;
      if let Err(e) = self.transport.shutdown_input() {
         warn!("Failed to shut down RFCOMM input: {e}");
      }
   }
}

impl Read for RfcommInputStream {
   fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
      if self.closed {
         return Err(stream_closed());
      }
      Ok(self.transport.read(buf)?)
   }
}

impl Drop for RfcommInputStream {
   fn drop(&mut self) {
      self.close();
   }
}

impl fmt::Debug for RfcommInputStream {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("RfcommInputStream")
         .field("closed", &self.closed)
         .finish_non_exhaustive()
   }
}

/// Writing half of an RFCOMM socket.
pub struct RfcommOutputStream {
   transport: Arc<dyn Transport>,
   closed: bool,
}

impl RfcommOutputStream {
   pub(crate) fn new(transport: Arc<dyn Transport>) -> Self {
      Self {
         transport,
         closed: false,
      }
   }

   /// Shuts down the output direction. Errors are logged, not returned.
   pub fn close(&mut self) {
      if self.closed {
         return;
      }
      self.closed = true;
      if let Err(e) = self.transport.shutdown_output() {
         warn!("Failed to shut down RFCOMM output: {e}");
      }
   }
}

impl Write for RfcommOutputStream {
   fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
      if self.closed {
         return Err(stream_closed());
      }
      Ok(self.transport.write(buf)?)
   }

   fn flush(&mut self) -> io::Result<()> {
      if self.closed {
         return Err(stream_closed());
      }
      Ok(self.transport.flush()?)
   }
}

impl Drop for RfcommOutputStream {
   fn drop(&mut self) {
      self.close();
   }
}

impl fmt::Debug for RfcommOutputStream {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      f.debug_struct("RfcommOutputStream")
         .field("closed", &self.closed)
         .finish_non_exhaustive()
   }
}
