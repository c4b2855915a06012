//! Configuration management for the RFCOMM daemon.
//!
//! This module handles loading and saving configuration from disk,
//! including the services to listen for and the discovery timeouts.

use std::{
   env, fs,
   path::{Path, PathBuf},
   time::Duration,
};

use serde::{Deserialize, Serialize};
use smol_str::SmolStr;

use crate::{
   bluetooth::address::ServiceId,
   error::{Result, RfcommError},
   sdp::{policy::ChannelPolicy, resolver::LOOKUP_TIMEOUT},
};

/// Main configuration structure for the daemon.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Config {
   /// Adapter name such as `hci0`; the default adapter when unset.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub adapter: Option<String>,

   #[serde(default = "default_lookup_timeout")]
   pub lookup_timeout_ms: u64,

   /// Negative blocks forever.
   #[serde(default = "default_accept_timeout")]
   pub accept_timeout_ms: i32,

   #[serde(default)]
   pub channel_policy: ChannelPolicy,

   #[serde(default = "default_echo_buffer_size")]
   pub echo_buffer_size: usize,

   #[serde(default)]
   pub services: Vec<ServiceEntry>,
}

/// A service the daemon listens for.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServiceEntry {
   pub name: SmolStr,
   pub uuid: ServiceId,
}

const fn default_lookup_timeout() -> u64 {
   LOOKUP_TIMEOUT.as_millis() as u64
}

const fn default_accept_timeout() -> i32 {
   -1
}

const fn default_echo_buffer_size() -> usize {
   1024
}

impl Default for Config {
   fn default() -> Self {
      Self {
         adapter: None,
         lookup_timeout_ms: default_lookup_timeout(),
         accept_timeout_ms: default_accept_timeout(),
         channel_policy: ChannelPolicy::default(),
         echo_buffer_size: default_echo_buffer_size(),
         services: vec![ServiceEntry {
            name: SmolStr::new_static("serial"),
            uuid: ServiceId::SERIAL_PORT,
         }],
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(&Self::config_path()?)
   }

   pub fn load_from(path: &Path) -> Result<Self> {
      if path.exists() {
         let contents = fs::read_to_string(path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         // Create default config
         let config = Self::default();
         config.save_to(path)?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      self.save_to(&Self::config_path()?)
   }

   pub fn save_to(&self, path: &Path) -> Result<()> {
      // Ensure directory exists
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_path() -> Result<PathBuf> {
      if let Ok(home) = env::var("RFCOMMD_HOME") {
         return Ok(PathBuf::from(home).join("config.toml"));
      }
      let config_dir = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else {
         dirs::config_dir().ok_or(RfcommError::ConfigDirNotFound)?
      };

      Ok(config_dir.join("rfcommd").join("config.toml"))
   }

   pub const fn lookup_timeout(&self) -> Duration {
      Duration::from_millis(self.lookup_timeout_ms)
   }

   /// `None` means wait forever.
   pub fn accept_timeout(&self) -> Option<Duration> {
      u64::try_from(self.accept_timeout_ms)
         .ok()
         .map(Duration::from_millis)
   }
}
