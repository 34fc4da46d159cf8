//! Configuration management for the daemons.
//!
//! This module handles loading and saving `config.toml`, which holds the
//! bluetooth timing parameters, remembered adapter power states and the
//! gesture table locations.

use std::{collections::BTreeMap, env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct Config {
   #[serde(default)]
   pub bluetooth: BluetoothConfig,

   #[serde(default)]
   pub gesture: GestureConfig,

   /// Where this configuration was loaded from; `None` keeps it in memory.
   #[serde(skip)]
   path: Option<PathBuf>,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct BluetoothConfig {
   #[serde(default = "default_discovery_timeout")]
   pub discovery_timeout_sec: u64,

   #[serde(default = "default_find_device_timeout")]
   pub find_device_timeout_ms: u64,

   #[serde(default = "default_true")]
   pub discoverable: bool,

   /// Last power state requested per adapter address.
   #[serde(default)]
   pub adapters: BTreeMap<String, AdapterConfig>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AdapterConfig {
   pub powered: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct GestureConfig {
   #[serde(default)]
   pub user_file: Option<PathBuf>,

   #[serde(default = "default_system_gesture_file")]
   pub system_file: PathBuf,
}

const fn default_discovery_timeout() -> u64 {
   60
}

const fn default_find_device_timeout() -> u64 {
   1000
}

const fn default_true() -> bool {
   true
}

fn default_system_gesture_file() -> PathBuf {
   PathBuf::from("/usr/share/desktopd/gesture.json")
}

impl Default for BluetoothConfig {
   fn default() -> Self {
      Self {
         discovery_timeout_sec: default_discovery_timeout(),
         find_device_timeout_ms: default_find_device_timeout(),
         discoverable: default_true(),
         adapters: BTreeMap::new(),
      }
   }
}

impl BluetoothConfig {
   pub const fn discovery_timeout(&self) -> Duration {
      Duration::from_secs(self.discovery_timeout_sec)
   }

   pub const fn find_device_timeout(&self) -> Duration {
      Duration::from_millis(self.find_device_timeout_ms)
   }

   pub fn adapter_powered(&self, address: &str) -> Option<bool> {
      self.adapters.get(address).map(|a| a.powered)
   }

   pub fn set_adapter_powered(&mut self, address: &str, powered: bool) {
      self
         .adapters
         .insert(address.to_string(), AdapterConfig { powered });
   }
}

impl Default for GestureConfig {
   fn default() -> Self {
      Self {
         user_file: None,
         system_file: default_system_gesture_file(),
      }
   }
}

impl GestureConfig {
   /// The per-user gesture table, written back on every update.
   pub fn user_file(&self) -> Result<PathBuf> {
      match &self.user_file {
         Some(path) => Ok(path.clone()),
         None => Ok(Config::config_dir()?.join("gesture.json")),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      Self::load_from(Self::config_dir()?.join("config.toml"))
   }

   pub fn load_from(path: PathBuf) -> Result<Self> {
      let mut config = if path.exists() {
         let contents = fs::read_to_string(&path)?;
         toml::from_str(&contents)?
      } else {
         Self::default()
      };
      let fresh = !path.exists();
      config.path = Some(path);
      if fresh {
         config.save()?;
      }
      Ok(config)
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let Some(path) = &self.path else {
         return Ok(());
      };

      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(path, contents)?;

      Ok(())
   }

   pub fn config_dir() -> Result<PathBuf> {
      if let Ok(home) = env::var("DESKTOPD_HOME") {
         return Ok(PathBuf::from(home));
      }

      let config_dir = if let Some(config_home) = dirs::config_dir() {
         config_home
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(DaemonError::ConfigDirNotFound);
      };

      Ok(config_dir.join("desktopd"))
   }
}
