//! Schema-backed settings store for persisted user preferences.
//!
//! Every key is declared up front with a typed default. Only values that
//! differ from their default are written to `settings.toml`. Subscribers are
//! told about every effective change, after the new value is visible.

use std::{
   collections::BTreeMap,
   fs,
   path::PathBuf,
   sync::Arc,
};

use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{DaemonError, Result};

/// A stored setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
   Bool(bool),
   Int(i64),
   Double(f64),
   Str(String),
   Strv(Vec<String>),
}

/// Schema default for a key; also fixes the key's type.
#[derive(Debug, Clone, Copy)]
pub enum DefaultValue {
   Bool(bool),
   Int(i64),
   Double(f64),
   Str(&'static str),
   Strv(&'static [&'static str]),
}

impl DefaultValue {
   fn to_value(self) -> SettingValue {
      match self {
         Self::Bool(v) => SettingValue::Bool(v),
         Self::Int(v) => SettingValue::Int(v),
         Self::Double(v) => SettingValue::Double(v),
         Self::Str(v) => SettingValue::Str(v.to_string()),
         Self::Strv(v) => SettingValue::Strv(v.iter().map(|s| s.to_string()).collect()),
      }
   }

   /// Converts `value` to this key's type, if compatible.
   fn coerce(self, value: SettingValue) -> Option<SettingValue> {
      match (self, value) {
         (Self::Bool(_), v @ SettingValue::Bool(_))
         | (Self::Int(_), v @ SettingValue::Int(_))
         | (Self::Double(_), v @ SettingValue::Double(_))
         | (Self::Str(_), v @ SettingValue::Str(_))
         | (Self::Strv(_), v @ SettingValue::Strv(_)) => Some(v),
         (Self::Double(_), SettingValue::Int(v)) => Some(SettingValue::Double(v as f64)),
         _ => None,
      }
   }
}

/// A key declaration in a settings schema.
#[derive(Debug, Clone, Copy)]
pub struct Key {
   pub name: &'static str,
   pub default: DefaultValue,
}

pub const fn key(name: &'static str, default: DefaultValue) -> Key {
   Key { name, default }
}

/// Who caused a settings change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
   /// Internal writers, resets and file edits.
   Local,
   /// A D-Bus property setter; the bus layer already announced the change.
   Bus,
}

type Watcher = Arc<dyn Fn(&str, ChangeOrigin) + Send + Sync>;

pub struct SettingsStore {
   path: Option<PathBuf>,
   schema: BTreeMap<&'static str, DefaultValue>,
   values: RwLock<BTreeMap<String, SettingValue>>,
   watchers: RwLock<Vec<(&'static str, Watcher)>>,
}

impl SettingsStore {
   /// Creates a store that never touches the disk.
   pub fn in_memory(schemas: &[&[Key]]) -> Self {
      Self {
         path: None,
         schema: schemas
            .iter()
            .flat_map(|s| s.iter())
            .map(|k| (k.name, k.default))
            .collect(),
         values: RwLock::new(BTreeMap::new()),
         watchers: RwLock::new(Vec::new()),
      }
   }

   /// Loads overrides from `path`; keys that are unknown or mistyped are
   /// dropped with a warning.
   pub fn load(path: PathBuf, schemas: &[&[Key]]) -> Result<Self> {
      let mut store = Self::in_memory(schemas);
      if path.exists() {
         let contents = fs::read_to_string(&path)?;
         let raw: BTreeMap<String, SettingValue> = toml::from_str(&contents)?;
         let mut values = BTreeMap::new();
         for (name, value) in raw {
            match store.schema.get(name.as_str()) {
               Some(default) => match default.coerce(value) {
                  Some(value) => {
                     values.insert(name, value);
                  },
                  None => warn!("Ignoring setting {name}: wrong type"),
               },
               None => warn!("Ignoring unknown setting {name}"),
            }
         }
         store.values = RwLock::new(values);
      }
      store.path = Some(path);
      Ok(store)
   }

   pub fn get(&self, name: &str) -> Result<SettingValue> {
      let default = self.default_of(name)?;
      Ok(self
         .values
         .read()
         .get(name)
         .cloned()
         .unwrap_or_else(|| default.to_value()))
   }

   pub fn get_bool(&self, name: &str) -> Result<bool> {
      match self.get(name)? {
         SettingValue::Bool(v) => Ok(v),
         _ => Err(DaemonError::SettingType(name.to_string())),
      }
   }

   pub fn get_int(&self, name: &str) -> Result<i64> {
      match self.get(name)? {
         SettingValue::Int(v) => Ok(v),
         _ => Err(DaemonError::SettingType(name.to_string())),
      }
   }

   pub fn get_double(&self, name: &str) -> Result<f64> {
      match self.get(name)? {
         SettingValue::Double(v) => Ok(v),
         _ => Err(DaemonError::SettingType(name.to_string())),
      }
   }

   pub fn get_string(&self, name: &str) -> Result<String> {
      match self.get(name)? {
         SettingValue::Str(v) => Ok(v),
         _ => Err(DaemonError::SettingType(name.to_string())),
      }
   }

   pub fn get_strv(&self, name: &str) -> Result<Vec<String>> {
      match self.get(name)? {
         SettingValue::Strv(v) => Ok(v),
         _ => Err(DaemonError::SettingType(name.to_string())),
      }
   }

   /// Stores a value. Returns whether the effective value changed.
   pub fn set(&self, name: &str, value: SettingValue) -> Result<bool> {
      self.set_from(name, value, ChangeOrigin::Local)
   }

   pub fn set_from(&self, name: &str, value: SettingValue, origin: ChangeOrigin) -> Result<bool> {
      let default = self.default_of(name)?;
      let value = default
         .coerce(value)
         .ok_or_else(|| DaemonError::SettingType(name.to_string()))?;
      let default = default.to_value();

      {
         let mut values = self.values.write();
         let current = values.get(name).unwrap_or(&default);
         if *current == value {
            return Ok(false);
         }
         if value == default {
            values.remove(name);
         } else {
            values.insert(name.to_string(), value);
         }
      }

      if let Err(e) = self.persist() {
         warn!("Failed to save settings: {e}");
      }
      self.notify(name, origin);
      Ok(true)
   }

   /// Restores the schema default.
   pub fn reset(&self, name: &str) -> Result<bool> {
      let default = self.default_of(name)?;
      self.set_from(name, default.to_value(), ChangeOrigin::Local)
   }

   /// Registers `f` for changes of every key starting with `prefix`.
   pub fn connect_changed(
      &self,
      prefix: &'static str,
      f: impl Fn(&str, ChangeOrigin) + Send + Sync + 'static,
   ) {
      self.watchers.write().push((prefix, Arc::new(f)));
   }

   fn default_of(&self, name: &str) -> Result<DefaultValue> {
      self
         .schema
         .get(name)
         .copied()
         .ok_or_else(|| DaemonError::UnknownSetting(name.to_string()))
   }

   fn notify(&self, name: &str, origin: ChangeOrigin) {
      let watchers: Vec<Watcher> = self
         .watchers
         .read()
         .iter()
         .filter(|(prefix, _)| name.starts_with(prefix))
         .map(|(_, w)| w.clone())
         .collect();
      for watcher in watchers {
         watcher(name, origin);
      }
   }

   fn persist(&self) -> Result<()> {
      let Some(path) = &self.path else {
         return Ok(());
      };
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      let contents = toml::to_string_pretty(&*self.values.read())?;
      fs::write(path, contents)?;
      Ok(())
   }
}
