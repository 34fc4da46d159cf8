//! Battery warn-level thresholds.
//!
//! The thresholds are plain settings keys. Any change notifies the change
//! callback and re-arms a revalidation timer; if the thresholds are still
//! out of order when it fires, every key goes back to its default.

use std::{
   sync::{Arc, Weak},
   time::Duration,
};

use log::{debug, info, warn};
use parking_lot::Mutex;

use crate::{
   error::{DaemonError, Result},
   event::{BusObject, Event, EventSender},
   settings::{ChangeOrigin, DefaultValue, Key, SettingValue, SettingsStore, key},
   timer::OneShotTimer,
};

pub const USE_PERCENTAGE_FOR_POLICY: &str = "power.use-percentage-for-policy";
pub const LOW_TIME: &str = "power.low-time";
pub const DANGER_TIME: &str = "power.danger-time";
pub const CRITICAL_TIME: &str = "power.critical-time";
pub const ACTION_TIME: &str = "power.action-time";
pub const LOW_POWER_NOTIFY_THRESHOLD: &str = "power.low-power-notify-threshold";
pub const LOW_PERCENTAGE: &str = "power.percentage-low";
pub const DANGER_PERCENTAGE: &str = "power.percentage-danger";
pub const CRITICAL_PERCENTAGE: &str = "power.percentage-critical";
pub const ACTION_PERCENTAGE: &str = "power.percentage-action";

pub const SCHEMA: &[Key] = &[
   key(USE_PERCENTAGE_FOR_POLICY, DefaultValue::Bool(true)),
   key(LOW_TIME, DefaultValue::Int(1200)),
   key(DANGER_TIME, DefaultValue::Int(900)),
   key(CRITICAL_TIME, DefaultValue::Int(600)),
   key(ACTION_TIME, DefaultValue::Int(300)),
   key(LOW_POWER_NOTIFY_THRESHOLD, DefaultValue::Int(20)),
   key(LOW_PERCENTAGE, DefaultValue::Int(20)),
   key(DANGER_PERCENTAGE, DefaultValue::Int(15)),
   key(CRITICAL_PERCENTAGE, DefaultValue::Int(10)),
   key(ACTION_PERCENTAGE, DefaultValue::Int(5)),
];

/// Bus property name of every threshold, paired with its settings key.
pub const LEVELS: &[(&str, &str)] = &[
   ("UsePercentageForPolicy", USE_PERCENTAGE_FOR_POLICY),
   ("LowTime", LOW_TIME),
   ("DangerTime", DANGER_TIME),
   ("CriticalTime", CRITICAL_TIME),
   ("ActionTime", ACTION_TIME),
   ("LowPowerNotifyThreshold", LOW_POWER_NOTIFY_THRESHOLD),
   ("LowPercentage", LOW_PERCENTAGE),
   ("DangerPercentage", DANGER_PERCENTAGE),
   ("CriticalPercentage", CRITICAL_PERCENTAGE),
   ("ActionPercentage", ACTION_PERCENTAGE),
];

pub const REVALIDATE_DELAY: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum WarnLevel {
   None,
   Low,
   Danger,
   Critical,
   Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WarnLevelConfig {
   pub use_percentage_for_policy: bool,
   pub low_time: i64,
   pub danger_time: i64,
   pub critical_time: i64,
   pub action_time: i64,
   pub low_power_notify_threshold: i64,
   pub low_percentage: i64,
   pub danger_percentage: i64,
   pub critical_percentage: i64,
   pub action_percentage: i64,
}

impl WarnLevelConfig {
   /// Only the time thresholds are checked. The percentages are free-form
   /// and never trigger a reset.
   pub fn is_valid(&self) -> bool {
      self.low_time > self.danger_time
         && self.danger_time > self.critical_time
         && self.critical_time > self.action_time
   }

   /// Classifies a battery reading. `time_to_empty` is in seconds; zero
   /// means unknown.
   pub fn level(&self, percentage: f64, time_to_empty: u64) -> WarnLevel {
      if self.use_percentage_for_policy {
         let at_most = |threshold: i64| percentage <= threshold as f64;
         if at_most(self.action_percentage) {
            WarnLevel::Action
         } else if at_most(self.critical_percentage) {
            WarnLevel::Critical
         } else if at_most(self.danger_percentage) {
            WarnLevel::Danger
         } else if at_most(self.low_percentage) {
            WarnLevel::Low
         } else {
            WarnLevel::None
         }
      } else {
         if time_to_empty == 0 {
            return WarnLevel::None;
         }
         let at_most = |threshold: i64| time_to_empty as i64 <= threshold;
         if at_most(self.action_time) {
            WarnLevel::Action
         } else if at_most(self.critical_time) {
            WarnLevel::Critical
         } else if at_most(self.danger_time) {
            WarnLevel::Danger
         } else if at_most(self.low_time) {
            WarnLevel::Low
         } else {
            WarnLevel::None
         }
      }
   }
}

type ChangeCallback = Arc<dyn Fn(&WarnLevelConfig) + Send + Sync>;

pub struct WarnLevelManager {
   settings: Arc<SettingsStore>,
   bus: EventSender,
   check_timer: Arc<OneShotTimer>,
   on_change: Mutex<Option<ChangeCallback>>,
}

impl WarnLevelManager {
   pub fn new(settings: Arc<SettingsStore>, bus: EventSender) -> Arc<Self> {
      let manager = Arc::new_cyclic(|weak: &Weak<Self>| {
         let weak = weak.clone();
         Self {
            settings,
            bus,
            check_timer: OneShotTimer::new("warn-level", move || {
               let weak = weak.clone();
               async move {
                  if let Some(manager) = weak.upgrade() {
                     manager.revalidate();
                  }
               }
            }),
            on_change: Mutex::new(None),
         }
      });

      let weak = Arc::downgrade(&manager);
      manager.settings.connect_changed("power.", move |name, origin| {
         if let Some(manager) = weak.upgrade() {
            manager.on_setting_changed(name, origin);
         }
      });
      manager
   }

   pub fn set_change_callback(&self, f: impl Fn(&WarnLevelConfig) + Send + Sync + 'static) {
      *self.on_change.lock() = Some(Arc::new(f));
   }

   pub fn config(&self) -> Result<WarnLevelConfig> {
      let s = &self.settings;
      Ok(WarnLevelConfig {
         use_percentage_for_policy: s.get_bool(USE_PERCENTAGE_FOR_POLICY)?,
         low_time: s.get_int(LOW_TIME)?,
         danger_time: s.get_int(DANGER_TIME)?,
         critical_time: s.get_int(CRITICAL_TIME)?,
         action_time: s.get_int(ACTION_TIME)?,
         low_power_notify_threshold: s.get_int(LOW_POWER_NOTIFY_THRESHOLD)?,
         low_percentage: s.get_int(LOW_PERCENTAGE)?,
         danger_percentage: s.get_int(DANGER_PERCENTAGE)?,
         critical_percentage: s.get_int(CRITICAL_PERCENTAGE)?,
         action_percentage: s.get_int(ACTION_PERCENTAGE)?,
      })
   }

   pub fn get(&self, property: &str) -> Result<SettingValue> {
      self.settings.get(key_of(property)?)
   }

   pub fn set(&self, property: &str, value: SettingValue, origin: ChangeOrigin) -> Result<bool> {
      self.settings.set_from(key_of(property)?, value, origin)
   }

   pub fn reset(&self) {
      for key in SCHEMA {
         if let Err(e) = self.settings.reset(key.name) {
            warn!("Failed to reset {}: {e}", key.name);
         }
      }
   }

   pub fn shutdown(&self) {
      self.check_timer.stop();
   }

   fn on_setting_changed(&self, name: &str, origin: ChangeOrigin) {
      let Some((property, _)) = LEVELS.iter().find(|(_, key)| *key == name) else {
         return;
      };
      debug!("warn level {property} changed");
      if origin == ChangeOrigin::Local {
         self
            .bus
            .emit(Event::PropertyChanged(BusObject::WarnLevel, *property));
      }

      let callback = self.on_change.lock().clone();
      if let Some(callback) = callback {
         match self.config() {
            Ok(config) => callback(&config),
            Err(e) => warn!("Failed to read warn levels: {e}"),
         }
      }

      if tokio::runtime::Handle::try_current().is_ok() {
         self.check_timer.reset(REVALIDATE_DELAY);
      }
   }

   fn revalidate(&self) {
      match self.config() {
         Ok(config) if config.is_valid() => debug!("warn levels valid"),
         Ok(config) => {
            info!("Warn level config is invalid, resetting: {config:?}");
            self.reset();
         },
         Err(e) => warn!("Failed to read warn levels: {e}"),
      }
   }
}

fn key_of(property: &str) -> Result<&'static str> {
   LEVELS
      .iter()
      .find(|(name, _)| *name == property)
      .map(|(_, key)| *key)
      .ok_or_else(|| DaemonError::UnknownSetting(property.to_string()))
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::{AtomicUsize, Ordering};

   use tokio::time;

   use super::*;
   use crate::event::testing::RecordingBus;

   fn manager() -> (Arc<SettingsStore>, Arc<RecordingBus>, Arc<WarnLevelManager>) {
      let settings = Arc::new(SettingsStore::in_memory(&[SCHEMA]));
      let bus = RecordingBus::new();
      let manager = WarnLevelManager::new(settings.clone(), bus.clone());
      (settings, bus, manager)
   }

   #[tokio::test]
   async fn test_defaults_are_valid() {
      let (_, _, manager) = manager();
      assert!(manager.config().unwrap().is_valid());
   }

   #[test]
   fn test_validity_rule() {
      let mut config = WarnLevelConfig {
         use_percentage_for_policy: true,
         low_time: 1200,
         danger_time: 900,
         critical_time: 600,
         action_time: 300,
         low_power_notify_threshold: 20,
         low_percentage: 20,
         danger_percentage: 15,
         critical_percentage: 10,
         action_percentage: 5,
      };
      assert!(config.is_valid());
      config.low_percentage = 30;
      config.action_percentage = 40;
      assert!(config.is_valid());
      config.action_time = 600;
      assert!(!config.is_valid());
   }

   #[tokio::test(start_paused = true)]
   async fn test_invalid_levels_reset_after_delay() {
      let (settings, _, manager) = manager();
      let calls = Arc::new(AtomicUsize::new(0));
      {
         let calls = calls.clone();
         manager.set_change_callback(move |_| {
            calls.fetch_add(1, Ordering::SeqCst);
         });
      }

      settings.set(CRITICAL_TIME, SettingValue::Int(2000)).unwrap();
      assert_eq!(calls.load(Ordering::SeqCst), 1);

      time::sleep(Duration::from_secs(15)).await;
      // Another change pushes the check back.
      settings.set(LOW_PERCENTAGE, SettingValue::Int(18)).unwrap();
      time::sleep(Duration::from_secs(15)).await;
      assert_eq!(settings.get_int(CRITICAL_TIME).unwrap(), 2000);

      time::sleep(Duration::from_secs(6)).await;
      assert_eq!(settings.get_int(CRITICAL_TIME).unwrap(), 600);
      assert_eq!(settings.get_int(LOW_PERCENTAGE).unwrap(), 20);
      assert!(manager.config().unwrap().is_valid());
      // Two edits plus the two keys the reset restored.
      assert_eq!(calls.load(Ordering::SeqCst), 4);
   }

   #[tokio::test(start_paused = true)]
   async fn test_valid_levels_survive() {
      let (settings, bus, manager) = manager();
      manager
         .set("LowTime", SettingValue::Int(1500), ChangeOrigin::Bus)
         .unwrap();
      settings.set(LOW_POWER_NOTIFY_THRESHOLD, SettingValue::Int(30)).unwrap();
      time::sleep(REVALIDATE_DELAY * 2).await;

      assert_eq!(manager.get("LowTime").unwrap(), SettingValue::Int(1500));
      assert_eq!(bus.events(), vec![Event::PropertyChanged(
         BusObject::WarnLevel,
         "LowPowerNotifyThreshold"
      )]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_custom_percentage_keeps_custom_times() {
      let (settings, _, manager) = manager();
      settings.set(LOW_TIME, SettingValue::Int(1800)).unwrap();
      settings.set(LOW_PERCENTAGE, SettingValue::Int(30)).unwrap();
      time::sleep(REVALIDATE_DELAY + Duration::from_secs(1)).await;

      assert_eq!(settings.get_int(LOW_TIME).unwrap(), 1800);
      assert_eq!(settings.get_int(LOW_PERCENTAGE).unwrap(), 30);
      assert!(manager.config().unwrap().is_valid());
   }

   #[tokio::test]
   async fn test_reset_restores_defaults() {
      let (settings, _, manager) = manager();
      settings.set(ACTION_PERCENTAGE, SettingValue::Int(2)).unwrap();
      manager.reset();
      assert_eq!(settings.get_int(ACTION_PERCENTAGE).unwrap(), 5);
      assert!(manager.set("Bogus", SettingValue::Int(1), ChangeOrigin::Bus).is_err());
   }

   #[tokio::test]
   async fn test_level_classification() {
      let (settings, _, manager) = manager();
      let config = manager.config().unwrap();
      assert_eq!(config.level(80.0, 0), WarnLevel::None);
      assert_eq!(config.level(20.0, 0), WarnLevel::Low);
      assert_eq!(config.level(12.0, 0), WarnLevel::Danger);
      assert_eq!(config.level(10.0, 0), WarnLevel::Critical);
      assert_eq!(config.level(3.0, 0), WarnLevel::Action);

      settings
         .set(USE_PERCENTAGE_FOR_POLICY, SettingValue::Bool(false))
         .unwrap();
      let config = manager.config().unwrap();
      assert_eq!(config.level(3.0, 0), WarnLevel::None);
      assert_eq!(config.level(3.0, 1000), WarnLevel::Low);
      assert_eq!(config.level(3.0, 250), WarnLevel::Action);
   }
}
