//! D-Bus interfaces.
//!
//! Every interface is a thin adapter over its manager. Faults come from
//! `From<DaemonError> for zbus::fdo::Error`; property setters write with
//! [`ChangeOrigin::Bus`](crate::settings::ChangeOrigin::Bus) because zbus
//! announces the change itself.

pub mod bluetooth;
pub mod gesture;
pub mod input;
pub mod power;
pub mod session;

use zbus::zvariant::OwnedObjectPath;

use crate::{error::Result, settings::SettingValue};

pub const SERVICE_NAME: &str = "org.desktopd";

pub const BLUETOOTH_PATH: &str = "/org/desktopd/Bluetooth";
pub const SESSION_WATCHER_PATH: &str = "/org/desktopd/SessionWatcher";
pub const GESTURE_PATH: &str = "/org/desktopd/Gesture";
pub const TOUCHPAD_PATH: &str = "/org/desktopd/InputDevice/Touchpad";
pub const POWER_PATH: &str = "/org/desktopd/Power";

pub(crate) fn object_path(path: &str) -> Result<OwnedObjectPath> {
   Ok(OwnedObjectPath::try_from(path.to_string()).map_err(zbus::Error::from)?)
}

pub(crate) fn setting_bool(value: SettingValue) -> zbus::fdo::Result<bool> {
   match value {
      SettingValue::Bool(v) => Ok(v),
      other => Err(type_mismatch(&other)),
   }
}

pub(crate) fn setting_int(value: SettingValue) -> zbus::fdo::Result<i32> {
   match value {
      SettingValue::Int(v) => {
         i32::try_from(v).map_err(|_| zbus::fdo::Error::Failed(format!("{v} is out of range")))
      },
      other => Err(type_mismatch(&other)),
   }
}

pub(crate) fn setting_double(value: SettingValue) -> zbus::fdo::Result<f64> {
   match value {
      SettingValue::Double(v) => Ok(v),
      SettingValue::Int(v) => Ok(v as f64),
      other => Err(type_mismatch(&other)),
   }
}

fn type_mismatch(value: &SettingValue) -> zbus::fdo::Error {
   zbus::fdo::Error::Failed(format!("unexpected setting value {value:?}"))
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_setting_conversions() {
      assert!(setting_bool(SettingValue::Bool(true)).unwrap());
      assert_eq!(setting_int(SettingValue::Int(400)).unwrap(), 400);
      assert!(setting_int(SettingValue::Int(i64::MAX)).is_err());
      assert_eq!(setting_double(SettingValue::Int(2)).unwrap(), 2.0);
      assert!(setting_bool(SettingValue::Str("x".into())).is_err());
   }

   #[test]
   fn test_object_path() {
      assert_eq!(object_path("/org/bluez/hci0").unwrap().as_str(), "/org/bluez/hci0");
      assert!(object_path("not a path").is_err());
   }
}
