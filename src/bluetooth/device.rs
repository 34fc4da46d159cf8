//! Mirrored BlueZ device.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Serialize, Serializer};
use smol_str::SmolStr;
use strum::{AsRefStr, Display};
use tokio::task::JoinHandle;

use crate::{
   bluetooth::remote::{DeviceHandle, DeviceProp, DeviceProxy},
   error::Result,
   event::{Event, EventSender},
   property::{PropertySink, PropertyStore, PropertyValue},
};

/// Local view of a device's connection progress.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Display, AsRefStr)]
pub enum ConnectState {
   #[default]
   Disconnected = 0,
   Connecting = 1,
   Connected = 2,
}

impl Serialize for ConnectState {
   fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
      serializer.serialize_u32(*self as u32)
   }
}

impl PropertyValue for ConnectState {
   fn same_as(&self, other: &Self) -> bool {
      self == other
   }
}

/// Published device state. Also used verbatim as the backup snapshot entry.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceProps {
   pub path: SmolStr,
   pub adapter_path: SmolStr,
   pub address: String,
   pub alias: String,
   pub name: String,
   pub icon: String,
   pub paired: bool,
   pub trusted: bool,
   pub connected: bool,
   #[serde(rename = "RSSI")]
   pub rssi: i16,
   pub state: ConnectState,

   /// Set when removal was requested while a connect was in flight.
   #[serde(skip)]
   pub needs_removal: bool,
}

/// Republishes every device property change as `DevicePropertiesChanged`.
struct DeviceSink {
   bus: EventSender,
}

impl PropertySink<DeviceProps> for DeviceSink {
   fn changed(&self, path: &str, name: &'static str, state: &DeviceProps) {
      debug!("{path} {name} changed");
      match serde_json::to_string(state) {
         Ok(json) => self.bus.emit(Event::DevicePropertiesChanged(json)),
         Err(e) => warn!("Failed to serialize device {path}: {e}"),
      }
   }
}

pub struct Device {
   proxy: DeviceHandle,
   props: PropertyStore<DeviceProps>,
   monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
   /// Builds the mirror, reading every property once. Failed reads keep the
   /// default value.
   pub async fn new(
      path: SmolStr,
      adapter_path: SmolStr,
      proxy: DeviceHandle,
      bus: EventSender,
   ) -> Arc<Self> {
      let connected = proxy.is_connected().await.unwrap_or_default();
      let props = DeviceProps {
         path: path.clone(),
         adapter_path,
         address: proxy.address().to_string(),
         alias: proxy.alias().await.unwrap_or_default(),
         name: proxy.name().await.ok().flatten().unwrap_or_default(),
         icon: proxy.icon().await.ok().flatten().unwrap_or_default(),
         paired: proxy.is_paired().await.unwrap_or_default(),
         trusted: proxy.is_trusted().await.unwrap_or_default(),
         connected,
         rssi: proxy.rssi().await.ok().flatten().unwrap_or_default(),
         state: if connected {
            ConnectState::Connected
         } else {
            ConnectState::Disconnected
         },
         needs_removal: false,
      };

      Arc::new(Self {
         proxy,
         props: PropertyStore::new(path, props, Arc::new(DeviceSink { bus })),
         monitor: Mutex::new(None),
      })
   }

   pub fn path(&self) -> &SmolStr {
      self.props.path()
   }

   pub fn proxy(&self) -> &DeviceHandle {
      &self.proxy
   }

   pub fn snapshot(&self) -> DeviceProps {
      self.props.snapshot()
   }

   pub fn to_json(&self) -> String {
      self
         .props
         .read(|p| serde_json::to_string(p))
         .unwrap_or_default()
   }

   pub fn state(&self) -> ConnectState {
      self.props.read(|p| p.state)
   }

   pub fn is_paired(&self) -> bool {
      self.props.read(|p| p.paired)
   }

   pub fn is_connected(&self) -> bool {
      self.props.read(|p| p.connected)
   }

   pub fn address(&self) -> String {
      self.props.read(|p| p.address.clone())
   }

   pub(crate) fn set_monitor(&self, handle: JoinHandle<()>) {
      if let Some(old) = self.monitor.lock().replace(handle) {
         old.abort();
      }
   }

   /// Applies a remote property change. Returns whether anything changed.
   pub fn apply(&self, prop: DeviceProp) -> bool {
      let props = &self.props;
      match prop {
         DeviceProp::Name(v) => props.set("Name", |p| &mut p.name, v).is_updated(),
         DeviceProp::Alias(v) => props.set("Alias", |p| &mut p.alias, v).is_updated(),
         DeviceProp::Icon(v) => props.set("Icon", |p| &mut p.icon, v).is_updated(),
         DeviceProp::Paired(v) => props.set("Paired", |p| &mut p.paired, v).is_updated(),
         DeviceProp::Trusted(v) => props.set("Trusted", |p| &mut p.trusted, v).is_updated(),
         DeviceProp::Rssi(v) => props.set("RSSI", |p| &mut p.rssi, v).is_updated(),
         DeviceProp::Connected(v) => {
            let changed = props.set("Connected", |p| &mut p.connected, v).is_updated();
            // A disconnect reported mid-attempt belongs to the attempt; its
            // result settles the state.
            props
               .set_derived("State", |p| &mut p.state, |p| match (v, p.state) {
                  (true, _) => ConnectState::Connected,
                  (false, ConnectState::Connecting) => ConnectState::Connecting,
                  (false, _) => ConnectState::Disconnected,
               })
               .is_updated()
               || changed
         },
      }
   }

   /// Connects, tracking the attempt in [`ConnectState`].
   pub async fn connect(&self) -> Result<()> {
      self
         .props
         .set("State", |p| &mut p.state, ConnectState::Connecting);
      let result = self.proxy.connect().await;
      let state = match &result {
         Ok(()) => ConnectState::Connected,
         Err(e) => {
            warn!("Failed to connect {}: {e}", self.path());
            ConnectState::Disconnected
         },
      };
      self.props.set("State", |p| &mut p.state, state);
      result
   }

   pub async fn disconnect(&self) -> Result<()> {
      self.proxy.disconnect().await
   }

   /// Marks the device for removal once the current connect attempt settles.
   pub fn mark_needs_removal(&self) {
      self.props.update(|p| p.needs_removal = true);
   }

   /// Clears and returns the removal mark.
   pub fn take_needs_removal(&self) -> bool {
      self
         .props
         .update(|p| std::mem::replace(&mut p.needs_removal, false))
   }

   pub fn destroy(&self) {
      if let Some(handle) = self.monitor.lock().take() {
         handle.abort();
      }
   }
}

impl Drop for Device {
   fn drop(&mut self) {
      self.destroy();
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::testing::FakeDevice,
      event::testing::RecordingBus,
   };

   async fn device(bus: &Arc<RecordingBus>) -> (Arc<Device>, Arc<FakeDevice>) {
      let fake = FakeDevice::new("AA:BB:CC:00:00:01", "Speaker");
      let dev = Device::new(
         "/org/bluez/hci0/dev_AA_BB_CC_00_00_01".into(),
         "/org/bluez/hci0".into(),
         fake.clone(),
         bus.clone(),
      )
      .await;
      (dev, fake)
   }

   fn changes(bus: &RecordingBus) -> usize {
      bus.count(|e| matches!(e, Event::DevicePropertiesChanged(_)))
   }

   #[tokio::test]
   async fn test_initial_read_and_json() {
      let bus = RecordingBus::new();
      let (dev, _) = device(&bus).await;
      let json: serde_json::Value = serde_json::from_str(&dev.to_json()).unwrap();
      assert_eq!(json["Alias"], "Speaker");
      assert_eq!(json["AdapterPath"], "/org/bluez/hci0");
      assert_eq!(json["State"], 0);
      assert!(json.get("NeedsRemoval").is_none());
   }

   #[tokio::test]
   async fn test_repeated_values_notify_once() {
      let bus = RecordingBus::new();
      let (dev, _) = device(&bus).await;

      assert!(dev.apply(DeviceProp::Alias("Kitchen".into())));
      assert!(!dev.apply(DeviceProp::Alias("Kitchen".into())));
      assert!(dev.apply(DeviceProp::Rssi(-40)));
      assert!(!dev.apply(DeviceProp::Rssi(-40)));
      assert_eq!(changes(&bus), 2);
   }

   #[tokio::test]
   async fn test_connect_tracks_state() {
      let bus = RecordingBus::new();
      let (dev, fake) = device(&bus).await;

      dev.connect().await.unwrap();
      assert_eq!(dev.state(), ConnectState::Connected);

      fake.fail_connect(true);
      assert!(dev.connect().await.is_err());
      assert_eq!(dev.state(), ConnectState::Disconnected);
   }

   #[tokio::test]
   async fn test_disconnect_signal_during_attempt_keeps_connecting() {
      let bus = RecordingBus::new();
      let (dev, fake) = device(&bus).await;
      fake.hold_connect();

      let attempt = {
         let dev = dev.clone();
         tokio::spawn(async move { dev.connect().await })
      };
      tokio::task::yield_now().await;
      assert_eq!(dev.state(), ConnectState::Connecting);

      dev.apply(DeviceProp::Connected(false));
      assert_eq!(dev.state(), ConnectState::Connecting);

      fake.release_connect();
      attempt.await.unwrap().unwrap();
      assert_eq!(dev.state(), ConnectState::Connected);
   }

   #[tokio::test]
   async fn test_connected_signal_settles_state() {
      let bus = RecordingBus::new();
      let (dev, _) = device(&bus).await;

      assert!(dev.apply(DeviceProp::Connected(true)));
      assert_eq!(dev.state(), ConnectState::Connected);
      assert!(dev.apply(DeviceProp::Connected(false)));
      assert_eq!(dev.state(), ConnectState::Disconnected);
      assert!(!dev.apply(DeviceProp::Connected(false)));
   }

   #[tokio::test]
   async fn test_removal_mark_is_taken_once() {
      let bus = RecordingBus::new();
      let (dev, _) = device(&bus).await;
      assert!(!dev.take_needs_removal());
      dev.mark_needs_removal();
      assert!(dev.take_needs_removal());
      assert!(!dev.take_needs_removal());
      assert_eq!(changes(&bus), 0);
   }
}
