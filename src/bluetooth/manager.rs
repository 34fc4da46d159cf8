//! Bluetooth manager.
//!
//! Owns the adapter and device collections, the backup snapshot taken when
//! discovery expires and the pending-connection marker. Remote signals from
//! every adapter and device are funnelled into one channel and handled by a
//! single loop in arrival order; anything that waits on BlueZ for longer than
//! a property read is spawned.

use std::{
   collections::BTreeMap,
   sync::{Arc, Weak},
};

use bluer::Address;
use futures::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{
   bluetooth::{
      adapter::{Adapter, AdapterFollowUp, AdapterProps, AdapterTimeouts},
      agent::PairingAgent,
      device::{ConnectState, Device, DeviceProps},
      obex::FileSender,
      remote::{
         AdapterProxy, AdapterSignal, BluezProxy, BluezSignal, DeviceProp, DeviceProxy,
         adapter_path, device_path,
      },
   },
   config::Config,
   error::{DaemonError, Result},
   event::{BusObject, Event, EventSender},
   property::{BusSink, PropertyStore},
   registry::{GroupedRegistry, Registry},
   timer::OneShotTimer,
};

/// Signal channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Overall availability published as the `State` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
   Unavailable = 0,
   Available = 1,
   Connected = 2,
}

#[derive(Debug, Default)]
struct ManagerProps {
   state: u32,
}

/// Device list frozen at the last discovery expiry. The generation tells a
/// pending-connect expiry whether the snapshot it consulted is still current.
#[derive(Debug, Default)]
struct BackupSnapshot {
   generation: u64,
   devices: BTreeMap<SmolStr, Vec<DeviceProps>>,
}

#[derive(Debug)]
enum BluetoothSignal {
   Bluez(BluezSignal),
   Adapter(SmolStr, AdapterSignal),
   Device(SmolStr, DeviceProp),
}

/// Main Bluetooth manager. Cheap to clone.
#[derive(Clone)]
pub struct BluetoothManager {
   inner: Arc<Inner>,
}

struct Inner {
   bluez: Arc<dyn BluezProxy>,
   agent: Arc<PairingAgent>,
   files: Option<Arc<FileSender>>,
   bus: EventSender,
   config: Arc<Mutex<Config>>,

   adapters: Registry<SmolStr, Arc<Adapter>>,
   devices: GroupedRegistry<SmolStr, SmolStr, Arc<Device>>,
   backup: Mutex<BackupSnapshot>,
   pending_connect: Mutex<Option<SmolStr>>,
   props: PropertyStore<ManagerProps>,

   signal_tx: mpsc::Sender<BluetoothSignal>,
   signal_rx: Mutex<Option<mpsc::Receiver<BluetoothSignal>>>,
   tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BluetoothManager {
   pub fn new(
      bluez: Arc<dyn BluezProxy>,
      agent: Arc<PairingAgent>,
      files: Option<Arc<FileSender>>,
      bus: EventSender,
      config: Arc<Mutex<Config>>,
   ) -> Self {
      let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let sink = BusSink::new(bus.clone(), BusObject::Bluetooth);
      Self {
         inner: Arc::new(Inner {
            bluez,
            agent,
            files,
            bus,
            config,
            adapters: Registry::new(),
            devices: GroupedRegistry::new(),
            backup: Mutex::new(BackupSnapshot::default()),
            pending_connect: Mutex::new(None),
            props: PropertyStore::new("/org/desktopd/Bluetooth", ManagerProps::default(), sink),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            tasks: Mutex::new(Vec::new()),
         }),
      }
   }

   /// Subscribes to BlueZ, mirrors every adapter present and starts the
   /// signal loop. Can only be called once.
   pub async fn start(&self) -> Result<()> {
      let inner = &self.inner;
      let mut rx = inner
         .signal_rx
         .lock()
         .take()
         .ok_or(DaemonError::ManagerShutdown)?;

      info!("Bluetooth manager starting up");
      let events = inner.bluez.events().await?;
      let bluez_monitor = forward(events, inner.signal_tx.clone(), BluetoothSignal::Bluez);

      for name in inner.bluez.adapter_names().await? {
         inner.add_adapter(name).await;
      }
      inner.update_state();

      let weak: Weak<Inner> = Arc::downgrade(inner);
      let signal_loop = tokio::spawn(async move {
         while let Some(signal) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
               break;
            };
            inner.handle_signal(signal).await;
         }
         debug!("bluetooth signal loop stopped");
      });

      inner.tasks.lock().extend([bluez_monitor, signal_loop]);
      Ok(())
   }

   /// Stops the signal loop and releases every adapter and device.
   pub fn shutdown(&self) {
      info!("Cleaning up Bluetooth manager");
      for task in self.inner.tasks.lock().drain(..) {
         task.abort();
      }
      for device in self.inner.devices.all() {
         device.destroy();
      }
      for adapter in self.inner.adapters.drain() {
         adapter.destroy();
      }
   }

   pub fn state(&self) -> u32 {
      self.inner.props.read(|p| p.state)
   }

   // === Devices ===

   /// Connects `device`. An unknown device becomes the pending target: the
   /// adapter starts scanning and, if the device does not show up within the
   /// find-device window, a connect failure is reported.
   pub async fn connect_device(&self, device: &str, adapter: &str) -> Result<()> {
      let inner = &self.inner;
      *inner.pending_connect.lock() = Some(device.into());

      if let Some(device) = inner.devices.find(&device.into()) {
         inner.spawn_connect(device);
         return Ok(());
      }

      debug!("{device} not known yet, scanning on {adapter}");
      let adapter = inner.adapter(adapter)?;
      adapter.start_discovery().await;
      adapter.arm_find_device();
      Ok(())
   }

   pub async fn disconnect_device(&self, device: &str) -> Result<()> {
      let device = self.inner.device(device)?;
      tokio::spawn(async move {
         if let Err(e) = device.disconnect().await {
            warn!("Failed to disconnect {}: {e}", device.path());
         }
      });
      Ok(())
   }

   /// Removes a device, or defers the removal until an in-flight connect
   /// attempt settles.
   pub async fn remove_device(&self, adapter: &str, device: &str) -> Result<()> {
      let adapter = self.inner.adapter(adapter)?;
      let device = self.inner.device(device)?;

      if device.state() == ConnectState::Connecting {
         debug!("{} is connecting, removal deferred", device.path());
         device.mark_needs_removal();
         return Ok(());
      }

      adapter
         .proxy()
         .remove_device(device.proxy().address())
         .await
         .inspect_err(|e| warn!("Failed to remove {}: {e}", device.path()))
   }

   pub async fn set_device_alias(&self, device: &str, alias: &str) -> Result<()> {
      self.inner.device(device)?.proxy().set_alias(alias).await
   }

   pub async fn set_device_trusted(&self, device: &str, trusted: bool) -> Result<()> {
      self.inner.device(device)?.proxy().set_trusted(trusted).await
   }

   /// Devices of `adapter` as JSON. After a discovery expiry this is the
   /// backup snapshot rather than the live list.
   pub fn get_devices(&self, adapter: &str) -> Result<String> {
      let inner = &self.inner;
      let adapter = inner.adapter(adapter)?;

      let devices: Vec<DeviceProps> = if adapter.discovery_timed_out() {
         inner
            .backup
            .lock()
            .devices
            .get(adapter.path())
            .cloned()
            .unwrap_or_default()
      } else {
         inner
            .devices
            .group(adapter.path())
            .iter()
            .map(|d| d.snapshot())
            .collect()
      };
      Ok(serde_json::to_string(&devices)?)
   }

   /// Removes every unpaired device.
   pub async fn clear_unpaired_device(&self) -> Result<()> {
      let unpaired: Vec<DeviceProps> = self
         .inner
         .devices
         .all()
         .iter()
         .map(|d| d.snapshot())
         .filter(|d| !d.paired)
         .collect();

      for device in unpaired {
         info!("Removing unpaired device {}", device.path);
         if let Err(e) = self.remove_device(&device.adapter_path, &device.path).await {
            warn!("{e}");
         }
      }
      Ok(())
   }

   // === Adapters ===

   pub fn get_adapters(&self) -> Result<String> {
      let adapters: Vec<AdapterProps> = self
         .inner
         .adapters
         .values()
         .iter()
         .map(|a| a.snapshot())
         .collect();
      Ok(serde_json::to_string(&adapters)?)
   }

   /// Starts scanning unless the adapter already is.
   pub async fn request_discovery(&self, adapter: &str) -> Result<()> {
      let adapter = self.inner.powered_adapter(adapter)?;
      if adapter.proxy().is_discovering().await? {
         return Ok(());
      }
      adapter.start_discovery().await;
      Ok(())
   }

   pub async fn set_adapter_powered(&self, adapter: &str, powered: bool) -> Result<()> {
      let adapter = self.inner.adapter(adapter)?;
      adapter.set_discovery_timed_out(false);
      adapter
         .proxy()
         .set_powered(powered)
         .await
         .inspect_err(|e| warn!("Failed to set {} powered: {e}", adapter.path()))?;

      let mut config = self.inner.config.lock();
      config
         .bluetooth
         .set_adapter_powered(&adapter.address(), powered);
      if let Err(e) = config.save() {
         warn!("Failed to save config: {e}");
      }
      Ok(())
   }

   pub async fn set_adapter_alias(&self, adapter: &str, alias: &str) -> Result<()> {
      let adapter = self.inner.adapter(adapter)?;
      adapter
         .proxy()
         .set_alias(alias)
         .await
         .inspect_err(|e| warn!("Failed to set {} alias: {e}", adapter.path()))
   }

   pub async fn set_adapter_discoverable(&self, adapter: &str, discoverable: bool) -> Result<()> {
      let adapter = self.inner.powered_adapter(adapter)?;
      adapter
         .proxy()
         .set_discoverable(discoverable)
         .await
         .inspect_err(|e| warn!("Failed to set {} discoverable: {e}", adapter.path()))
   }

   pub async fn set_adapter_discovering(&self, adapter: &str, discovering: bool) -> Result<()> {
      let adapter = self.inner.powered_adapter(adapter)?;
      if discovering {
         adapter.start_discovery().await;
         Ok(())
      } else {
         adapter
            .stop_discovery()
            .await
            .inspect_err(|e| warn!("Failed to stop discovery on {}: {e}", adapter.path()))
      }
   }

   pub async fn set_adapter_discoverable_timeout(&self, adapter: &str, timeout: u32) -> Result<()> {
      let adapter = self.inner.adapter(adapter)?;
      adapter
         .proxy()
         .set_discoverable_timeout(timeout)
         .await
         .inspect_err(|e| warn!("Failed to set {} discoverable timeout: {e}", adapter.path()))
   }

   // === Pairing ===

   pub fn confirm(&self, device: &str, accept: bool) -> Result<()> {
      self.inner.agent.confirm(device, accept)
   }

   pub fn feed_pin_code(&self, device: &str, accept: bool, pin_code: &str) -> Result<()> {
      self.inner.agent.feed_pin_code(device, accept, pin_code)
   }

   pub fn feed_passkey(&self, device: &str, accept: bool, passkey: u32) -> Result<()> {
      self.inner.agent.feed_passkey(device, accept, passkey)
   }

   // === File transfer ===

   /// Pushes `files` to the connected device with address `address`.
   pub async fn send_files(&self, address: &str, files: Vec<String>) -> Result<SmolStr> {
      if files.is_empty() {
         return Err(DaemonError::EmptyFileList);
      }
      let connected = self
         .inner
         .devices
         .all()
         .into_iter()
         .any(|d| d.is_connected() && d.address().eq_ignore_ascii_case(address));
      if !connected {
         return Err(DaemonError::DeviceNotConnected);
      }
      let files_sender = self
         .inner
         .files
         .as_ref()
         .ok_or_else(|| DaemonError::FeatureNotSupported("OBEX".into()))?;
      files_sender.send_files(address, files).await
   }

   pub fn cancel_transfer_session(&self, session: &str) -> Result<()> {
      self
         .inner
         .files
         .as_ref()
         .ok_or_else(|| DaemonError::TransferNotFound(session.into()))?
         .cancel(session)
   }

   pub fn debug_info(&self) -> Result<String> {
      let devices: BTreeMap<SmolStr, Vec<DeviceProps>> = self.inner.devices.with(|groups| {
         groups
            .iter()
            .map(|(adapter, devs)| (adapter.clone(), devs.values().map(|d| d.snapshot()).collect()))
            .collect()
      });
      Ok(format!(
         "adapters: {}\ndevices: {}",
         self.get_adapters()?,
         serde_json::to_string(&devices)?
      ))
   }

   #[cfg(test)]
   fn backup_len(&self) -> usize {
      self.inner.backup.lock().devices.values().map(Vec::len).sum()
   }
}

impl Inner {
   fn adapter(&self, path: &str) -> Result<Arc<Adapter>> {
      self
         .adapters
         .get(&path.into())
         .ok_or_else(|| DaemonError::AdapterNotFound(path.into()))
   }

   fn powered_adapter(&self, path: &str) -> Result<Arc<Adapter>> {
      let adapter = self.adapter(path)?;
      if !adapter.is_powered() {
         return Err(DaemonError::AdapterPoweredOff(path.into()));
      }
      Ok(adapter)
   }

   fn device(&self, path: &str) -> Result<Arc<Device>> {
      self
         .devices
         .find(&path.into())
         .ok_or_else(|| DaemonError::DeviceNotFound(path.into()))
   }

   fn update_state(&self) {
      let state = if self.adapters.is_empty() {
         ManagerState::Unavailable
      } else if self.devices.all().iter().any(|d| d.is_connected()) {
         ManagerState::Connected
      } else {
         ManagerState::Available
      };
      self.props.set("State", |p| &mut p.state, state as u32);
   }

   async fn handle_signal(self: &Arc<Self>, signal: BluetoothSignal) {
      match signal {
         BluetoothSignal::Bluez(BluezSignal::AdapterAdded(name)) => {
            self.add_adapter(name).await;
         },
         BluetoothSignal::Bluez(BluezSignal::AdapterRemoved(name)) => {
            self.remove_adapter(&adapter_path(&name));
         },
         BluetoothSignal::Adapter(path, AdapterSignal::DeviceAdded(address)) => {
            if let Some(adapter) = self.adapters.get(&path) {
               self.add_device(&adapter, address).await;
            }
         },
         BluetoothSignal::Adapter(path, AdapterSignal::DeviceRemoved(address)) => {
            if let Some(adapter) = self.adapters.get(&path) {
               self.remove_device_entry(&path, &device_path(adapter.proxy().name(), address));
            }
         },
         BluetoothSignal::Adapter(path, AdapterSignal::Property(prop)) => {
            let Some(adapter) = self.adapters.get(&path) else {
               return;
            };
            debug!("{path}: {prop:?}");
            if adapter.apply(prop) == AdapterFollowUp::PoweredOn {
               tokio::spawn(self.clone().power_on(adapter));
            }
         },
         BluetoothSignal::Device(path, prop) => {
            let Some(device) = self.devices.find(&path) else {
               return;
            };
            device.apply(prop);
         },
      }
      self.update_state();
   }

   fn discovery_timers(self: &Arc<Self>, path: &SmolStr) -> (Arc<OneShotTimer>, Arc<OneShotTimer>) {
      let weak = Arc::downgrade(self);
      let adapter = path.clone();
      let discovery = OneShotTimer::new("discovery", move || {
         let weak = weak.clone();
         let adapter = adapter.clone();
         async move {
            if let Some(inner) = weak.upgrade() {
               inner.on_discovery_expired(&adapter).await;
            }
         }
      });

      let weak = Arc::downgrade(self);
      let adapter = path.clone();
      let find_device = OneShotTimer::new("find-device", move || {
         let weak = weak.clone();
         let adapter = adapter.clone();
         async move {
            if let Some(inner) = weak.upgrade() {
               inner.on_find_device_expired(&adapter);
            }
         }
      });

      (discovery, find_device)
   }

   async fn add_adapter(self: &Arc<Self>, name: SmolStr) {
      let path = adapter_path(&name);
      if self.adapters.contains(&path) {
         return;
      }
      let proxy = match self.bluez.adapter(&name) {
         Ok(proxy) => proxy,
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
            return;
         },
      };

      let events = proxy
         .events()
         .await
         .inspect_err(|e| warn!("Failed to subscribe to {path}: {e}"))
         .ok();
      let timeouts = {
         let config = self.config.lock();
         AdapterTimeouts {
            discovery: config.bluetooth.discovery_timeout(),
            find_device: config.bluetooth.find_device_timeout(),
         }
      };
      let (discovery, find_device) = self.discovery_timers(&path);
      let adapter = Adapter::new(
         path.clone(),
         proxy.clone(),
         self.bus.clone(),
         timeouts,
         discovery,
         find_device,
      )
      .await;

      if !self.adapters.insert_new(path.clone(), adapter.clone()) {
         return;
      }
      if let Some(events) = events {
         let path = path.clone();
         adapter.set_monitor(forward(events, self.signal_tx.clone(), move |s| {
            BluetoothSignal::Adapter(path.clone(), s)
         }));
      }
      info!("Adapter added: {path}");
      self.bus.emit(Event::AdapterAdded(adapter.to_json()));

      let remembered = self
         .config
         .lock()
         .bluetooth
         .adapter_powered(&adapter.address());
      if let Some(powered) = remembered
         && powered != adapter.is_powered()
      {
         info!("Restoring powered={powered} on {path}");
         if let Err(e) = proxy.set_powered(powered).await {
            warn!("Failed to restore power state of {path}: {e}");
         }
      }

      match proxy.device_addresses().await {
         Ok(addresses) => {
            for address in addresses {
               self.add_device(&adapter, address).await;
            }
         },
         Err(e) => warn!("Failed to list devices of {path}: {e}"),
      }
   }

   fn remove_adapter(&self, path: &SmolStr) {
      let Some(adapter) = self.adapters.remove(path) else {
         return;
      };
      adapter.destroy();
      for device in self.devices.remove_group(path) {
         device.destroy();
         self.bus.emit(Event::DeviceRemoved(device.to_json()));
      }
      info!("Adapter removed: {path}");
      self.bus.emit(Event::AdapterRemoved(adapter.to_json()));
   }

   async fn add_device(self: &Arc<Self>, adapter: &Arc<Adapter>, address: Address) {
      let path = device_path(adapter.proxy().name(), address);
      if self.devices.find(&path).is_some() {
         return;
      }
      let proxy = match adapter.proxy().device(address) {
         Ok(proxy) => proxy,
         Err(e) => {
            warn!("Failed to open device {path}: {e}");
            return;
         },
      };

      let events = proxy
         .events()
         .await
         .inspect_err(|e| warn!("Failed to subscribe to {path}: {e}"))
         .ok();
      let device = Device::new(path.clone(), adapter.path().clone(), proxy, self.bus.clone()).await;
      if !self
         .devices
         .insert_new(adapter.path().clone(), path.clone(), device.clone())
      {
         return;
      }
      if let Some(events) = events {
         let path = path.clone();
         device.set_monitor(forward(events, self.signal_tx.clone(), move |p| {
            BluetoothSignal::Device(path.clone(), p)
         }));
      }
      debug!("Device added: {path}");
      self.bus.emit(Event::DeviceAdded(device.to_json()));

      let pending = {
         let mut pending = self.pending_connect.lock();
         if pending.as_ref() == Some(&path) {
            pending.take()
         } else {
            None
         }
      };
      if pending.is_some() {
         info!("Pending device {path} appeared, connecting");
         self.spawn_connect(device);
      }
   }

   fn remove_device_entry(&self, adapter: &SmolStr, path: &SmolStr) {
      if let Some(device) = self.devices.remove(adapter, path) {
         device.destroy();
         debug!("Device removed: {path}");
         self.bus.emit(Event::DeviceRemoved(device.to_json()));
      }
   }

   fn spawn_connect(self: &Arc<Self>, device: Arc<Device>) {
      let inner = self.clone();
      tokio::spawn(async move {
         if let Err(e) = inner.connect_and_settle(&device).await {
            debug!("Background connect of {} failed: {e}", device.path());
         }
      });
   }

   /// Connects and then carries out a removal requested meanwhile.
   async fn connect_and_settle(&self, device: &Arc<Device>) -> Result<()> {
      let result = device.connect().await;
      if device.take_needs_removal() {
         info!("Removing {} after connect attempt", device.path());
         let adapter_path = device.snapshot().adapter_path;
         match self.adapters.get(&adapter_path) {
            Some(adapter) => {
               if let Err(e) = adapter.proxy().remove_device(device.proxy().address()).await {
                  warn!("Failed to remove {}: {e}", device.path());
               }
            },
            None => warn!("Adapter {adapter_path} vanished before removing {}", device.path()),
         }
      }
      self.update_state();
      result
   }

   /// Reconnects paired devices and restarts scanning after power-on.
   async fn power_on(self: Arc<Self>, adapter: Arc<Adapter>) {
      let discoverable = self.config.lock().bluetooth.discoverable;
      if let Err(e) = adapter.proxy().set_discoverable(discoverable).await {
         warn!("Failed to set discoverable for {}: {e}", adapter.path());
      }

      adapter.set_discovery_timed_out(false);
      if let Err(e) = adapter.stop_discovery().await {
         debug!("Stop discovery on {}: {e}", adapter.path());
      }

      for device in self.devices.group(adapter.path()) {
         if device.is_paired() && !device.is_connected() {
            if let Err(e) = self.connect_and_settle(&device).await {
               debug!("Reconnect of {} failed: {e}", device.path());
            }
         }
      }

      if let Err(e) = adapter.proxy().start_discovery().await {
         warn!("Failed to start discovery on {}: {e}", adapter.path());
      }
      adapter.reset_discovery_expiry();
   }

   /// Discovery expiry: freeze every device of every adapter into the backup,
   /// stop scanning and forget the pending target.
   async fn on_discovery_expired(&self, path: &SmolStr) {
      let Some(adapter) = self.adapters.get(path) else {
         return;
      };
      debug!("Discovery on {path} timed out");

      let snapshot: BTreeMap<SmolStr, Vec<DeviceProps>> = self.devices.with(|groups| {
         groups
            .iter()
            .map(|(adapter, devs)| (adapter.clone(), devs.values().map(|d| d.snapshot()).collect()))
            .collect()
      });
      {
         let mut backup = self.backup.lock();
         backup.generation += 1;
         backup.devices = snapshot;
      }

      adapter.set_discovery_timed_out(true);
      if let Err(e) = adapter.stop_discovery().await {
         warn!("Failed to stop discovery on {path}: {e}");
      }
      *self.pending_connect.lock() = None;
   }

   /// Find-device expiry: report the pending target as unreachable if it only
   /// exists in the backup, then drop the backup.
   fn on_find_device_expired(&self, path: &SmolStr) {
      let Some(adapter) = self.adapters.get(path) else {
         return;
      };
      adapter.close_find_device();

      let pending = self.pending_connect.lock().clone();
      let unknown = pending.filter(|p| self.devices.find(p).is_none());

      let (generation, failed) = {
         let backup = self.backup.lock();
         let failed = unknown.and_then(|p| {
            backup
               .devices
               .values()
               .flatten()
               .find(|d| d.path == p)
               .map(|d| (p, d.alias.clone()))
         });
         (backup.generation, failed)
      };

      if let Some((device, alias)) = failed {
         warn!("Pending device {device} ({alias}) not found, host down");
         self.bus.emit(Event::ConnectFailed { device, alias });
      }

      let mut backup = self.backup.lock();
      if backup.generation == generation {
         backup.devices.clear();
      }
   }
}

/// Pumps a remote event stream into the signal channel.
fn forward<S: Send + 'static>(
   mut stream: BoxStream<'static, S>,
   tx: mpsc::Sender<BluetoothSignal>,
   wrap: impl Fn(S) -> BluetoothSignal + Send + 'static,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      while let Some(item) = stream.next().await {
         if tx.send(wrap(item)).await.is_err() {
            debug!("bluetooth signal channel closed");
            break;
         }
      }
   })
}

#[cfg(test)]
mod tests {
   use std::time::Duration;

   use super::*;
   use crate::{
      bluetooth::testing::{FakeAdapter, FakeBluez, FakeDevice},
      event::testing::RecordingBus,
   };

   const HCI0: &str = "/org/bluez/hci0";
   const HCI1: &str = "/org/bluez/hci1";

   fn dev(adapter: &str, n: u8) -> String {
      format!("/org/bluez/{adapter}/dev_AA_BB_CC_00_00_{n:02X}")
   }

   fn addr(n: u8) -> Address {
      format!("AA:BB:CC:00:00:{n:02X}").parse().unwrap()
   }

   fn fake_device(n: u8) -> Arc<FakeDevice> {
      FakeDevice::new(&addr(n).to_string(), &format!("Device {n}"))
   }

   fn device_count(json: &str) -> usize {
      serde_json::from_str::<Vec<serde_json::Value>>(json)
         .unwrap()
         .len()
   }

   async fn settle() {
      tokio::time::sleep(Duration::from_millis(10)).await;
   }

   struct Harness {
      manager: BluetoothManager,
      bluez: Arc<FakeBluez>,
      bus: Arc<RecordingBus>,
      config: Arc<Mutex<Config>>,
   }

   async fn start(adapters: Vec<Arc<FakeAdapter>>) -> Harness {
      let bluez = FakeBluez::new();
      for adapter in adapters {
         bluez.insert(adapter);
      }
      let bus = RecordingBus::new();
      let config = Arc::new(Mutex::new(Config::default()));
      let manager = BluetoothManager::new(
         bluez.clone(),
         PairingAgent::new(bus.clone()),
         None,
         bus.clone(),
         config.clone(),
      );
      manager.start().await.unwrap();
      settle().await;
      Harness {
         manager,
         bluez,
         bus,
         config,
      }
   }

   fn connect_failures(bus: &RecordingBus) -> usize {
      bus.count(|e| matches!(e, Event::ConnectFailed { .. }))
   }

   #[tokio::test(start_paused = true)]
   async fn test_state_follows_adapters_and_connections() {
      let h = start(vec![]).await;
      assert_eq!(h.manager.state(), ManagerState::Unavailable as u32);

      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      let device = fake_device(1).paired();
      hci0.insert(device.clone());
      h.bluez.plug(hci0);
      settle().await;
      assert_eq!(h.manager.state(), ManagerState::Available as u32);

      h.manager.connect_device(&dev("hci0", 1), HCI0).await.unwrap();
      settle().await;
      assert_eq!(device.connects(), 1);
      assert_eq!(h.manager.state(), ManagerState::Connected as u32);

      h.bluez.unplug("hci0");
      settle().await;
      assert_eq!(h.manager.state(), ManagerState::Unavailable as u32);
      assert_eq!(h.bus.count(|e| matches!(e, Event::DeviceRemoved(_))), 1);
      assert_eq!(h.bus.count(|e| matches!(e, Event::AdapterRemoved(_))), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_discovery_expiry_freezes_every_adapter() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      let hci1 = FakeAdapter::new("hci1", "00:11:22:33:44:66");
      for n in 1..=3 {
         hci0.insert(fake_device(n));
         hci1.insert(fake_device(n + 0x10));
      }
      let h = start(vec![hci0.clone(), hci1.clone()]).await;

      h.manager.request_discovery(HCI0).await.unwrap();
      tokio::time::sleep(Duration::from_secs(61)).await;
      settle().await;
      assert_eq!(h.manager.backup_len(), 6);
      assert_eq!(hci0.count("stop_discovery"), 1);

      let frozen = h.manager.get_devices(HCI0).unwrap();
      hci0.discover(fake_device(9));
      hci0.lose(addr(1));
      settle().await;

      // Live changes do not leak into the snapshot.
      assert_eq!(h.manager.get_devices(HCI0).unwrap(), frozen);
      assert_eq!(h.manager.backup_len(), 6);
      assert_eq!(device_count(&h.manager.get_devices(HCI1).unwrap()), 3);

      h.manager.request_discovery(HCI0).await.unwrap();
      let live = h.manager.get_devices(HCI0).unwrap();
      assert_eq!(device_count(&live), 3);
      assert!(live.contains("AA:BB:CC:00:00:09"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_unreachable_pending_device_fails_once() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      hci0.insert(fake_device(1));
      let h = start(vec![hci0.clone()]).await;

      h.manager.request_discovery(HCI0).await.unwrap();
      tokio::time::sleep(Duration::from_secs(61)).await;
      hci0.lose(addr(1));
      settle().await;

      h.manager.connect_device(&dev("hci0", 1), HCI0).await.unwrap();
      tokio::time::sleep(Duration::from_secs(2)).await;
      assert_eq!(
         h.bus.count(|e| matches!(
            e,
            Event::ConnectFailed { alias, .. } if alias == "Device 1"
         )),
         1
      );

      tokio::time::sleep(Duration::from_secs(5)).await;
      assert_eq!(connect_failures(&h.bus), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_pending_device_connects_when_found() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      hci0.insert(fake_device(1));
      let h = start(vec![hci0.clone()]).await;

      h.manager.request_discovery(HCI0).await.unwrap();
      tokio::time::sleep(Duration::from_secs(61)).await;
      hci0.lose(addr(1));
      settle().await;

      h.manager.connect_device(&dev("hci0", 1), HCI0).await.unwrap();
      let found = fake_device(1);
      hci0.discover(found.clone());
      tokio::time::sleep(Duration::from_secs(2)).await;

      assert_eq!(found.connects(), 1);
      assert_eq!(connect_failures(&h.bus), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_background_connect_settles_device() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      hci0.insert(fake_device(1));
      let h = start(vec![hci0.clone()]).await;

      h.manager.request_discovery(HCI0).await.unwrap();
      tokio::time::sleep(Duration::from_secs(61)).await;
      hci0.lose(addr(1));
      settle().await;

      h.manager.connect_device(&dev("hci0", 1), HCI0).await.unwrap();
      let found = fake_device(1);
      found.fail_connect(true);
      hci0.discover(found.clone());
      tokio::time::sleep(Duration::from_secs(2)).await;

      assert_eq!(found.connects(), 1);
      let devices: serde_json::Value =
         serde_json::from_str(&h.manager.get_devices(HCI0).unwrap()).unwrap();
      assert_eq!(devices[0]["State"], 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_unknown_pending_device_without_backup_is_silent() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      let h = start(vec![hci0.clone()]).await;

      h.manager.connect_device(&dev("hci0", 7), HCI0).await.unwrap();
      assert_eq!(hci0.count("start_discovery"), 1);
      tokio::time::sleep(Duration::from_secs(2)).await;
      assert_eq!(connect_failures(&h.bus), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_removal_waits_for_connect_attempt() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      let device = fake_device(1);
      device.hold_connect();
      device.fail_connect(true);
      hci0.insert(device.clone());
      let h = start(vec![hci0.clone()]).await;

      h.manager.connect_device(&dev("hci0", 1), HCI0).await.unwrap();
      settle().await;
      assert_eq!(device.connects(), 1);

      h.manager.remove_device(HCI0, &dev("hci0", 1)).await.unwrap();
      assert_eq!(hci0.count("remove AA:BB:CC:00:00:01"), 0);

      device.release_connect();
      settle().await;
      assert_eq!(hci0.count("remove AA:BB:CC:00:00:01"), 1);
      assert_eq!(device_count(&h.manager.get_devices(HCI0).unwrap()), 0);
   }

   #[tokio::test(start_paused = true)]
   async fn test_lookup_errors() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      hci0.state.lock().powered = false;
      hci0.insert(fake_device(1));
      let h = start(vec![hci0]).await;

      assert!(matches!(
         h.manager.get_devices("/org/bluez/hci9"),
         Err(DaemonError::AdapterNotFound(_))
      ));
      assert!(matches!(
         h.manager.request_discovery(HCI0).await,
         Err(DaemonError::AdapterPoweredOff(_))
      ));
      assert!(matches!(
         h.manager.set_adapter_discoverable(HCI0, true).await,
         Err(DaemonError::AdapterPoweredOff(_))
      ));
      assert!(matches!(
         h.manager.remove_device(HCI0, &dev("hci0", 5)).await,
         Err(DaemonError::DeviceNotFound(_))
      ));
      assert!(matches!(
         h.manager.send_files("AA:BB:CC:00:00:01", vec![]).await,
         Err(DaemonError::EmptyFileList)
      ));
      assert!(matches!(
         h.manager
            .send_files("AA:BB:CC:00:00:01", vec!["/tmp/a".into()])
            .await,
         Err(DaemonError::DeviceNotConnected)
      ));
   }

   #[tokio::test(start_paused = true)]
   async fn test_power_cycle_is_remembered_and_reconnects() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      let device = fake_device(1).paired();
      hci0.insert(device.clone());
      let h = start(vec![hci0.clone()]).await;

      h.manager.set_adapter_powered(HCI0, false).await.unwrap();
      settle().await;
      assert_eq!(
         h.config.lock().bluetooth.adapter_powered("00:11:22:33:44:55"),
         Some(false)
      );

      h.manager.set_adapter_powered(HCI0, true).await.unwrap();
      settle().await;
      assert_eq!(
         h.config.lock().bluetooth.adapter_powered("00:11:22:33:44:55"),
         Some(true)
      );
      assert_eq!(hci0.count("set_discoverable true"), 1);
      assert_eq!(hci0.count("start_discovery"), 1);
      assert_eq!(device.connects(), 1);
   }

   #[tokio::test(start_paused = true)]
   async fn test_clear_unpaired_device() {
      let hci0 = FakeAdapter::new("hci0", "00:11:22:33:44:55");
      hci0.insert(fake_device(1).paired());
      hci0.insert(fake_device(2));
      let h = start(vec![hci0.clone()]).await;

      h.manager.clear_unpaired_device().await.unwrap();
      settle().await;
      assert_eq!(hci0.count("remove AA:BB:CC:00:00:02"), 1);
      assert_eq!(hci0.count("remove AA:BB:CC:00:00:01"), 0);

      let info = h.manager.debug_info().unwrap();
      assert!(info.starts_with("adapters: ["));
      assert!(info.contains("\ndevices: {"));
   }
}
