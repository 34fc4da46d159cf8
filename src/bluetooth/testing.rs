//! In-memory BlueZ used by the bluetooth tests.

use std::{
   collections::BTreeMap,
   str::FromStr,
   sync::{
      Arc,
      atomic::{AtomicBool, AtomicUsize, Ordering},
   },
};

use async_trait::async_trait;
use bluer::Address;
use futures::{StreamExt, stream::BoxStream};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::{Notify, mpsc};

use crate::{
   bluetooth::remote::{
      AdapterHandle, AdapterProp, AdapterProxy, AdapterSignal, BluezProxy, BluezSignal,
      DeviceHandle, DeviceProp, DeviceProxy,
   },
   error::{DaemonError, Result},
};

type Senders<T> = Mutex<Vec<mpsc::UnboundedSender<T>>>;

fn subscribe<T: Send + 'static>(senders: &Senders<T>) -> BoxStream<'static, T> {
   let (tx, rx) = mpsc::unbounded_channel();
   senders.lock().push(tx);
   futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|v| (v, rx)) }).boxed()
}

fn broadcast<T: Clone>(senders: &Senders<T>, value: T) {
   senders.lock().retain(|tx| tx.send(value.clone()).is_ok());
}

fn failure(what: &str) -> DaemonError {
   DaemonError::DBusCall(zbus::fdo::Error::Failed(what.to_string()))
}

#[derive(Default)]
pub struct FakeBluez {
   adapters: Mutex<BTreeMap<SmolStr, Arc<FakeAdapter>>>,
   senders: Senders<BluezSignal>,
}

impl FakeBluez {
   pub fn new() -> Arc<Self> {
      Arc::new(Self::default())
   }

   /// Registers an adapter without announcing it.
   pub fn insert(&self, adapter: Arc<FakeAdapter>) {
      self.adapters.lock().insert(adapter.name.clone(), adapter);
   }

   pub fn plug(&self, adapter: Arc<FakeAdapter>) {
      let name = adapter.name.clone();
      self.insert(adapter);
      broadcast(&self.senders, BluezSignal::AdapterAdded(name));
   }

   pub fn unplug(&self, name: &str) {
      self.adapters.lock().remove(name);
      broadcast(&self.senders, BluezSignal::AdapterRemoved(name.into()));
   }
}

#[async_trait]
impl BluezProxy for FakeBluez {
   async fn adapter_names(&self) -> Result<Vec<SmolStr>> {
      Ok(self.adapters.lock().keys().cloned().collect())
   }

   fn adapter(&self, name: &str) -> Result<AdapterHandle> {
      self
         .adapters
         .lock()
         .get(name)
         .cloned()
         .map(|a| a as AdapterHandle)
         .ok_or_else(|| DaemonError::AdapterNotFound(name.into()))
   }

   async fn events(&self) -> Result<BoxStream<'static, BluezSignal>> {
      Ok(subscribe(&self.senders))
   }
}

#[derive(Default)]
pub struct FakeAdapterState {
   pub address: String,
   pub system_name: String,
   pub alias: String,
   pub powered: bool,
   pub discovering: bool,
   pub discoverable: bool,
   pub discoverable_timeout: u32,
   pub devices: BTreeMap<Address, Arc<FakeDevice>>,
}

pub struct FakeAdapter {
   pub name: SmolStr,
   pub state: Mutex<FakeAdapterState>,
   calls: Mutex<Vec<String>>,
   senders: Senders<AdapterSignal>,
}

impl FakeAdapter {
   /// A powered adapter named `name`.
   pub fn new(name: &str, address: &str) -> Arc<Self> {
      Arc::new(Self {
         name: name.into(),
         state: Mutex::new(FakeAdapterState {
            address: address.to_string(),
            system_name: format!("{name}-host"),
            alias: format!("{name}-alias"),
            powered: true,
            discoverable_timeout: 180,
            ..Default::default()
         }),
         calls: Mutex::new(Vec::new()),
         senders: Mutex::new(Vec::new()),
      })
   }

   pub fn calls(&self) -> Vec<String> {
      self.calls.lock().clone()
   }

   pub fn count(&self, call: &str) -> usize {
      self.calls.lock().iter().filter(|c| *c == call).count()
   }

   fn record(&self, call: impl Into<String>) {
      self.calls.lock().push(call.into());
   }

   pub fn emit(&self, signal: AdapterSignal) {
      broadcast(&self.senders, signal);
   }

   /// Inserts a device without announcing it.
   pub fn insert(&self, device: Arc<FakeDevice>) {
      self.state.lock().devices.insert(device.address, device);
   }

   /// Inserts a device and announces it.
   pub fn discover(&self, device: Arc<FakeDevice>) {
      let address = device.address;
      self.insert(device);
      self.emit(AdapterSignal::DeviceAdded(address));
   }

   pub fn lose(&self, address: Address) {
      self.state.lock().devices.remove(&address);
      self.emit(AdapterSignal::DeviceRemoved(address));
   }

   fn update<T: PartialEq>(
      &self,
      field: impl FnOnce(&mut FakeAdapterState) -> &mut T,
      value: T,
      prop: AdapterProp,
   ) {
      let changed = {
         let mut state = self.state.lock();
         let slot = field(&mut state);
         let changed = *slot != value;
         *slot = value;
         changed
      };
      if changed {
         self.emit(AdapterSignal::Property(prop));
      }
   }
}

#[async_trait]
impl AdapterProxy for FakeAdapter {
   fn name(&self) -> &str {
      &self.name
   }

   async fn address(&self) -> Result<Address> {
      Address::from_str(&self.state.lock().address).map_err(|_| failure("bad address"))
   }

   async fn system_name(&self) -> Result<String> {
      Ok(self.state.lock().system_name.clone())
   }

   async fn alias(&self) -> Result<String> {
      Ok(self.state.lock().alias.clone())
   }

   async fn set_alias(&self, alias: &str) -> Result<()> {
      self.record(format!("set_alias {alias}"));
      let value = if alias.is_empty() {
         self.state.lock().system_name.clone()
      } else {
         alias.to_string()
      };
      self.update(|s| &mut s.alias, value.clone(), AdapterProp::Alias(value));
      Ok(())
   }

   async fn is_powered(&self) -> Result<bool> {
      Ok(self.state.lock().powered)
   }

   async fn set_powered(&self, powered: bool) -> Result<()> {
      self.record(format!("set_powered {powered}"));
      self.update(|s| &mut s.powered, powered, AdapterProp::Powered(powered));
      if !powered {
         self.update(|s| &mut s.discovering, false, AdapterProp::Discovering(false));
      }
      Ok(())
   }

   async fn is_discovering(&self) -> Result<bool> {
      Ok(self.state.lock().discovering)
   }

   async fn is_discoverable(&self) -> Result<bool> {
      Ok(self.state.lock().discoverable)
   }

   async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
      self.record(format!("set_discoverable {discoverable}"));
      self.update(
         |s| &mut s.discoverable,
         discoverable,
         AdapterProp::Discoverable(discoverable),
      );
      Ok(())
   }

   async fn discoverable_timeout(&self) -> Result<u32> {
      Ok(self.state.lock().discoverable_timeout)
   }

   async fn set_discoverable_timeout(&self, timeout: u32) -> Result<()> {
      self.record(format!("set_discoverable_timeout {timeout}"));
      self.update(
         |s| &mut s.discoverable_timeout,
         timeout,
         AdapterProp::DiscoverableTimeout(timeout),
      );
      Ok(())
   }

   async fn start_discovery(&self) -> Result<()> {
      self.record("start_discovery");
      if !self.state.lock().powered {
         return Err(failure("Resource Not Ready"));
      }
      self.update(|s| &mut s.discovering, true, AdapterProp::Discovering(true));
      Ok(())
   }

   async fn stop_discovery(&self) -> Result<()> {
      self.record("stop_discovery");
      self.update(|s| &mut s.discovering, false, AdapterProp::Discovering(false));
      Ok(())
   }

   async fn device_addresses(&self) -> Result<Vec<Address>> {
      Ok(self.state.lock().devices.keys().copied().collect())
   }

   fn device(&self, address: Address) -> Result<DeviceHandle> {
      self
         .state
         .lock()
         .devices
         .get(&address)
         .cloned()
         .map(|d| d as DeviceHandle)
         .ok_or_else(|| failure("Does Not Exist"))
   }

   async fn remove_device(&self, address: Address) -> Result<()> {
      self.record(format!("remove {address}"));
      self.lose(address);
      Ok(())
   }

   async fn events(&self) -> Result<BoxStream<'static, AdapterSignal>> {
      Ok(subscribe(&self.senders))
   }
}

#[derive(Default)]
pub struct FakeDeviceState {
   pub name: Option<String>,
   pub alias: String,
   pub paired: bool,
   pub trusted: bool,
   pub connected: bool,
}

pub struct FakeDevice {
   pub address: Address,
   pub state: Mutex<FakeDeviceState>,
   connects: AtomicUsize,
   fail_connect: AtomicBool,
   hold_connect: AtomicBool,
   gate: Notify,
   senders: Senders<DeviceProp>,
}

impl FakeDevice {
   pub fn new(address: &str, alias: &str) -> Arc<Self> {
      Arc::new(Self {
         address: Address::from_str(address).unwrap(),
         state: Mutex::new(FakeDeviceState {
            name: Some(alias.to_string()),
            alias: alias.to_string(),
            ..Default::default()
         }),
         connects: AtomicUsize::new(0),
         fail_connect: AtomicBool::new(false),
         hold_connect: AtomicBool::new(false),
         gate: Notify::new(),
         senders: Mutex::new(Vec::new()),
      })
   }

   pub fn paired(self: Arc<Self>) -> Arc<Self> {
      self.state.lock().paired = true;
      self
   }

   pub fn connects(&self) -> usize {
      self.connects.load(Ordering::SeqCst)
   }

   pub fn fail_connect(&self, fail: bool) {
      self.fail_connect.store(fail, Ordering::SeqCst);
   }

   /// Makes every connect wait for [`FakeDevice::release_connect`].
   pub fn hold_connect(&self) {
      self.hold_connect.store(true, Ordering::SeqCst);
   }

   pub fn release_connect(&self) {
      self.gate.notify_one();
   }

   pub fn emit(&self, prop: DeviceProp) {
      broadcast(&self.senders, prop);
   }
}

#[async_trait]
impl DeviceProxy for FakeDevice {
   fn address(&self) -> Address {
      self.address
   }

   async fn name(&self) -> Result<Option<String>> {
      Ok(self.state.lock().name.clone())
   }

   async fn alias(&self) -> Result<String> {
      Ok(self.state.lock().alias.clone())
   }

   async fn set_alias(&self, alias: &str) -> Result<()> {
      self.state.lock().alias = alias.to_string();
      self.emit(DeviceProp::Alias(alias.to_string()));
      Ok(())
   }

   async fn icon(&self) -> Result<Option<String>> {
      Ok(Some("audio-card".to_string()))
   }

   async fn is_paired(&self) -> Result<bool> {
      Ok(self.state.lock().paired)
   }

   async fn is_trusted(&self) -> Result<bool> {
      Ok(self.state.lock().trusted)
   }

   async fn set_trusted(&self, trusted: bool) -> Result<()> {
      self.state.lock().trusted = trusted;
      self.emit(DeviceProp::Trusted(trusted));
      Ok(())
   }

   async fn is_connected(&self) -> Result<bool> {
      Ok(self.state.lock().connected)
   }

   async fn rssi(&self) -> Result<Option<i16>> {
      Ok(None)
   }

   async fn connect(&self) -> Result<()> {
      self.connects.fetch_add(1, Ordering::SeqCst);
      if self.hold_connect.load(Ordering::SeqCst) {
         self.gate.notified().await;
      }
      if self.fail_connect.load(Ordering::SeqCst) {
         return Err(failure("Host is down"));
      }
      self.state.lock().connected = true;
      self.emit(DeviceProp::Connected(true));
      Ok(())
   }

   async fn disconnect(&self) -> Result<()> {
      self.state.lock().connected = false;
      self.emit(DeviceProp::Connected(false));
      Ok(())
   }

   async fn events(&self) -> Result<BoxStream<'static, DeviceProp>> {
      Ok(subscribe(&self.senders))
   }
}
