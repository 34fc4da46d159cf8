//! Access to the BlueZ daemon.
//!
//! The manager only ever talks to BlueZ through the traits in this module.
//! [`BluerBluez`] implements them on top of `bluer`; tests substitute
//! in-memory fakes.

use std::{str::FromStr, sync::Arc};

use async_trait::async_trait;
use bluer::{AdapterEvent, AdapterProperty, Address, DeviceEvent, DeviceProperty, SessionEvent};
use futures::{StreamExt, stream::BoxStream};
use log::debug;
use parking_lot::Mutex;
use smol_str::{SmolStr, format_smolstr};
use tokio::task::JoinHandle;

use crate::error::{DaemonError, Result};

const BLUEZ_ROOT: &str = "/org/bluez";

pub type AdapterHandle = Arc<dyn AdapterProxy>;
pub type DeviceHandle = Arc<dyn DeviceProxy>;

/// Adapter lifecycle notifications from the BlueZ object manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BluezSignal {
   AdapterAdded(SmolStr),
   AdapterRemoved(SmolStr),
}

/// Mirrored adapter properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterProp {
   Name(String),
   Alias(String),
   Powered(bool),
   Discovering(bool),
   Discoverable(bool),
   DiscoverableTimeout(u32),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterSignal {
   DeviceAdded(Address),
   DeviceRemoved(Address),
   Property(AdapterProp),
}

/// Mirrored device properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceProp {
   Name(String),
   Alias(String),
   Icon(String),
   Paired(bool),
   Trusted(bool),
   Connected(bool),
   Rssi(i16),
}

#[async_trait]
pub trait BluezProxy: Send + Sync {
   async fn adapter_names(&self) -> Result<Vec<SmolStr>>;
   fn adapter(&self, name: &str) -> Result<AdapterHandle>;
   async fn events(&self) -> Result<BoxStream<'static, BluezSignal>>;
}

#[async_trait]
pub trait AdapterProxy: Send + Sync {
   /// Interface name, e.g. `hci0`.
   fn name(&self) -> &str;
   async fn address(&self) -> Result<Address>;
   async fn system_name(&self) -> Result<String>;
   async fn alias(&self) -> Result<String>;
   async fn set_alias(&self, alias: &str) -> Result<()>;
   async fn is_powered(&self) -> Result<bool>;
   async fn set_powered(&self, powered: bool) -> Result<()>;
   async fn is_discovering(&self) -> Result<bool>;
   async fn is_discoverable(&self) -> Result<bool>;
   async fn set_discoverable(&self, discoverable: bool) -> Result<()>;
   async fn discoverable_timeout(&self) -> Result<u32>;
   async fn set_discoverable_timeout(&self, timeout: u32) -> Result<()>;
   async fn start_discovery(&self) -> Result<()>;
   async fn stop_discovery(&self) -> Result<()>;
   async fn device_addresses(&self) -> Result<Vec<Address>>;
   fn device(&self, address: Address) -> Result<DeviceHandle>;
   async fn remove_device(&self, address: Address) -> Result<()>;
   async fn events(&self) -> Result<BoxStream<'static, AdapterSignal>>;
}

#[async_trait]
pub trait DeviceProxy: Send + Sync {
   fn address(&self) -> Address;
   async fn name(&self) -> Result<Option<String>>;
   async fn alias(&self) -> Result<String>;
   async fn set_alias(&self, alias: &str) -> Result<()>;
   async fn icon(&self) -> Result<Option<String>>;
   async fn is_paired(&self) -> Result<bool>;
   async fn is_trusted(&self) -> Result<bool>;
   async fn set_trusted(&self, trusted: bool) -> Result<()>;
   async fn is_connected(&self) -> Result<bool>;
   async fn rssi(&self) -> Result<Option<i16>>;
   async fn connect(&self) -> Result<()>;
   async fn disconnect(&self) -> Result<()>;
   async fn events(&self) -> Result<BoxStream<'static, DeviceProp>>;
}

// === Object paths ===

pub fn adapter_path(name: &str) -> SmolStr {
   format_smolstr!("{BLUEZ_ROOT}/{name}")
}

pub fn device_path(adapter: &str, address: Address) -> SmolStr {
   let addr = address.to_string().replace(':', "_");
   format_smolstr!("{BLUEZ_ROOT}/{adapter}/dev_{addr}")
}

/// Extracts the adapter name from `/org/bluez/<name>`.
pub fn parse_adapter_path(path: &str) -> Result<SmolStr> {
   path
      .strip_prefix(BLUEZ_ROOT)
      .and_then(|rest| rest.strip_prefix('/'))
      .filter(|name| !name.is_empty() && !name.contains('/'))
      .map(SmolStr::from)
      .ok_or_else(|| DaemonError::InvalidPath(path.into()))
}

/// Splits `/org/bluez/<adapter>/dev_XX_XX_XX_XX_XX_XX` into its adapter name
/// and device address.
pub fn parse_device_path(path: &str) -> Result<(SmolStr, Address)> {
   let invalid = || DaemonError::InvalidPath(path.into());
   let (adapter, device) = path.rsplit_once('/').ok_or_else(invalid)?;
   let adapter = parse_adapter_path(adapter)?;
   let address = device
      .strip_prefix("dev_")
      .map(|a| a.replace('_', ":"))
      .and_then(|a| Address::from_str(&a).ok())
      .ok_or_else(invalid)?;
   Ok((adapter, address))
}

// === bluer backend ===

fn adapter_prop(prop: AdapterProperty) -> Option<AdapterProp> {
   Some(match prop {
      AdapterProperty::SystemName(v) => AdapterProp::Name(v),
      AdapterProperty::Alias(v) => AdapterProp::Alias(v),
      AdapterProperty::Powered(v) => AdapterProp::Powered(v),
      AdapterProperty::Discovering(v) => AdapterProp::Discovering(v),
      AdapterProperty::Discoverable(v) => AdapterProp::Discoverable(v),
      AdapterProperty::DiscoverableTimeout(v) => AdapterProp::DiscoverableTimeout(v),
      _ => return None,
   })
}

fn device_prop(prop: DeviceProperty) -> Option<DeviceProp> {
   Some(match prop {
      DeviceProperty::Name(v) => DeviceProp::Name(v),
      DeviceProperty::Alias(v) => DeviceProp::Alias(v),
      DeviceProperty::Icon(v) => DeviceProp::Icon(v),
      DeviceProperty::Paired(v) => DeviceProp::Paired(v),
      DeviceProperty::Trusted(v) => DeviceProp::Trusted(v),
      DeviceProperty::Connected(v) => DeviceProp::Connected(v),
      DeviceProperty::Rssi(v) => DeviceProp::Rssi(v),
      _ => return None,
   })
}

pub struct BluerBluez {
   session: bluer::Session,
}

impl BluerBluez {
   pub const fn new(session: bluer::Session) -> Self {
      Self { session }
   }
}

#[async_trait]
impl BluezProxy for BluerBluez {
   async fn adapter_names(&self) -> Result<Vec<SmolStr>> {
      Ok(self
         .session
         .adapter_names()
         .await?
         .into_iter()
         .map(SmolStr::from)
         .collect())
   }

   fn adapter(&self, name: &str) -> Result<AdapterHandle> {
      Ok(Arc::new(BluerAdapter {
         adapter: self.session.adapter(name)?,
         discovery: Mutex::new(None),
      }))
   }

   async fn events(&self) -> Result<BoxStream<'static, BluezSignal>> {
      let events = self.session.events().await?;
      Ok(events
         .filter_map(|event| async move {
            match event {
               SessionEvent::AdapterAdded(name) => Some(BluezSignal::AdapterAdded(name.into())),
               SessionEvent::AdapterRemoved(name) => {
                  Some(BluezSignal::AdapterRemoved(name.into()))
               },
               #[allow(unreachable_patterns)]
               _ => None,
            }
         })
         .boxed())
   }
}

/// `bluer` adapter. BlueZ keeps a discovery session alive for as long as the
/// client holds the discovery stream, so StartDiscovery/StopDiscovery map to
/// holding and dropping a draining task.
struct BluerAdapter {
   adapter: bluer::Adapter,
   discovery: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl AdapterProxy for BluerAdapter {
   fn name(&self) -> &str {
      self.adapter.name()
   }

   async fn address(&self) -> Result<Address> {
      Ok(self.adapter.address().await?)
   }

   async fn system_name(&self) -> Result<String> {
      Ok(self.adapter.system_name().await?)
   }

   async fn alias(&self) -> Result<String> {
      Ok(self.adapter.alias().await?)
   }

   async fn set_alias(&self, alias: &str) -> Result<()> {
      Ok(self.adapter.set_alias(alias.to_string()).await?)
   }

   async fn is_powered(&self) -> Result<bool> {
      Ok(self.adapter.is_powered().await?)
   }

   async fn set_powered(&self, powered: bool) -> Result<()> {
      Ok(self.adapter.set_powered(powered).await?)
   }

   async fn is_discovering(&self) -> Result<bool> {
      Ok(self.adapter.is_discovering().await?)
   }

   async fn is_discoverable(&self) -> Result<bool> {
      Ok(self.adapter.is_discoverable().await?)
   }

   async fn set_discoverable(&self, discoverable: bool) -> Result<()> {
      Ok(self.adapter.set_discoverable(discoverable).await?)
   }

   async fn discoverable_timeout(&self) -> Result<u32> {
      Ok(self.adapter.discoverable_timeout().await?)
   }

   async fn set_discoverable_timeout(&self, timeout: u32) -> Result<()> {
      Ok(self.adapter.set_discoverable_timeout(timeout).await?)
   }

   async fn start_discovery(&self) -> Result<()> {
      let mut stream = Box::pin(self.adapter.discover_devices().await?);
      let name = self.adapter.name().to_string();
      let task = tokio::spawn(async move {
         while stream.next().await.is_some() {}
         debug!("discovery stream on {name} ended");
      });
      if let Some(old) = self.discovery.lock().replace(task) {
         old.abort();
      }
      Ok(())
   }

   async fn stop_discovery(&self) -> Result<()> {
      if let Some(task) = self.discovery.lock().take() {
         task.abort();
      }
      Ok(())
   }

   async fn device_addresses(&self) -> Result<Vec<Address>> {
      Ok(self.adapter.device_addresses().await?)
   }

   fn device(&self, address: Address) -> Result<DeviceHandle> {
      Ok(Arc::new(BluerDevice {
         device: self.adapter.device(address)?,
      }))
   }

   async fn remove_device(&self, address: Address) -> Result<()> {
      Ok(self.adapter.remove_device(address).await?)
   }

   async fn events(&self) -> Result<BoxStream<'static, AdapterSignal>> {
      let events = self.adapter.events().await?;
      Ok(events
         .filter_map(|event| async move {
            match event {
               AdapterEvent::DeviceAdded(addr) => Some(AdapterSignal::DeviceAdded(addr)),
               AdapterEvent::DeviceRemoved(addr) => Some(AdapterSignal::DeviceRemoved(addr)),
               AdapterEvent::PropertyChanged(prop) => adapter_prop(prop).map(AdapterSignal::Property),
               #[allow(unreachable_patterns)]
               _ => None,
            }
         })
         .boxed())
   }
}

impl Drop for BluerAdapter {
   fn drop(&mut self) {
      if let Some(task) = self.discovery.get_mut().take() {
         task.abort();
      }
   }
}

struct BluerDevice {
   device: bluer::Device,
}

#[async_trait]
impl DeviceProxy for BluerDevice {
   fn address(&self) -> Address {
      self.device.address()
   }

   async fn name(&self) -> Result<Option<String>> {
      Ok(self.device.name().await?)
   }

   async fn alias(&self) -> Result<String> {
      Ok(self.device.alias().await?)
   }

   async fn set_alias(&self, alias: &str) -> Result<()> {
      Ok(self.device.set_alias(alias.to_string()).await?)
   }

   async fn icon(&self) -> Result<Option<String>> {
      Ok(self.device.icon().await?)
   }

   async fn is_paired(&self) -> Result<bool> {
      Ok(self.device.is_paired().await?)
   }

   async fn is_trusted(&self) -> Result<bool> {
      Ok(self.device.is_trusted().await?)
   }

   async fn set_trusted(&self, trusted: bool) -> Result<()> {
      Ok(self.device.set_trusted(trusted).await?)
   }

   async fn is_connected(&self) -> Result<bool> {
      Ok(self.device.is_connected().await?)
   }

   async fn rssi(&self) -> Result<Option<i16>> {
      Ok(self.device.rssi().await?)
   }

   async fn connect(&self) -> Result<()> {
      Ok(self.device.connect().await?)
   }

   async fn disconnect(&self) -> Result<()> {
      Ok(self.device.disconnect().await?)
   }

   async fn events(&self) -> Result<BoxStream<'static, DeviceProp>> {
      let events = self.device.events().await?;
      Ok(events
         .filter_map(|event| async move {
            match event {
               DeviceEvent::PropertyChanged(prop) => device_prop(prop),
               #[allow(unreachable_patterns)]
               _ => None,
            }
         })
         .boxed())
   }
}
