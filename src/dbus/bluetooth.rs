use log::info;
use zbus::{
   interface,
   object_server::SignalEmitter,
   zvariant::{ObjectPath, OwnedObjectPath},
};

use crate::{bluetooth::manager::BluetoothManager, dbus::object_path};

pub struct BluetoothService {
   manager: BluetoothManager,
}

impl BluetoothService {
   pub const fn new(manager: BluetoothManager) -> Self {
      Self { manager }
   }

   pub async fn notify_property(
      &self,
      name: &str,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match name {
         "State" => self.state_changed(emitter).await,
         _ => Ok(()),
      }
   }
}

#[interface(name = "org.desktopd.Bluetooth")]
impl BluetoothService {
   async fn connect_device(
      &self,
      device: ObjectPath<'_>,
      adapter: ObjectPath<'_>,
   ) -> zbus::fdo::Result<()> {
      info!("ConnectDevice {device} on {adapter}");
      Ok(self.manager.connect_device(device.as_str(), adapter.as_str()).await?)
   }

   async fn disconnect_device(&self, device: ObjectPath<'_>) -> zbus::fdo::Result<()> {
      info!("DisconnectDevice {device}");
      Ok(self.manager.disconnect_device(device.as_str()).await?)
   }

   async fn remove_device(
      &self,
      adapter: ObjectPath<'_>,
      device: ObjectPath<'_>,
   ) -> zbus::fdo::Result<()> {
      info!("RemoveDevice {device} from {adapter}");
      Ok(self.manager.remove_device(adapter.as_str(), device.as_str()).await?)
   }

   async fn set_device_alias(&self, device: ObjectPath<'_>, alias: String) -> zbus::fdo::Result<()> {
      Ok(self.manager.set_device_alias(device.as_str(), &alias).await?)
   }

   async fn set_device_trusted(
      &self,
      device: ObjectPath<'_>,
      trusted: bool,
   ) -> zbus::fdo::Result<()> {
      Ok(self.manager.set_device_trusted(device.as_str(), trusted).await?)
   }

   async fn get_devices(&self, adapter: ObjectPath<'_>) -> zbus::fdo::Result<String> {
      Ok(self.manager.get_devices(adapter.as_str())?)
   }

   async fn get_adapters(&self) -> zbus::fdo::Result<String> {
      Ok(self.manager.get_adapters()?)
   }

   async fn request_discovery(&self, adapter: ObjectPath<'_>) -> zbus::fdo::Result<()> {
      Ok(self.manager.request_discovery(adapter.as_str()).await?)
   }

   async fn send_files(
      &self,
      device: String,
      files: Vec<String>,
   ) -> zbus::fdo::Result<OwnedObjectPath> {
      info!("SendFiles {} file(s) to {device}", files.len());
      let session = self.manager.send_files(device.as_str(), files).await?;
      Ok(object_path(&session)?)
   }

   async fn cancel_transfer_session(&self, session: ObjectPath<'_>) -> zbus::fdo::Result<()> {
      Ok(self.manager.cancel_transfer_session(session.as_str())?)
   }

   async fn set_adapter_powered(
      &self,
      adapter: ObjectPath<'_>,
      powered: bool,
   ) -> zbus::fdo::Result<()> {
      info!("SetAdapterPowered {adapter} {powered}");
      Ok(self.manager.set_adapter_powered(adapter.as_str(), powered).await?)
   }

   async fn set_adapter_alias(&self, adapter: ObjectPath<'_>, alias: String) -> zbus::fdo::Result<()> {
      Ok(self.manager.set_adapter_alias(adapter.as_str(), &alias).await?)
   }

   async fn set_adapter_discoverable(
      &self,
      adapter: ObjectPath<'_>,
      discoverable: bool,
   ) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_adapter_discoverable(adapter.as_str(), discoverable)
         .await?)
   }

   async fn set_adapter_discovering(
      &self,
      adapter: ObjectPath<'_>,
      discovering: bool,
   ) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_adapter_discovering(adapter.as_str(), discovering)
         .await?)
   }

   async fn set_adapter_discoverable_timeout(
      &self,
      adapter: ObjectPath<'_>,
      timeout: u32,
   ) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_adapter_discoverable_timeout(adapter.as_str(), timeout)
         .await?)
   }

   async fn confirm(&self, device: ObjectPath<'_>, accept: bool) -> zbus::fdo::Result<()> {
      Ok(self.manager.confirm(device.as_str(), accept)?)
   }

   async fn feed_pin_code(
      &self,
      device: ObjectPath<'_>,
      accept: bool,
      pin_code: String,
   ) -> zbus::fdo::Result<()> {
      Ok(self.manager.feed_pin_code(device.as_str(), accept, &pin_code)?)
   }

   async fn feed_passkey(
      &self,
      device: ObjectPath<'_>,
      accept: bool,
      passkey: u32,
   ) -> zbus::fdo::Result<()> {
      Ok(self.manager.feed_passkey(device.as_str(), accept, passkey)?)
   }

   async fn clear_unpaired_device(&self) -> zbus::fdo::Result<()> {
      Ok(self.manager.clear_unpaired_device().await?)
   }

   async fn debug_info(&self) -> zbus::fdo::Result<String> {
      Ok(self.manager.debug_info()?)
   }

   #[zbus(property)]
   async fn state(&self) -> u32 {
      self.manager.state()
   }

   #[zbus(signal)]
   pub async fn adapter_added(emitter: &SignalEmitter<'_>, adapter: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_removed(emitter: &SignalEmitter<'_>, adapter: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn adapter_properties_changed(
      emitter: &SignalEmitter<'_>,
      adapter: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_added(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_removed(emitter: &SignalEmitter<'_>, device: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_properties_changed(
      emitter: &SignalEmitter<'_>,
      device: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn connect_failed(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
      alias: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn request_pin_code(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn request_passkey(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn request_confirmation(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
      passkey: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn request_authorization(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn authorize_service(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
      uuid: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn display_pin_code(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
      pin_code: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn display_passkey(
      emitter: &SignalEmitter<'_>,
      device: ObjectPath<'_>,
      passkey: u32,
      entered: u32,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn cancelled(emitter: &SignalEmitter<'_>, device: ObjectPath<'_>) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_created(
      emitter: &SignalEmitter<'_>,
      file: &str,
      transfer: ObjectPath<'_>,
      session: ObjectPath<'_>,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_removed(
      emitter: &SignalEmitter<'_>,
      file: &str,
      transfer: ObjectPath<'_>,
      session: ObjectPath<'_>,
      done: bool,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn transfer_failed(
      emitter: &SignalEmitter<'_>,
      file: &str,
      session: ObjectPath<'_>,
      message: &str,
   ) -> zbus::Result<()>;
}
