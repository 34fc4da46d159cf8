//! Desktop session daemons.
//!
//! Publishes bluetooth management, session activity, gesture dispatch,
//! touchpad configuration and battery warn levels on the session bus.

use std::{os::unix::fs::MetadataExt, sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{debug, info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, object_server::InterfaceRef, zvariant::ObjectPath};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod gesture;
mod input;
mod power;
mod process;
mod property;
mod registry;
mod session;
mod settings;
mod timer;

use crate::{
   bluetooth::{
      agent::PairingAgent,
      manager::BluetoothManager,
      obex::{FileSender, ZbusObex},
      remote::BluerBluez,
   },
   config::Config,
   dbus::{
      BLUETOOTH_PATH, GESTURE_PATH, POWER_PATH, SERVICE_NAME, SESSION_WATCHER_PATH,
      TOUCHPAD_PATH,
      bluetooth::{BluetoothService, BluetoothServiceSignals},
      gesture::GestureService,
      input::TouchpadService,
      power::WarnLevelService,
      session::SessionWatcherService,
   },
   error::{DaemonError, Result},
   event::{BusObject, Event, EventBus, PairingRequest},
   gesture::{
      daemon::{GestureDaemon, ZbusGestureDaemon},
      manager::{GestureBackends, GestureManager},
      screen::ZbusScreenLayout,
      x11::X11Desktop,
   },
   input::{touchpad::Touchpad, xinput::XinputBackend},
   power::warn_level::WarnLevelManager,
   process::{CommandRunner, TokioRunner},
   session::{
      login1::ZbusLogin,
      watcher::{DesktopEffects, SessionWatcher},
   },
   settings::SettingsStore,
};

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting desktopd...");

   let config = Config::load()?;
   let settings = Arc::new(SettingsStore::load(
      Config::config_dir()?.join("settings.toml"),
      &[
         gesture::manager::SCHEMA,
         input::touchpad::SCHEMA,
         power::warn_level::SCHEMA,
      ],
   )?);
   let gesture_config = config.gesture.clone();
   let config = Arc::new(parking_lot::Mutex::new(config));

   let event_bus = EventProcessor::new();
   let runner: Arc<dyn CommandRunner> = Arc::new(TokioRunner);
   let system = Connection::system().await?;
   let connection = Connection::session().await?;

   // Bluetooth
   let bluez_session = bluer::Session::new().await?;
   let agent = PairingAgent::new(event_bus.clone());
   let _agent = bluez_session.register_agent(agent.to_bluer()).await?;
   let files = FileSender::new(Arc::new(ZbusObex::new(connection.clone())), event_bus.clone());
   let bluetooth = BluetoothManager::new(
      Arc::new(BluerBluez::new(bluez_session.clone())),
      agent,
      Some(files),
      event_bus.clone(),
      config.clone(),
   );

   // Session watcher
   let uid = std::fs::metadata("/proc/self")?.uid();
   let watcher = SessionWatcher::new(
      Arc::new(ZbusLogin::new(system.clone()).await?),
      Arc::new(DesktopEffects::new(runner.clone(), Some(connection.clone()))),
      event_bus.clone(),
      uid,
   );

   // Gestures
   let desktop = Arc::new(X11Desktop::new(runner.clone()));
   let daemon: Option<Arc<dyn GestureDaemon>> = match ZbusGestureDaemon::new(&system).await {
      Ok(daemon) => Some(Arc::new(daemon)),
      Err(e) => {
         warn!("Gesture daemon unavailable: {e}");
         None
      },
   };
   let gestures = GestureManager::load(
      &gesture_config,
      settings.clone(),
      GestureBackends {
         session: Arc::new(watcher.clone()),
         probe: desktop.clone(),
         wm: desktop,
         runner: runner.clone(),
         screen: Arc::new(ZbusScreenLayout::new(connection.clone())),
         daemon,
      },
      event_bus.clone(),
   )?;

   // Input devices and power
   let touchpad = Touchpad::new(
      Arc::new(XinputBackend::new(runner.clone())),
      runner,
      settings.clone(),
      event_bus.clone(),
   );
   let warn_levels = WarnLevelManager::new(settings, event_bus.clone());
   warn_levels.set_change_callback(|levels| debug!("warn levels now {levels:?}"));

   let server = connection.object_server();
   server
      .at(BLUETOOTH_PATH, BluetoothService::new(bluetooth.clone()))
      .await?;
   server
      .at(SESSION_WATCHER_PATH, SessionWatcherService::new(watcher.clone()))
      .await?;
   server
      .at(GESTURE_PATH, GestureService::new(gestures.clone()))
      .await?;
   server
      .at(TOUCHPAD_PATH, TouchpadService::new(touchpad.clone()))
      .await?;
   server
      .at(POWER_PATH, WarnLevelService::new(warn_levels.clone()))
      .await?;
   connection.request_name(SERVICE_NAME).await?;

   event_bus.clone().spawn_dispatcher(&connection).await?;

   if let Err(e) = bluetooth.start().await {
      warn!("Bluetooth manager failed to start: {e}");
   }
   if let Err(e) = watcher.start().await {
      warn!("Session watcher failed to start: {e}");
   }
   gestures.start().await;
   touchpad.start().await;

   info!("desktopd started at {SERVICE_NAME}");

   signal::ctrl_c().await?;
   info!("Shutting down desktopd...");

   bluetooth.shutdown();
   watcher.shutdown();
   gestures.shutdown();
   touchpad.shutdown();
   warn_levels.shutdown();

   Ok(())
}

struct Interfaces {
   bluetooth: InterfaceRef<BluetoothService>,
   session: InterfaceRef<SessionWatcherService>,
   gesture: InterfaceRef<GestureService>,
   touchpad: InterfaceRef<TouchpadService>,
   power: InterfaceRef<WarnLevelService>,
}

struct EventProcessor {
   queue: SegQueue<Event>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<Event> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(&self, ifaces: &Interfaces, event: Event) -> Result<()> {
      let bt = &ifaces.bluetooth;
      match event {
         Event::AdapterAdded(json) => bt.adapter_added(&json).await?,
         Event::AdapterRemoved(json) => bt.adapter_removed(&json).await?,
         Event::AdapterPropertiesChanged(json) => bt.adapter_properties_changed(&json).await?,
         Event::DeviceAdded(json) => bt.device_added(&json).await?,
         Event::DeviceRemoved(json) => bt.device_removed(&json).await?,
         Event::DevicePropertiesChanged(json) => bt.device_properties_changed(&json).await?,
         Event::ConnectFailed { device, alias } => {
            bt.connect_failed(path(&device)?, &alias).await?;
         },
         Event::Pairing { device, request } => {
            let device = path(&device)?;
            match request {
               PairingRequest::RequestPinCode => bt.request_pin_code(device).await?,
               PairingRequest::RequestPasskey => bt.request_passkey(device).await?,
               PairingRequest::RequestConfirmation(passkey) => {
                  bt.request_confirmation(device, &passkey).await?;
               },
               PairingRequest::RequestAuthorization => bt.request_authorization(device).await?,
               PairingRequest::AuthorizeService(uuid) => {
                  bt.authorize_service(device, &uuid).await?;
               },
               PairingRequest::DisplayPinCode(pin) => bt.display_pin_code(device, &pin).await?,
               PairingRequest::DisplayPasskey { passkey, entered } => {
                  bt.display_passkey(device, passkey, entered.into()).await?;
               },
               PairingRequest::Cancelled => bt.cancelled(device).await?,
            }
         },
         Event::TransferCreated {
            file,
            transfer,
            session,
         } => {
            bt.transfer_created(&file, path(&transfer)?, path(&session)?)
               .await?;
         },
         Event::TransferRemoved {
            file,
            transfer,
            session,
            done,
         } => {
            bt.transfer_removed(&file, path(&transfer)?, path(&session)?, done)
               .await?;
         },
         Event::TransferFailed {
            file,
            session,
            message,
         } => {
            bt.transfer_failed(&file, path(&session)?, &message).await?;
         },
         Event::PropertyChanged(object, name) => match object {
            BusObject::Bluetooth => {
               bt.get()
                  .await
                  .notify_property(name, bt.signal_emitter())
                  .await?;
            },
            BusObject::SessionWatcher => {
               let iface = &ifaces.session;
               iface
                  .get()
                  .await
                  .notify_property(name, iface.signal_emitter())
                  .await?;
            },
            BusObject::Gesture => {
               let iface = &ifaces.gesture;
               iface
                  .get()
                  .await
                  .notify_property(name, iface.signal_emitter())
                  .await?;
            },
            BusObject::Touchpad => {
               let iface = &ifaces.touchpad;
               iface
                  .get()
                  .await
                  .notify_property(name, iface.signal_emitter())
                  .await?;
            },
            BusObject::WarnLevel => {
               let iface = &ifaces.power;
               iface
                  .get()
                  .await
                  .notify_property(name, iface.signal_emitter())
                  .await?;
            },
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: &Connection) -> Result<()> {
      let server = connection.object_server();
      let ifaces = Interfaces {
         bluetooth: server.interface(BLUETOOTH_PATH).await?,
         session: server.interface(SESSION_WATCHER_PATH).await?,
         gesture: server.interface(GESTURE_PATH).await?,
         touchpad: server.interface(TOUCHPAD_PATH).await?,
         power: server.interface(POWER_PATH).await?,
      };
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&ifaces, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, event: Event) {
      self.queue.push(event);
      self.notifier.notify_waiters();
   }
}

fn path(path: &str) -> Result<ObjectPath<'_>> {
   ObjectPath::try_from(path).map_err(|_| DaemonError::InvalidPath(path.into()))
}
