//! Touchpad configuration.
//!
//! Tunables live in the settings store and are pushed to every touchpad the
//! backend reports. A settings change re-applies only the tunable it touched;
//! a hot-plug recomputes `Exist`/`DeviceList` and re-applies all of them.
//! Disable-while-typing falls back to `syndaemon` when no device can do it
//! natively.

use std::{
   path::PathBuf,
   sync::{Arc, Weak},
   time::Duration,
};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::{task::JoinHandle, time};

use crate::{
   error::{DaemonError, Result},
   event::{BusObject, Event, EventSender},
   process::CommandRunner,
   property::{BusSink, PropertyStore},
   settings::{ChangeOrigin, DefaultValue, Key, SettingValue, SettingsStore, key},
};

pub const TOUCHPAD_ENABLED: &str = "touchpad.touchpad-enabled";
pub const LEFT_HANDED: &str = "touchpad.left-handed";
pub const DISABLE_WHILE_TYPING: &str = "touchpad.disable-while-typing";
pub const NATURAL_SCROLL: &str = "touchpad.natural-scroll";
pub const EDGE_SCROLL: &str = "touchpad.edge-scroll-enabled";
pub const HORIZ_SCROLL: &str = "touchpad.horiz-scroll-enabled";
pub const VERT_SCROLL: &str = "touchpad.vert-scroll-enabled";
pub const TAP_CLICK: &str = "touchpad.tap-to-click";
pub const PALM_DETECT: &str = "touchpad.palm-detect";
pub const MOTION_ACCELERATION: &str = "touchpad.motion-acceleration";
pub const MOTION_THRESHOLD: &str = "touchpad.motion-threshold";
pub const MOTION_SCALING: &str = "touchpad.motion-scaling";
pub const DELTA_SCROLL: &str = "touchpad.delta-scroll";
pub const PALM_MIN_WIDTH: &str = "touchpad.palm-min-width";
pub const PALM_MIN_Z: &str = "touchpad.palm-min-pressure";
pub const DISABLE_WHILE_TYPING_CMD: &str = "touchpad.disable-while-typing-cmd";
pub const DOUBLE_CLICK: &str = "mouse.double-click";
pub const DRAG_THRESHOLD: &str = "mouse.drag-threshold";

pub const SCHEMA: &[Key] = &[
   key(TOUCHPAD_ENABLED, DefaultValue::Bool(true)),
   key(LEFT_HANDED, DefaultValue::Bool(false)),
   key(DISABLE_WHILE_TYPING, DefaultValue::Bool(true)),
   key(NATURAL_SCROLL, DefaultValue::Bool(false)),
   key(EDGE_SCROLL, DefaultValue::Bool(false)),
   key(HORIZ_SCROLL, DefaultValue::Bool(true)),
   key(VERT_SCROLL, DefaultValue::Bool(true)),
   key(TAP_CLICK, DefaultValue::Bool(true)),
   key(PALM_DETECT, DefaultValue::Bool(false)),
   key(MOTION_ACCELERATION, DefaultValue::Double(1.6)),
   key(MOTION_THRESHOLD, DefaultValue::Double(8.0)),
   key(MOTION_SCALING, DefaultValue::Double(1000.0)),
   key(DELTA_SCROLL, DefaultValue::Int(0)),
   key(PALM_MIN_WIDTH, DefaultValue::Int(10)),
   key(PALM_MIN_Z, DefaultValue::Int(100)),
   key(DISABLE_WHILE_TYPING_CMD, DefaultValue::Str("syndaemon -i 1 -K -t")),
   key(DOUBLE_CLICK, DefaultValue::Int(400)),
   key(DRAG_THRESHOLD, DefaultValue::Int(4)),
];

/// Bus property name of every tunable, paired with its settings key.
pub const TUNABLES: &[(&str, &str)] = &[
   ("TPadEnable", TOUCHPAD_ENABLED),
   ("LeftHanded", LEFT_HANDED),
   ("DisableIfTyping", DISABLE_WHILE_TYPING),
   ("NaturalScroll", NATURAL_SCROLL),
   ("EdgeScroll", EDGE_SCROLL),
   ("HorizScroll", HORIZ_SCROLL),
   ("VertScroll", VERT_SCROLL),
   ("TapClick", TAP_CLICK),
   ("PalmDetect", PALM_DETECT),
   ("MotionAcceleration", MOTION_ACCELERATION),
   ("MotionThreshold", MOTION_THRESHOLD),
   ("MotionScaling", MOTION_SCALING),
   ("DoubleClick", DOUBLE_CLICK),
   ("DragThreshold", DRAG_THRESHOLD),
   ("DeltaScroll", DELTA_SCROLL),
   ("PalmMinWidth", PALM_MIN_WIDTH),
   ("PalmMinZ", PALM_MIN_Z),
];

pub const SYNDAEMON_PID_FILE: &str = "/tmp/syndaemon.pid";

/// How often the device list is re-read to catch hot-plugs.
const POLL_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TouchpadInfo {
   #[serde(rename = "Id")]
   pub id: i32,
   #[serde(rename = "Name")]
   pub name: String,
}

/// One device-level parameter.
#[derive(Debug, Clone, PartialEq)]
pub enum TouchpadSetting {
   Enabled(bool),
   LeftHanded(bool),
   NaturalScroll(bool),
   EdgeScroll(bool),
   TwoFingerScroll { vert: bool, horiz: bool },
   TapClick(bool),
   MotionAcceleration(f64),
   MotionThreshold(f64),
   MotionScaling(f64),
   DisableWhileTyping(bool),
   PalmDetect(bool),
   PalmDimensions { width: i32, z: i32 },
   ScrollDistance(i32),
}

/// Device driver access.
#[async_trait]
pub trait TouchpadBackend: Send + Sync {
   async fn touchpads(&self) -> Result<Vec<TouchpadInfo>>;
   /// Fails with [`DaemonError::FeatureNotSupported`] when the driver has no
   /// such knob.
   async fn configure(&self, device: &TouchpadInfo, setting: &TouchpadSetting) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct TouchpadProps {
   pub exist: bool,
   pub device_list: String,
}

pub struct Touchpad {
   backend: Arc<dyn TouchpadBackend>,
   runner: Arc<dyn CommandRunner>,
   settings: Arc<SettingsStore>,
   props: PropertyStore<TouchpadProps>,
   devices: Mutex<Vec<TouchpadInfo>>,
   pid_file: PathBuf,
   bus: EventSender,
   poll: Mutex<Option<JoinHandle<()>>>,
}

impl Touchpad {
   pub fn new(
      backend: Arc<dyn TouchpadBackend>,
      runner: Arc<dyn CommandRunner>,
      settings: Arc<SettingsStore>,
      bus: EventSender,
   ) -> Arc<Self> {
      Self::with_pid_file(backend, runner, settings, bus, SYNDAEMON_PID_FILE.into())
   }

   pub fn with_pid_file(
      backend: Arc<dyn TouchpadBackend>,
      runner: Arc<dyn CommandRunner>,
      settings: Arc<SettingsStore>,
      bus: EventSender,
      pid_file: PathBuf,
   ) -> Arc<Self> {
      let touchpad = Arc::new(Self {
         backend,
         runner,
         settings,
         props: PropertyStore::new(
            "touchpad",
            TouchpadProps::default(),
            BusSink::new(bus.clone(), BusObject::Touchpad),
         ),
         devices: Mutex::new(Vec::new()),
         pid_file,
         bus,
         poll: Mutex::new(None),
      });

      for prefix in ["touchpad.", "mouse."] {
         let weak = Arc::downgrade(&touchpad);
         touchpad.settings.connect_changed(prefix, move |name, origin| {
            if let Some(touchpad) = weak.upgrade() {
               touchpad.on_setting_changed(name, origin);
            }
         });
      }
      touchpad
   }

   /// Reads the device list, applies every tunable and starts watching for
   /// hot-plugs.
   pub async fn start(self: &Arc<Self>) {
      self.refresh().await;
      self.apply_all().await;

      let weak: Weak<Self> = Arc::downgrade(self);
      let handle = tokio::spawn(async move {
         loop {
            time::sleep(POLL_INTERVAL).await;
            let Some(touchpad) = weak.upgrade() else {
               break;
            };
            touchpad.handle_hotplug().await;
         }
      });
      if let Some(old) = self.poll.lock().replace(handle) {
         old.abort();
      }
   }

   pub fn shutdown(&self) {
      if let Some(handle) = self.poll.lock().take() {
         handle.abort();
      }
   }

   pub fn exist(&self) -> bool {
      self.props.read(|p| p.exist)
   }

   pub fn device_list(&self) -> String {
      self.props.read(|p| p.device_list.clone())
   }

   pub fn devices(&self) -> Vec<TouchpadInfo> {
      self.devices.lock().clone()
   }

   /// Re-reads the device list; re-applies every tunable when it changed.
   pub async fn handle_hotplug(&self) {
      if self.refresh().await {
         info!("Touchpad list changed: {}", self.device_list());
         self.apply_all().await;
      }
   }

   /// Recomputes `Exist` and `DeviceList`. Returns whether the list changed.
   pub async fn refresh(&self) -> bool {
      let devices = match self.backend.touchpads().await {
         Ok(devices) => devices,
         Err(e) => {
            warn!("Failed to list touchpads: {e}");
            return false;
         },
      };

      {
         let mut current = self.devices.lock();
         if *current == devices {
            return false;
         }
         current.clone_from(&devices);
      }

      let device_list = if devices.is_empty() {
         String::new()
      } else {
         serde_json::to_string(&devices).unwrap_or_default()
      };
      self.props.set("Exist", |p| &mut p.exist, !devices.is_empty());
      self
         .props
         .set("DeviceList", |p| &mut p.device_list, device_list);
      true
   }

   /// Current value of the tunable exported as `property`.
   pub fn get(&self, property: &str) -> Result<SettingValue> {
      self.settings.get(key_of(property)?)
   }

   pub fn set(&self, property: &str, value: SettingValue, origin: ChangeOrigin) -> Result<bool> {
      self.settings.set_from(key_of(property)?, value, origin)
   }

   /// Restores every key to its default; each effective change re-applies
   /// through the settings watcher.
   pub fn reset(&self) {
      for key in SCHEMA {
         if let Err(e) = self.settings.reset(key.name) {
            warn!("Failed to reset {}: {e}", key.name);
         }
      }
   }

   fn on_setting_changed(self: &Arc<Self>, name: &str, origin: ChangeOrigin) {
      if origin == ChangeOrigin::Local
         && let Some((property, _)) = TUNABLES.iter().find(|(_, key)| *key == name)
      {
         self
            .bus
            .emit(Event::PropertyChanged(BusObject::Touchpad, *property));
      }

      let Ok(runtime) = tokio::runtime::Handle::try_current() else {
         debug!("no runtime, not applying {name}");
         return;
      };
      let touchpad = self.clone();
      let name = name.to_string();
      runtime.spawn(async move {
         touchpad.apply(&name).await;
      });
   }

   /// Pushes every tunable to every device.
   pub async fn apply_all(&self) {
      if !self.exist() {
         return;
      }
      for key in [
         TOUCHPAD_ENABLED,
         LEFT_HANDED,
         NATURAL_SCROLL,
         EDGE_SCROLL,
         VERT_SCROLL,
         TAP_CLICK,
         MOTION_ACCELERATION,
         MOTION_THRESHOLD,
         MOTION_SCALING,
         PALM_DETECT,
         PALM_MIN_WIDTH,
         DELTA_SCROLL,
         DISABLE_WHILE_TYPING,
      ] {
         self.apply(key).await;
      }
   }

   /// Re-applies the tunable stored under `key`.
   pub async fn apply(&self, key: &str) {
      if !self.exist() {
         return;
      }
      if key == DISABLE_WHILE_TYPING || key == DISABLE_WHILE_TYPING_CMD {
         match self.settings.get_bool(DISABLE_WHILE_TYPING) {
            Ok(enabled) => self.disable_while_typing(enabled).await,
            Err(e) => warn!("Failed to read {DISABLE_WHILE_TYPING}: {e}"),
         }
         return;
      }

      let setting = match self.setting_for(key) {
         Ok(Some(setting)) => setting,
         Ok(None) => return,
         Err(e) => {
            warn!("Failed to read {key}: {e}");
            return;
         },
      };
      self.configure_all(&setting).await;
   }

   fn setting_for(&self, key: &str) -> Result<Option<TouchpadSetting>> {
      let s = &self.settings;
      let setting = match key {
         TOUCHPAD_ENABLED => TouchpadSetting::Enabled(s.get_bool(key)?),
         LEFT_HANDED => TouchpadSetting::LeftHanded(s.get_bool(key)?),
         NATURAL_SCROLL => TouchpadSetting::NaturalScroll(s.get_bool(key)?),
         EDGE_SCROLL => TouchpadSetting::EdgeScroll(s.get_bool(key)?),
         VERT_SCROLL | HORIZ_SCROLL => TouchpadSetting::TwoFingerScroll {
            vert: s.get_bool(VERT_SCROLL)?,
            horiz: s.get_bool(HORIZ_SCROLL)?,
         },
         TAP_CLICK => TouchpadSetting::TapClick(s.get_bool(key)?),
         MOTION_ACCELERATION => TouchpadSetting::MotionAcceleration(s.get_double(key)?),
         MOTION_THRESHOLD => TouchpadSetting::MotionThreshold(s.get_double(key)?),
         MOTION_SCALING => TouchpadSetting::MotionScaling(s.get_double(key)?),
         PALM_DETECT => TouchpadSetting::PalmDetect(s.get_bool(key)?),
         PALM_MIN_WIDTH | PALM_MIN_Z => TouchpadSetting::PalmDimensions {
            width: clamp_i32(s.get_int(PALM_MIN_WIDTH)?),
            z: clamp_i32(s.get_int(PALM_MIN_Z)?),
         },
         DELTA_SCROLL => TouchpadSetting::ScrollDistance(clamp_i32(s.get_int(key)?)),
         // Pointer-wide timings are read by the toolkit, not the driver.
         _ => return Ok(None),
      };
      Ok(Some(setting))
   }

   /// Returns how many devices accepted `setting`.
   async fn configure_all(&self, setting: &TouchpadSetting) -> usize {
      let devices = self.devices();
      let mut applied = 0;
      for device in &devices {
         match self.backend.configure(device, setting).await {
            Ok(()) => applied += 1,
            Err(DaemonError::FeatureNotSupported(what)) => debug!("unsupported: {what}"),
            Err(e) => warn!("Failed to apply {setting:?} to {}: {e}", device.name),
         }
      }
      applied
   }

   async fn disable_while_typing(&self, enabled: bool) {
      if self
         .configure_all(&TouchpadSetting::DisableWhileTyping(enabled))
         .await
         > 0
      {
         return;
      }
      if enabled {
         if let Err(e) = self.start_syndaemon().await {
            warn!("Failed to start syndaemon: {e}");
         }
      } else {
         self.stop_syndaemon().await;
      }
   }

   fn syndaemon_running(&self) -> bool {
      let Ok(pid) = std::fs::read_to_string(&self.pid_file) else {
         return false;
      };
      let Ok(pid) = pid.trim().parse::<u32>() else {
         return false;
      };
      std::fs::read(format!("/proc/{pid}/cmdline"))
         .is_ok_and(|cmdline| String::from_utf8_lossy(&cmdline).contains("syndaemon"))
   }

   async fn start_syndaemon(&self) -> Result<()> {
      if self.syndaemon_running() {
         debug!("syndaemon already running");
         return Ok(());
      }
      let cmd = self.settings.get_string(DISABLE_WHILE_TYPING_CMD)?;
      let mut args: Vec<&str> = cmd.split_whitespace().collect();
      if args.is_empty() {
         return Err(DaemonError::CommandFailed(
            "no disable-while-typing command configured".into(),
         ));
      }
      let program = args.remove(0);
      if !args.contains(&"-d") {
         args.push("-d");
      }
      let pid_file = self.pid_file.to_string_lossy();
      if !args.contains(&"-p") {
         args.push("-p");
         args.push(&pid_file);
      }

      if let Err(e) = self.runner.run(program, &args).await {
         let _ = std::fs::remove_file(&self.pid_file);
         return Err(e);
      }
      info!("Started {program} for disable-while-typing");
      Ok(())
   }

   async fn stop_syndaemon(&self) {
      if let Err(e) = self.runner.run("killall", &["syndaemon"]).await {
         debug!("killall syndaemon: {e}");
      }
      if let Err(e) = std::fs::remove_file(&self.pid_file)
         && e.kind() != std::io::ErrorKind::NotFound
      {
         warn!("Failed to remove {}: {e}", self.pid_file.display());
      }
   }
}

impl Drop for Touchpad {
   fn drop(&mut self) {
      if let Some(handle) = self.poll.get_mut().take() {
         handle.abort();
      }
   }
}

fn key_of(property: &str) -> Result<&'static str> {
   TUNABLES
      .iter()
      .find(|(name, _)| *name == property)
      .map(|(_, key)| *key)
      .ok_or_else(|| DaemonError::UnknownSetting(property.to_string()))
}

fn clamp_i32(v: i64) -> i32 {
   v.clamp(i32::MIN as i64, i32::MAX as i64) as i32
}
