//! Gesture dispatch.
//!
//! Looks up the action configured for a recognised gesture and runs it, as
//! long as gestures are enabled, the user's session is in the foreground and
//! nobody else holds the keyboard. Touchscreen edge swipes get fixed actions
//! that follow the screen's rotation.

use std::{
   path::PathBuf,
   str::FromStr,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, Ordering},
   },
};

use futures::StreamExt;
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use tokio::task::JoinHandle;

use crate::{
   config::GestureConfig,
   error::{DaemonError, Result},
   event::{BusObject, Event, EventSender},
   gesture::{
      builtin::{Builtin, WindowManager},
      daemon::{EdgeSwipe, GestureDaemon, RecognizerSignal},
      info::{ActionKind, GestureInfos},
      screen::{Rotation, ScreenLayout, ScreenSize},
   },
   process::CommandRunner,
   session::SessionGate,
   settings::{ChangeOrigin, DefaultValue, Key, SettingValue, SettingsStore, key},
};

pub const ENABLED: &str = "gesture.enabled";
pub const LONG_PRESS_DURATION: &str = "touchscreen.longpress-duration";
pub const SHORT_PRESS_DURATION: &str = "touchscreen.shortpress-duration";
pub const EDGE_MOVE_STOP_DURATION: &str = "touchscreen.edgemovestop-duration";
pub const LONG_PRESS_BLACKLIST: &str = "touchscreen.longpress-blacklist";

pub const SCHEMA: &[Key] = &[
   key(ENABLED, DefaultValue::Bool(true)),
   key(LONG_PRESS_DURATION, DefaultValue::Int(500)),
   key(SHORT_PRESS_DURATION, DefaultValue::Int(200)),
   key(EDGE_MOVE_STOP_DURATION, DefaultValue::Int(500)),
   key(LONG_PRESS_BLACKLIST, DefaultValue::Strv(&["google-chrome"])),
];

/// Shortest edge swipe, in pixels, that triggers an action.
const EDGE_SWIPE_MIN_DISTANCE: f64 = 100.0;
const SHOW_CLIPBOARD: &str = "xdotool key ctrl+alt+v";
const TOGGLE_NOTIFICATIONS: &str = "dbus-send --type=method_call --dest=org.desktopd.Osd \
   /org/desktopd/Notifications org.desktopd.Notification.Toggle";

/// Desktop state consulted before running an action.
pub trait DesktopProbe: Send + Sync {
   /// Whether another client holds an exclusive keyboard grab.
   fn keyboard_grabbed(&self) -> bool;
   /// Command line of the process owning the focused window.
   fn active_window_command(&self) -> Option<String>;
}

/// What the gesture manager acts through.
pub struct GestureBackends {
   pub session: Arc<dyn SessionGate>,
   pub probe: Arc<dyn DesktopProbe>,
   pub wm: Arc<dyn WindowManager>,
   pub runner: Arc<dyn CommandRunner>,
   pub screen: Arc<dyn ScreenLayout>,
   pub daemon: Option<Arc<dyn GestureDaemon>>,
}

pub struct GestureManager {
   infos: RwLock<GestureInfos>,
   user_file: PathBuf,
   enabled: AtomicBool,
   settings: Arc<SettingsStore>,
   backends: GestureBackends,
   bus: EventSender,
   monitor: Mutex<Option<JoinHandle<()>>>,
}

impl GestureManager {
   /// Loads the user table, falling back to the system one.
   pub fn load(
      config: &GestureConfig,
      settings: Arc<SettingsStore>,
      backends: GestureBackends,
      bus: EventSender,
   ) -> Result<Arc<Self>> {
      let user_file = config.user_file()?;
      let source = if user_file.exists() {
         &user_file
      } else {
         &config.system_file
      };
      info!("Loading gestures from {}", source.display());
      let infos = GestureInfos::load(source)?;
      Ok(Self::new(infos, user_file, settings, backends, bus))
   }

   pub fn new(
      infos: GestureInfos,
      user_file: PathBuf,
      settings: Arc<SettingsStore>,
      backends: GestureBackends,
      bus: EventSender,
   ) -> Arc<Self> {
      let enabled = settings.get_bool(ENABLED).unwrap_or(true);
      let manager = Arc::new(Self {
         infos: RwLock::new(infos.with_touch_right_button()),
         user_file,
         enabled: AtomicBool::new(enabled),
         settings,
         backends,
         bus,
         monitor: Mutex::new(None),
      });

      let weak = Arc::downgrade(&manager);
      manager.settings.connect_changed(ENABLED, move |_, origin| {
         let Some(manager) = weak.upgrade() else {
            return;
         };
         let enabled = manager.settings.get_bool(ENABLED).unwrap_or(true);
         manager.enabled.store(enabled, Ordering::SeqCst);
         debug!("gestures enabled: {enabled}");
         if origin == ChangeOrigin::Local {
            manager
               .bus
               .emit(Event::PropertyChanged(BusObject::Gesture, "Enabled"));
         }
      });
      manager
   }

   /// Pushes the stored press timings to the recogniser and starts executing
   /// its gestures.
   pub async fn start(self: &Arc<Self>) {
      let Some(daemon) = self.backends.daemon.clone() else {
         return;
      };
      for key in [LONG_PRESS_DURATION, SHORT_PRESS_DURATION, EDGE_MOVE_STOP_DURATION] {
         let result = match self.duration(key) {
            Ok(duration) => self.push_duration(key, duration).await,
            Err(e) => Err(e),
         };
         if let Err(e) = result {
            warn!("Failed to push {key}: {e}");
         }
      }

      let mut events = match daemon.events().await {
         Ok(events) => events,
         Err(e) => {
            warn!("Failed to subscribe to gesture events: {e}");
            return;
         },
      };
      let weak: Weak<Self> = Arc::downgrade(self);
      let handle = tokio::spawn(async move {
         while let Some(signal) = events.next().await {
            let Some(manager) = weak.upgrade() else {
               break;
            };
            let result = match signal {
               RecognizerSignal::Gesture(event) => {
                  manager
                     .exec(&event.name, &event.direction, event.fingers)
                     .await
               },
               RecognizerSignal::EdgeMoveStopLeave { swipe, duration } => {
                  debug!("{} edge released after {duration}ms", swipe.edge);
                  manager.edge_move_stop_leave(&swipe).await
               },
               RecognizerSignal::Edge(swipe) => manager.edge_swipe(&swipe).await,
            };
            if let Err(e) = result {
               warn!("Exec failed: {e}");
            }
         }
      });
      if let Some(old) = self.monitor.lock().replace(handle) {
         old.abort();
      }
   }

   pub fn shutdown(&self) {
      if let Some(handle) = self.monitor.lock().take() {
         handle.abort();
      }
   }

   pub fn is_enabled(&self) -> bool {
      self.enabled.load(Ordering::SeqCst)
   }

   pub fn set_enabled(&self, enabled: bool, origin: ChangeOrigin) -> Result<bool> {
      self
         .settings
         .set_from(ENABLED, SettingValue::Bool(enabled), origin)
   }

   pub fn infos_json(&self) -> Result<String> {
      self.infos.read().to_json()
   }

   /// Replaces the table and writes it back to the user file.
   pub fn set_infos(&self, json: &str) -> Result<()> {
      let infos = GestureInfos::from_json(json)?.with_touch_right_button();
      infos.save(&self.user_file)?;
      *self.infos.write() = infos;
      self
         .bus
         .emit(Event::PropertyChanged(BusObject::Gesture, "Infos"));
      Ok(())
   }

   fn accepts_input(&self) -> bool {
      if self.is_enabled() && self.backends.session.is_active() {
         return true;
      }
      debug!("Gesture had been disabled or session inactive");
      false
   }

   /// Runs the action bound to (`name`, `direction`, `fingers`).
   pub async fn exec(&self, name: &str, direction: &str, fingers: i32) -> Result<()> {
      if !self.accepts_input() {
         return Ok(());
      }

      let info = self
         .infos
         .read()
         .get(name, direction, fingers)
         .cloned()
         .ok_or_else(|| DaemonError::GestureNotFound {
            name: name.to_string(),
            direction: direction.to_string(),
            fingers,
         })?;
      debug!(
         "[Exec] action info: {} {} {} {} {}",
         info.name, info.direction, info.fingers, info.action.kind, info.action.action
      );

      // The button has to be released even while something holds the keyboard.
      let releases_button = info.is_touch_right_button() && info.direction == "up";
      if !releases_button && self.backends.probe.keyboard_grabbed() {
         return Err(DaemonError::KeyboardGrabbed);
      }

      if info.is_touch_right_button() {
         if self.active_window_blacklisted() {
            debug!("The current active window in blacklist");
            return Ok(());
         }
      } else if info.name.starts_with("touch") {
         return Ok(());
      }

      let kind = ActionKind::from_str(&info.action.kind)
         .map_err(|_| DaemonError::InvalidActionKind(info.action.kind.clone()))?;
      match kind {
         ActionKind::Commandline => {
            self.backends.runner.run_shell(&info.action.action).await?;
         },
         ActionKind::Shortcut => {
            let cmd = format!("xdotool key {}", info.action.action);
            self.backends.runner.run_shell(&cmd).await?;
         },
         ActionKind::Builtin => {
            Builtin::parse(&info.action.action)?
               .run(self.backends.wm.as_ref())
               .await?;
         },
      }
      Ok(())
   }

   /// Shows the workspace overview when a swipe up from the bottom edge is
   /// released above the dock.
   pub async fn edge_move_stop_leave(&self, swipe: &EdgeSwipe) -> Result<()> {
      if !self.accepts_input() || swipe.edge != "bot" {
         return Ok(());
      }
      let Some(depth) = self.backends.screen.dock_depth().await? else {
         return Ok(());
      };
      let size = self.backends.screen.screen_size().await?;
      if size.height > 0 && f64::from(depth) / f64::from(size.height) + swipe.scale_y < 1.0 {
         Builtin::ShowWorkspace.run(self.backends.wm.as_ref()).await?;
      }
      Ok(())
   }

   /// Opens the clipboard or toggles the notification centre for a long
   /// enough swipe in from a screen edge.
   pub async fn edge_swipe(&self, swipe: &EdgeSwipe) -> Result<()> {
      if !self.accepts_input() {
         return Ok(());
      }
      let Some(rotation) = self.backends.screen.touchscreen_rotation().await? else {
         return Ok(());
      };
      let size = self.backends.screen.screen_size().await?;
      if let Some(cmd) = edge_command(rotation, swipe, size) {
         self.backends.runner.run_shell(cmd).await?;
      }
      Ok(())
   }

   fn active_window_blacklisted(&self) -> bool {
      let Some(cmd) = self.backends.probe.active_window_command() else {
         return false;
      };
      let blacklist = self
         .settings
         .get_strv(LONG_PRESS_BLACKLIST)
         .unwrap_or_default();
      blacklist
         .iter()
         .any(|entry| !entry.is_empty() && cmd.contains(entry.as_str()))
   }

   pub fn duration(&self, key: &str) -> Result<u32> {
      let value = self.settings.get_int(key)?;
      Ok(u32::try_from(value.max(0)).unwrap_or(u32::MAX))
   }

   /// Stores a press timing and forwards it to the recogniser.
   pub async fn set_duration(&self, key: &str, duration: u32) -> Result<()> {
      self
         .settings
         .set(key, SettingValue::Int(i64::from(duration)))?;
      self.push_duration(key, duration).await
   }

   async fn push_duration(&self, key: &str, duration: u32) -> Result<()> {
      let Some(daemon) = &self.backends.daemon else {
         return Ok(());
      };
      match key {
         LONG_PRESS_DURATION => daemon.set_long_press_duration(duration).await,
         SHORT_PRESS_DURATION => daemon.set_short_press_duration(duration).await,
         EDGE_MOVE_STOP_DURATION => daemon.set_edge_move_stop_duration(duration).await,
         other => Err(DaemonError::UnknownSetting(other.to_string())),
      }
   }
}

/// Picks the action for an edge swipe on a screen with the given rotation.
/// The clipboard sits on the physical left edge and notifications on the
/// physical right one, wherever those end up after rotation.
fn edge_command(rotation: Rotation, swipe: &EdgeSwipe, size: ScreenSize) -> Option<&'static str> {
   let width = f64::from(size.width);
   let height = f64::from(size.height);
   let (distance, towards_clipboard) = match (rotation, swipe.edge.as_str()) {
      (Rotation::Normal, "left") => (swipe.scale_x * width, true),
      (Rotation::Normal, "right") => ((1.0 - swipe.scale_x) * width, false),
      (Rotation::Left, "bot") => (swipe.scale_y * height, true),
      (Rotation::Left, "top") => ((1.0 - swipe.scale_y) * height, false),
      (Rotation::Inverted, "left") => (swipe.scale_x * width, false),
      (Rotation::Inverted, "right") => ((1.0 - swipe.scale_x) * width, true),
      (Rotation::Right, "bot") => (swipe.scale_y * height, false),
      (Rotation::Right, "top") => ((1.0 - swipe.scale_y) * height, true),
      _ => return None,
   };
   if distance <= EDGE_SWIPE_MIN_DISTANCE {
      return None;
   }
   Some(if towards_clipboard {
      SHOW_CLIPBOARD
   } else {
      TOGGLE_NOTIFICATIONS
   })
}

impl Drop for GestureManager {
   fn drop(&mut self) {
      self.shutdown();
   }
}
