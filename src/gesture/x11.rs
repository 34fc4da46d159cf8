//! X11 side of gesture dispatch: keyboard-grab probing, the active window's
//! command line, and EWMH requests for the built-ins.

use std::{fmt::Display, fs, sync::Arc};

use async_trait::async_trait;
use log::debug;
use parking_lot::Mutex;
use x11rb::{
   CURRENT_TIME,
   connection::Connection,
   protocol::xproto::{
      AtomEnum, ClientMessageEvent, ConnectionExt as _, EventMask, GrabMode, GrabStatus, Window,
   },
   rust_connection::RustConnection,
};

use crate::{
   error::{DaemonError, Result},
   gesture::{builtin::WindowManager, manager::DesktopProbe},
   process::CommandRunner,
};

/// `_NET_WM_STATE` toggle action.
const NET_WM_STATE_TOGGLE: u32 = 2;
/// ICCCM `IconicState`.
const ICONIC_STATE: u32 = 3;

fn x11_error(e: impl Display) -> DaemonError {
   DaemonError::X11(e.to_string())
}

struct XDisplay {
   conn: RustConnection,
   root: Window,
}

impl XDisplay {
   fn connect() -> Result<Self> {
      let (conn, screen) = x11rb::connect(None).map_err(x11_error)?;
      let root = conn
         .setup()
         .roots
         .get(screen)
         .map(|s| s.root)
         .ok_or_else(|| DaemonError::X11(format!("no screen {screen}")))?;
      Ok(Self { conn, root })
   }

   fn atom(&self, name: &str) -> Result<u32> {
      Ok(self
         .conn
         .intern_atom(false, name.as_bytes())
         .map_err(x11_error)?
         .reply()
         .map_err(x11_error)?
         .atom)
   }

   fn cardinal(&self, window: Window, property: &str, kind: AtomEnum) -> Result<Option<u32>> {
      let atom = self.atom(property)?;
      let reply = self
         .conn
         .get_property(false, window, atom, kind, 0, 1)
         .map_err(x11_error)?
         .reply()
         .map_err(x11_error)?;
      Ok(reply.value32().and_then(|mut v| v.next()))
   }

   fn active_window(&self) -> Result<Option<Window>> {
      Ok(self
         .cardinal(self.root, "_NET_ACTIVE_WINDOW", AtomEnum::WINDOW)?
         .filter(|w| *w != 0))
   }

   fn send_to_root(&self, window: Window, message: &str, data: [u32; 5]) -> Result<()> {
      let event = ClientMessageEvent::new(32, window, self.atom(message)?, data);
      self
         .conn
         .send_event(
            false,
            self.root,
            EventMask::SUBSTRUCTURE_REDIRECT | EventMask::SUBSTRUCTURE_NOTIFY,
            event,
         )
         .map_err(x11_error)?;
      self.conn.flush().map_err(x11_error)?;
      Ok(())
   }

   fn keyboard_grabbed(&self) -> Result<bool> {
      let status = self
         .conn
         .grab_keyboard(false, self.root, CURRENT_TIME, GrabMode::ASYNC, GrabMode::ASYNC)
         .map_err(x11_error)?
         .reply()
         .map_err(x11_error)?
         .status;
      if status == GrabStatus::SUCCESS {
         self.conn.ungrab_keyboard(CURRENT_TIME).map_err(x11_error)?;
         self.conn.flush().map_err(x11_error)?;
      }
      Ok(status == GrabStatus::ALREADY_GRABBED)
   }
}

/// X11 desktop shared by the gesture probe and the built-in actions.
/// Connects lazily and reconnects after a failure.
pub struct X11Desktop {
   display: Mutex<Option<XDisplay>>,
   runner: Arc<dyn CommandRunner>,
}

impl X11Desktop {
   pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
      Self {
         display: Mutex::new(None),
         runner,
      }
   }

   fn with_display<R>(&self, f: impl FnOnce(&XDisplay) -> Result<R>) -> Result<R> {
      let mut guard = self.display.lock();
      if guard.is_none() {
         *guard = Some(XDisplay::connect()?);
      }
      let result = match guard.as_ref() {
         Some(display) => f(display),
         None => Err(DaemonError::X11("not connected".into())),
      };
      if result.is_err() {
         *guard = None;
      }
      result
   }
}

impl DesktopProbe for X11Desktop {
   fn keyboard_grabbed(&self) -> bool {
      self
         .with_display(XDisplay::keyboard_grabbed)
         .inspect_err(|e| debug!("keyboard grab probe: {e}"))
         .unwrap_or(false)
   }

   fn active_window_command(&self) -> Option<String> {
      let pid = self
         .with_display(|d| match d.active_window()? {
            Some(window) => d.cardinal(window, "_NET_WM_PID", AtomEnum::CARDINAL),
            None => Ok(None),
         })
         .inspect_err(|e| debug!("active window: {e}"))
         .ok()
         .flatten()?;
      let raw = fs::read(format!("/proc/{pid}/cmdline")).ok()?;
      let cmdline = String::from_utf8_lossy(&raw)
         .split('\0')
         .filter(|s| !s.is_empty())
         .collect::<Vec<_>>()
         .join(" ");
      Some(cmdline)
   }
}

#[async_trait]
impl WindowManager for X11Desktop {
   async fn toggle_maximize(&self) -> Result<()> {
      self.with_display(|d| {
         let Some(window) = d.active_window()? else {
            return Ok(());
         };
         let vert = d.atom("_NET_WM_STATE_MAXIMIZED_VERT")?;
         let horz = d.atom("_NET_WM_STATE_MAXIMIZED_HORZ")?;
         d.send_to_root(window, "_NET_WM_STATE", [NET_WM_STATE_TOGGLE, vert, horz, 1, 0])
      })
   }

   async fn minimize(&self) -> Result<()> {
      self.with_display(|d| {
         let Some(window) = d.active_window()? else {
            return Ok(());
         };
         d.send_to_root(window, "WM_CHANGE_STATE", [ICONIC_STATE, 0, 0, 0, 0])
      })
   }

   async fn switch_workspace(&self, forward: bool) -> Result<()> {
      self.with_display(|d| {
         let count = d
            .cardinal(d.root, "_NET_NUMBER_OF_DESKTOPS", AtomEnum::CARDINAL)?
            .unwrap_or(1)
            .max(1);
         let current = d
            .cardinal(d.root, "_NET_CURRENT_DESKTOP", AtomEnum::CARDINAL)?
            .unwrap_or(0);
         let next = next_workspace(current, count, forward);
         d.send_to_root(d.root, "_NET_CURRENT_DESKTOP", [next, CURRENT_TIME, 0, 0, 0])
      })
   }

   async fn key(&self, keys: &str) -> Result<()> {
      self.runner.run("xdotool", &["key", keys]).await.map(|_| ())
   }
}

fn next_workspace(current: u32, count: u32, forward: bool) -> u32 {
   if forward {
      (current + 1) % count
   } else {
      (current + count - 1) % count
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::process::testing::RecordingRunner;

   #[test]
   fn test_workspace_switch_wraps() {
      assert_eq!(next_workspace(3, 4, true), 0);
      assert_eq!(next_workspace(0, 4, false), 3);
      assert_eq!(next_workspace(1, 4, false), 0);
      assert_eq!(next_workspace(0, 1, true), 0);
   }

   #[tokio::test]
   async fn test_key_goes_through_xdotool() {
      let runner = RecordingRunner::new();
      let desktop = X11Desktop::new(runner.clone());
      desktop.key("super+s").await.unwrap();
      assert_eq!(runner.calls(), vec!["xdotool key super+s"]);
   }
}
