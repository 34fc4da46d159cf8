//! Screen geometry for touchscreen edge swipes.
//!
//! The display daemon knows the screen size and which output the touchscreen
//! is mapped to; the dock reports where it sits and how large it is.

use std::collections::HashMap;

use async_trait::async_trait;
use zbus::{Connection, proxy, proxy::CacheProperties, zvariant::OwnedObjectPath};

use crate::error::{DaemonError, Result};

/// Dock positions as reported by the dock's `Position` property.
const DOCK_TOP: i32 = 0;
const DOCK_RIGHT: i32 = 1;
const DOCK_BOTTOM: i32 = 2;
const DOCK_LEFT: i32 = 3;

#[proxy(
   interface = "org.desktopd.Display",
   default_service = "org.desktopd.Display",
   default_path = "/org/desktopd/Display"
)]
trait Display {
   #[zbus(property)]
   fn screen_width(&self) -> zbus::Result<u16>;

   #[zbus(property)]
   fn screen_height(&self) -> zbus::Result<u16>;

   #[zbus(property)]
   fn monitors(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

   /// Touchscreen serial to output name.
   #[zbus(property)]
   fn touch_map(&self) -> zbus::Result<HashMap<String, String>>;

   /// (id, name, device node, serial)
   #[zbus(property)]
   fn touchscreens(&self) -> zbus::Result<Vec<(i32, String, String, String)>>;
}

#[proxy(interface = "org.desktopd.Display.Monitor", default_service = "org.desktopd.Display")]
trait Monitor {
   #[zbus(property)]
   fn name(&self) -> zbus::Result<String>;

   #[zbus(property)]
   fn rotation(&self) -> zbus::Result<u16>;
}

#[proxy(
   interface = "org.desktopd.Dock",
   default_service = "org.desktopd.Dock",
   default_path = "/org/desktopd/Dock"
)]
trait Dock {
   #[zbus(property)]
   fn position(&self) -> zbus::Result<i32>;

   /// (x, y, width, height)
   #[zbus(property)]
   fn frontend_window_rect(&self) -> zbus::Result<(i32, i32, u32, u32)>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
   pub width: u32,
   pub height: u32,
}

/// RandR rotation of an output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
   Normal,
   Left,
   Inverted,
   Right,
}

impl Rotation {
   /// Decodes a single RandR rotation bit.
   pub fn from_randr(bits: u16) -> Option<Self> {
      match bits {
         1 => Some(Self::Normal),
         2 => Some(Self::Left),
         4 => Some(Self::Inverted),
         8 => Some(Self::Right),
         _ => None,
      }
   }
}

#[async_trait]
pub trait ScreenLayout: Send + Sync {
   async fn screen_size(&self) -> Result<ScreenSize>;
   /// Depth of the dock measured away from its screen edge, `None` when the
   /// dock is hidden.
   async fn dock_depth(&self) -> Result<Option<u32>>;
   /// Rotation of the output the first touchscreen is mapped to.
   async fn touchscreen_rotation(&self) -> Result<Option<Rotation>>;
}

/// Production layout backed by the display and dock services.
pub struct ZbusScreenLayout {
   conn: Connection,
}

impl ZbusScreenLayout {
   pub fn new(conn: Connection) -> Self {
      Self { conn }
   }

   async fn display(&self) -> Result<DisplayProxy<'static>> {
      Ok(DisplayProxy::builder(&self.conn)
         .cache_properties(CacheProperties::No)
         .build()
         .await?)
   }
}

#[async_trait]
impl ScreenLayout for ZbusScreenLayout {
   async fn screen_size(&self) -> Result<ScreenSize> {
      let display = self.display().await?;
      Ok(ScreenSize {
         width: display.screen_width().await?.into(),
         height: display.screen_height().await?.into(),
      })
   }

   async fn dock_depth(&self) -> Result<Option<u32>> {
      let dock = DockProxy::builder(&self.conn)
         .cache_properties(CacheProperties::No)
         .build()
         .await?;
      let position = dock.position().await?;
      if position < 0 {
         return Ok(None);
      }
      let (_, _, width, height) = dock.frontend_window_rect().await?;
      Ok(Some(match position {
         DOCK_TOP | DOCK_BOTTOM => height,
         DOCK_RIGHT | DOCK_LEFT => width,
         _ => 0,
      }))
   }

   async fn touchscreen_rotation(&self) -> Result<Option<Rotation>> {
      let display = self.display().await?;
      let serial = display
         .touchscreens()
         .await?
         .into_iter()
         .next()
         .map(|(_, _, _, serial)| serial)
         .ok_or(DaemonError::NoTouchscreen)?;
      let output = display
         .touch_map()
         .await?
         .remove(&serial)
         .ok_or(DaemonError::NoTouchscreen)?;

      for path in display.monitors().await? {
         let monitor = MonitorProxy::builder(&self.conn)
            .path(path.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
         if monitor.name().await? == output {
            return Ok(Rotation::from_randr(monitor.rotation().await?));
         }
      }
      Ok(None)
   }
}
