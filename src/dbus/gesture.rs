use std::sync::Arc;

use log::warn;
use zbus::{interface, object_server::SignalEmitter};

use crate::{
   gesture::manager::{
      EDGE_MOVE_STOP_DURATION, GestureManager, LONG_PRESS_DURATION, SHORT_PRESS_DURATION,
   },
   settings::ChangeOrigin,
};

pub struct GestureService {
   manager: Arc<GestureManager>,
}

impl GestureService {
   pub const fn new(manager: Arc<GestureManager>) -> Self {
      Self { manager }
   }

   pub async fn notify_property(
      &self,
      name: &str,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match name {
         "Enabled" => self.enabled_changed(emitter).await,
         "Infos" => self.infos_changed(emitter).await,
         _ => Ok(()),
      }
   }
}

#[interface(name = "org.desktopd.Gesture")]
impl GestureService {
   async fn set_long_press_duration(&self, duration: u32) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_duration(LONG_PRESS_DURATION, duration)
         .await?)
   }

   async fn get_long_press_duration(&self) -> zbus::fdo::Result<u32> {
      Ok(self.manager.duration(LONG_PRESS_DURATION)?)
   }

   async fn set_short_press_duration(&self, duration: u32) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_duration(SHORT_PRESS_DURATION, duration)
         .await?)
   }

   async fn get_short_press_duration(&self) -> zbus::fdo::Result<u32> {
      Ok(self.manager.duration(SHORT_PRESS_DURATION)?)
   }

   async fn set_edge_move_stop_duration(&self, duration: u32) -> zbus::fdo::Result<()> {
      Ok(self
         .manager
         .set_duration(EDGE_MOVE_STOP_DURATION, duration)
         .await?)
   }

   async fn get_edge_move_stop_duration(&self) -> zbus::fdo::Result<u32> {
      Ok(self.manager.duration(EDGE_MOVE_STOP_DURATION)?)
   }

   /// Dispatch failures stay local.
   async fn exec(&self, name: String, direction: String, fingers: i32) {
      if let Err(e) = self.manager.exec(&name, &direction, fingers).await {
         warn!("Exec {name} {direction} {fingers}: {e}");
      }
   }

   async fn set_infos(&self, infos: String) -> zbus::fdo::Result<()> {
      Ok(self.manager.set_infos(&infos)?)
   }

   #[zbus(property)]
   async fn infos(&self) -> zbus::fdo::Result<String> {
      Ok(self.manager.infos_json()?)
   }

   #[zbus(property)]
   async fn enabled(&self) -> bool {
      self.manager.is_enabled()
   }

   #[zbus(property)]
   async fn set_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
      self.manager.set_enabled(enabled, ChangeOrigin::Bus)?;
      Ok(())
   }
}
