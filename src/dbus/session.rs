use zbus::{interface, object_server::SignalEmitter, zvariant::OwnedObjectPath};

use crate::{dbus::object_path, session::watcher::SessionWatcher};

pub struct SessionWatcherService {
   watcher: SessionWatcher,
}

impl SessionWatcherService {
   pub const fn new(watcher: SessionWatcher) -> Self {
      Self { watcher }
   }

   pub async fn notify_property(
      &self,
      name: &str,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match name {
         "IsActive" => self.is_active_changed(emitter).await,
         _ => Ok(()),
      }
   }
}

#[interface(name = "org.desktopd.SessionWatcher")]
impl SessionWatcherService {
   async fn get_sessions(&self) -> zbus::fdo::Result<Vec<OwnedObjectPath>> {
      let paths = self
         .watcher
         .get_sessions()
         .iter()
         .map(|path| object_path(path))
         .collect::<crate::error::Result<Vec<_>>>()?;
      Ok(paths)
   }

   #[zbus(name = "IsX11SessionActive")]
   async fn is_x11_session_active(&self) -> bool {
      self.watcher.is_x11_session_active()
   }

   #[zbus(property)]
   async fn is_active(&self) -> bool {
      self.watcher.is_active()
   }
}
