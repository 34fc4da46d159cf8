//! systemd-logind access.
//!
//! The watcher only sees logind through [`LoginManager`] and [`LoginSession`];
//! [`ZbusLogin`] backs them with generated `zbus` proxies.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use smol_str::SmolStr;
use zbus::{Connection, proxy, zvariant::OwnedObjectPath};

use crate::error::Result;

#[proxy(
   interface = "org.freedesktop.login1.Manager",
   default_service = "org.freedesktop.login1",
   default_path = "/org/freedesktop/login1"
)]
trait Login1Manager {
   /// Returns (id, uid, user, seat, path) per session.
   fn list_sessions(&self) -> zbus::Result<Vec<(String, u32, String, String, OwnedObjectPath)>>;

   #[zbus(signal)]
   fn session_new(&self, id: String, path: OwnedObjectPath) -> zbus::Result<()>;

   #[zbus(signal)]
   fn session_removed(&self, id: String, path: OwnedObjectPath) -> zbus::Result<()>;
}

#[proxy(
   interface = "org.freedesktop.login1.Session",
   default_service = "org.freedesktop.login1"
)]
trait Login1Session {
   #[zbus(property(emits_changed_signal = "const"))]
   fn user(&self) -> zbus::Result<(u32, OwnedObjectPath)>;

   #[zbus(property(emits_changed_signal = "const"))]
   fn remote(&self) -> zbus::Result<bool>;

   #[zbus(property)]
   fn active(&self) -> zbus::Result<bool>;

   #[zbus(property, name = "Type")]
   fn type_(&self) -> zbus::Result<String>;
}

pub type SessionHandle = Arc<dyn LoginSession>;

/// Session membership changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginSignal {
   SessionNew { id: SmolStr, path: SmolStr },
   SessionRemoved { id: SmolStr, path: SmolStr },
}

#[async_trait]
pub trait LoginManager: Send + Sync {
   /// (id, path) of every session.
   async fn list_sessions(&self) -> Result<Vec<(SmolStr, SmolStr)>>;
   async fn session(&self, path: &str) -> Result<SessionHandle>;
   async fn events(&self) -> Result<BoxStream<'static, LoginSignal>>;
}

#[async_trait]
pub trait LoginSession: Send + Sync {
   fn path(&self) -> &str;
   async fn uid(&self) -> Result<u32>;
   async fn is_remote(&self) -> Result<bool>;
   async fn is_active(&self) -> Result<bool>;
   async fn session_type(&self) -> Result<String>;
   /// Yields every change of the `Active` property.
   async fn active_changes(&self) -> Result<BoxStream<'static, bool>>;
}

pub struct ZbusLogin {
   conn: Connection,
   manager: Login1ManagerProxy<'static>,
}

impl ZbusLogin {
   pub async fn new(conn: Connection) -> Result<Self> {
      let manager = Login1ManagerProxy::new(&conn).await?;
      Ok(Self { conn, manager })
   }
}

#[async_trait]
impl LoginManager for ZbusLogin {
   async fn list_sessions(&self) -> Result<Vec<(SmolStr, SmolStr)>> {
      Ok(self
         .manager
         .list_sessions()
         .await?
         .into_iter()
         .map(|(id, _, _, _, path)| (id.into(), path.as_str().into()))
         .collect())
   }

   async fn session(&self, path: &str) -> Result<SessionHandle> {
      let proxy = Login1SessionProxy::builder(&self.conn)
         .path(path.to_string())?
         .build()
         .await?;
      Ok(Arc::new(ZbusSession {
         path: path.into(),
         proxy,
      }))
   }

   async fn events(&self) -> Result<BoxStream<'static, LoginSignal>> {
      let added = self.manager.receive_session_new().await?.filter_map(|sig| async move {
         let args = sig.args().ok()?;
         Some(LoginSignal::SessionNew {
            id: args.id().as_str().into(),
            path: args.path().as_str().into(),
         })
      });
      let removed = self
         .manager
         .receive_session_removed()
         .await?
         .filter_map(|sig| async move {
            let args = sig.args().ok()?;
            Some(LoginSignal::SessionRemoved {
               id: args.id().as_str().into(),
               path: args.path().as_str().into(),
            })
         });
      Ok(futures::stream::select(added, removed).boxed())
   }
}

struct ZbusSession {
   path: SmolStr,
   proxy: Login1SessionProxy<'static>,
}

#[async_trait]
impl LoginSession for ZbusSession {
   fn path(&self) -> &str {
      &self.path
   }

   async fn uid(&self) -> Result<u32> {
      Ok(self.proxy.user().await?.0)
   }

   async fn is_remote(&self) -> Result<bool> {
      Ok(self.proxy.remote().await?)
   }

   async fn is_active(&self) -> Result<bool> {
      Ok(self.proxy.active().await?)
   }

   async fn session_type(&self) -> Result<String> {
      Ok(self.proxy.type_().await?)
   }

   async fn active_changes(&self) -> Result<BoxStream<'static, bool>> {
      let changes = self.proxy.receive_active_changed().await;
      Ok(changes
         .filter_map(|change| async move { change.get().await.ok() })
         .boxed())
   }
}
