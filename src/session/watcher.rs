//! Active-session arbitration.
//!
//! Tracks the local sessions of the current user and publishes whether one of
//! them is in the foreground as `IsActive`. Audio is suspended while the user
//! is switched away and resumed, together with a brightness refresh, when
//! they come back.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::{StreamExt, stream::BoxStream};
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::{sync::mpsc, task::JoinHandle};
use zbus::{Connection, proxy};

use crate::{
   error::{DaemonError, Result},
   event::{BusObject, EventSender},
   process::CommandRunner,
   property::{BusSink, PropertyStore},
   registry::Registry,
   session::{
      SessionGate,
      login1::{LoginManager, LoginSession, LoginSignal, SessionHandle},
   },
};

const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Session types that run a graphical server.
const GRAPHICAL_SESSION_TYPES: [&str; 2] = ["x11", "wayland"];

#[proxy(
   interface = "org.desktopd.Display",
   default_service = "org.desktopd.Display",
   default_path = "/org/desktopd/Display"
)]
trait Display {
   fn refresh_brightness(&self) -> zbus::Result<()>;
}

/// Side effects of a foreground transition.
#[async_trait]
pub trait SessionEffects: Send + Sync {
   /// Suspends (or resumes) every audio sink and source.
   async fn suspend_audio(&self, suspend: bool);
   async fn refresh_brightness(&self);
}

/// Production effects: `pactl` for audio, the display daemon for brightness.
pub struct DesktopEffects {
   runner: Arc<dyn CommandRunner>,
   session_bus: Option<Connection>,
}

impl DesktopEffects {
   pub fn new(runner: Arc<dyn CommandRunner>, session_bus: Option<Connection>) -> Self {
      Self {
         runner,
         session_bus,
      }
   }

   async fn suspend_all(&self, kind: &str, suspend: bool) {
      let listing = match self.runner.run("pactl", &["list", "short", &format!("{kind}s")]).await {
         Ok(listing) => listing,
         Err(e) => {
            warn!("Failed to list audio {kind}s: {e}");
            return;
         },
      };
      let flag = if suspend { "1" } else { "0" };
      let command = format!("suspend-{kind}");
      for name in listing.lines().filter_map(|line| line.split('\t').nth(1)) {
         if let Err(e) = self.runner.run("pactl", &[&command, name, flag]).await {
            warn!("Failed to {command} {name}: {e}");
         }
      }
   }
}

#[async_trait]
impl SessionEffects for DesktopEffects {
   async fn suspend_audio(&self, suspend: bool) {
      debug!("suspend audio: {suspend}");
      self.suspend_all("sink", suspend).await;
      self.suspend_all("source", suspend).await;
   }

   async fn refresh_brightness(&self) {
      let Some(conn) = &self.session_bus else {
         return;
      };
      let result = match DisplayProxy::new(conn).await {
         Ok(display) => display.refresh_brightness().await,
         Err(e) => Err(e),
      };
      if let Err(e) = result {
         warn!("Failed to refresh brightness: {e}");
      }
   }
}

#[derive(Debug)]
struct WatcherProps {
   is_active: bool,
}

#[derive(Debug)]
enum WatcherSignal {
   Login(LoginSignal),
   ActiveChanged,
}

struct TrackedSession {
   proxy: SessionHandle,
   monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for TrackedSession {
   fn drop(&mut self) {
      if let Some(handle) = self.monitor.lock().take() {
         handle.abort();
      }
   }
}

/// Session watcher. Cheap to clone.
#[derive(Clone)]
pub struct SessionWatcher {
   inner: Arc<Inner>,
}

struct Inner {
   login: Arc<dyn LoginManager>,
   effects: Arc<dyn SessionEffects>,
   uid: u32,
   sessions: Registry<SmolStr, Arc<TrackedSession>>,
   active: Mutex<Option<(SmolStr, String)>>,
   props: PropertyStore<WatcherProps>,
   signal_tx: mpsc::Sender<WatcherSignal>,
   signal_rx: Mutex<Option<mpsc::Receiver<WatcherSignal>>>,
   tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionWatcher {
   pub fn new(
      login: Arc<dyn LoginManager>,
      effects: Arc<dyn SessionEffects>,
      bus: EventSender,
      uid: u32,
   ) -> Self {
      let (signal_tx, signal_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         inner: Arc::new(Inner {
            login,
            effects,
            uid,
            sessions: Registry::new(),
            active: Mutex::new(None),
            // Until the first evaluation the user is assumed to be present.
            props: PropertyStore::new(
               "/org/desktopd/SessionWatcher",
               WatcherProps { is_active: true },
               BusSink::new(bus, BusObject::SessionWatcher),
            ),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
            tasks: Mutex::new(Vec::new()),
         }),
      }
   }

   /// Tracks the existing sessions, evaluates once and starts following
   /// logind. Can only be called once.
   pub async fn start(&self) -> Result<()> {
      let inner = &self.inner;
      let mut rx = inner
         .signal_rx
         .lock()
         .take()
         .ok_or(DaemonError::ManagerShutdown)?;

      let events = inner.login.events().await?;
      let tx = inner.signal_tx.clone();
      let login_monitor = forward(events, tx, WatcherSignal::Login);

      match inner.login.list_sessions().await {
         Ok(sessions) => {
            for (id, path) in sessions {
               inner.add_session(id, &path).await;
            }
         },
         Err(e) => warn!("List sessions failed: {e}"),
      }
      inner.evaluate().await;

      let weak: Weak<Inner> = Arc::downgrade(inner);
      let signal_loop = tokio::spawn(async move {
         while let Some(signal) = rx.recv().await {
            let Some(inner) = weak.upgrade() else {
               break;
            };
            inner.handle_signal(signal).await;
         }
         debug!("session signal loop stopped");
      });

      inner.tasks.lock().extend([login_monitor, signal_loop]);
      Ok(())
   }

   pub fn shutdown(&self) {
      for task in self.inner.tasks.lock().drain(..) {
         task.abort();
      }
      self.inner.sessions.drain();
   }

   pub fn is_active(&self) -> bool {
      self.inner.props.read(|p| p.is_active)
   }

   /// Bus paths of the tracked sessions.
   pub fn get_sessions(&self) -> Vec<SmolStr> {
      self
         .inner
         .sessions
         .values()
         .iter()
         .map(|s| SmolStr::new(s.proxy.path()))
         .collect()
   }

   /// Whether the active session runs a graphical server.
   pub fn is_x11_session_active(&self) -> bool {
      self
         .inner
         .active
         .lock()
         .as_ref()
         .is_some_and(|(_, ty)| GRAPHICAL_SESSION_TYPES.contains(&ty.as_str()))
   }

   /// Id of the session found active by the last evaluation.
   pub fn active_session(&self) -> Option<SmolStr> {
      self.inner.active.lock().as_ref().map(|(id, _)| id.clone())
   }
}

impl SessionGate for SessionWatcher {
   fn is_active(&self) -> bool {
      SessionWatcher::is_active(self)
   }
}

impl Inner {
   async fn handle_signal(&self, signal: WatcherSignal) {
      match signal {
         WatcherSignal::Login(LoginSignal::SessionNew { id, path }) => {
            debug!("Session added: {id} {path}");
            self.add_session(id, &path).await;
         },
         WatcherSignal::Login(LoginSignal::SessionRemoved { id, path }) => {
            debug!("Session removed: {id} {path}");
            self.sessions.remove(&id);
         },
         WatcherSignal::ActiveChanged => {},
      }
      self.evaluate().await;
   }

   /// Starts tracking `id` if it belongs to the current user and is local.
   async fn add_session(&self, id: SmolStr, path: &str) {
      if self.sessions.contains(&id) {
         return;
      }
      let proxy = match self.login.session(path).await {
         Ok(proxy) => proxy,
         Err(e) => {
            warn!("{e}");
            return;
         },
      };

      let uid = match proxy.uid().await {
         Ok(uid) => uid,
         Err(e) => {
            warn!("{e}");
            return;
         },
      };
      if uid != self.uid {
         debug!("Not the current user session: {id} {path} {uid}");
         return;
      }
      match proxy.is_remote().await {
         Ok(false) => {},
         Ok(true) => {
            debug!("session {id} is remote");
            return;
         },
         Err(e) => {
            warn!("{e}");
            return;
         },
      }

      let monitor = match proxy.active_changes().await {
         Ok(changes) => Some(forward(changes, self.signal_tx.clone(), |_| {
            WatcherSignal::ActiveChanged
         })),
         Err(e) => {
            warn!("Failed to follow {path}: {e}");
            None
         },
      };
      debug!("Add session: {id} {path} {uid}");
      self.sessions.insert_new(id, Arc::new(TrackedSession {
         proxy,
         monitor: Mutex::new(monitor),
      }));
   }

   /// Picks the first tracked session whose `Active` reads true and applies
   /// the foreground transition, if any.
   async fn evaluate(&self) {
      if self.sessions.is_empty() {
         return;
      }

      let mut active = None;
      for (id, session) in self.sessions.with(|s| s.clone()) {
         match session.proxy.is_active().await {
            Ok(true) => {
               active = Some((id, session));
               break;
            },
            Ok(false) => {},
            Err(e) => warn!("{e}"),
         }
      }

      let is_active = active.is_some();
      let active = match active {
         Some((id, session)) => {
            let session_type = session.proxy.session_type().await.unwrap_or_else(|e| {
               warn!("{e}");
               String::new()
            });
            Some((id, session_type))
         },
         None => None,
      };
      *self.active.lock() = active;

      if !self
         .props
         .set("IsActive", |p| &mut p.is_active, is_active)
         .is_updated()
      {
         return;
      }

      info!("IsActive changed: {is_active}");
      let effects = self.effects.clone();
      tokio::spawn(async move {
         if is_active {
            effects.suspend_audio(false).await;
            effects.refresh_brightness().await;
         } else {
            effects.suspend_audio(true).await;
         }
      });
   }
}

fn forward<S: Send + 'static>(
   mut stream: BoxStream<'static, S>,
   tx: mpsc::Sender<WatcherSignal>,
   wrap: impl Fn(S) -> WatcherSignal + Send + 'static,
) -> JoinHandle<()> {
   tokio::spawn(async move {
      while let Some(item) = stream.next().await {
         if tx.send(wrap(item)).await.is_err() {
            break;
         }
      }
   })
}

#[cfg(test)]
mod tests {
   use std::{collections::BTreeMap, time::Duration};

   use super::*;
   use crate::{event::testing::RecordingBus, process::testing::RecordingRunner};

   const UID: u32 = 1000;

   #[derive(Default)]
   struct FakeLogin {
      sessions: Mutex<BTreeMap<SmolStr, Arc<FakeSession>>>,
      senders: Mutex<Vec<mpsc::UnboundedSender<LoginSignal>>>,
   }

   impl FakeLogin {
      fn add(&self, id: &str, session: Arc<FakeSession>) {
         self.sessions.lock().insert(id.into(), session);
      }

      fn announce(&self, id: &str, session: Arc<FakeSession>) {
         let path = session.path.clone();
         self.add(id, session);
         self.send(LoginSignal::SessionNew {
            id: id.into(),
            path,
         });
      }

      fn remove(&self, id: &str) {
         let Some(session) = self.sessions.lock().remove(id) else {
            return;
         };
         self.send(LoginSignal::SessionRemoved {
            id: id.into(),
            path: session.path.clone(),
         });
      }

      fn send(&self, signal: LoginSignal) {
         self.senders
            .lock()
            .retain(|tx| tx.send(signal.clone()).is_ok());
      }
   }

   #[async_trait]
   impl LoginManager for FakeLogin {
      async fn list_sessions(&self) -> Result<Vec<(SmolStr, SmolStr)>> {
         Ok(self
            .sessions
            .lock()
            .iter()
            .map(|(id, s)| (id.clone(), s.path.clone()))
            .collect())
      }

      async fn session(&self, path: &str) -> Result<SessionHandle> {
         self
            .sessions
            .lock()
            .values()
            .find(|s| s.path == path)
            .cloned()
            .map(|s| s as SessionHandle)
            .ok_or_else(|| DaemonError::SessionNotFound(path.into()))
      }

      async fn events(&self) -> Result<BoxStream<'static, LoginSignal>> {
         let (tx, rx) = mpsc::unbounded_channel();
         self.senders.lock().push(tx);
         Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
         })
         .boxed())
      }
   }

   struct FakeSession {
      path: SmolStr,
      uid: u32,
      remote: bool,
      session_type: String,
      active: Mutex<bool>,
      senders: Mutex<Vec<mpsc::UnboundedSender<bool>>>,
   }

   impl FakeSession {
      fn build(n: u32, uid: u32, session_type: &str, active: bool, remote: bool) -> Arc<Self> {
         Arc::new(Self {
            path: format!("/org/freedesktop/login1/session/_3{n}").into(),
            uid,
            remote,
            session_type: session_type.to_string(),
            active: Mutex::new(active),
            senders: Mutex::new(Vec::new()),
         })
      }

      fn new(n: u32, uid: u32, session_type: &str, active: bool) -> Arc<Self> {
         Self::build(n, uid, session_type, active, false)
      }

      fn remote(n: u32) -> Arc<Self> {
         Self::build(n, UID, "x11", true, true)
      }

      fn set_active(&self, active: bool) {
         *self.active.lock() = active;
         self.senders.lock().retain(|tx| tx.send(active).is_ok());
      }
   }

   #[async_trait]
   impl LoginSession for FakeSession {
      fn path(&self) -> &str {
         &self.path
      }

      async fn uid(&self) -> Result<u32> {
         Ok(self.uid)
      }

      async fn is_remote(&self) -> Result<bool> {
         Ok(self.remote)
      }

      async fn is_active(&self) -> Result<bool> {
         Ok(*self.active.lock())
      }

      async fn session_type(&self) -> Result<String> {
         Ok(self.session_type.clone())
      }

      async fn active_changes(&self) -> Result<BoxStream<'static, bool>> {
         let (tx, rx) = mpsc::unbounded_channel();
         self.senders.lock().push(tx);
         Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|v| (v, rx))
         })
         .boxed())
      }
   }

   #[derive(Default)]
   struct RecordingEffects {
      calls: Mutex<Vec<&'static str>>,
   }

   #[async_trait]
   impl SessionEffects for RecordingEffects {
      async fn suspend_audio(&self, suspend: bool) {
         self.calls
            .lock()
            .push(if suspend { "suspend" } else { "resume" });
      }

      async fn refresh_brightness(&self) {
         self.calls.lock().push("brightness");
      }
   }

   async fn settle() {
      tokio::time::sleep(Duration::from_millis(10)).await;
   }

   async fn start(
      login: &Arc<FakeLogin>,
   ) -> (SessionWatcher, Arc<RecordingEffects>, Arc<RecordingBus>) {
      let effects = Arc::new(RecordingEffects::default());
      let bus = RecordingBus::new();
      let watcher = SessionWatcher::new(login.clone(), effects.clone(), bus.clone(), UID);
      watcher.start().await.unwrap();
      settle().await;
      (watcher, effects, bus)
   }

   #[tokio::test(start_paused = true)]
   async fn test_only_local_sessions_of_user_are_tracked() {
      let login = Arc::new(FakeLogin::default());
      login.add("1", FakeSession::new(1, UID, "x11", true));
      login.add("2", FakeSession::new(2, 0, "tty", true));
      login.add("3", FakeSession::remote(3));
      let (watcher, _, _) = start(&login).await;

      assert_eq!(
         watcher.get_sessions(),
         vec![SmolStr::new("/org/freedesktop/login1/session/_31")]
      );
      assert!(watcher.is_x11_session_active());
   }

   #[tokio::test(start_paused = true)]
   async fn test_switching_away_suspends_audio_once() {
      let login = Arc::new(FakeLogin::default());
      let session = FakeSession::new(1, UID, "wayland", true);
      login.add("1", session.clone());
      let (watcher, effects, bus) = start(&login).await;

      // Initially active already, so no transition.
      assert!(watcher.is_active());
      assert!(effects.calls.lock().is_empty());

      session.set_active(false);
      settle().await;
      assert!(!watcher.is_active());
      assert!(!watcher.is_x11_session_active());
      assert_eq!(*effects.calls.lock(), vec!["suspend"]);

      session.set_active(false);
      settle().await;
      assert_eq!(effects.calls.lock().len(), 1);

      session.set_active(true);
      settle().await;
      assert_eq!(*effects.calls.lock(), vec!["suspend", "resume", "brightness"]);
      assert_eq!(
         bus.count(|e| matches!(
            e,
            crate::event::Event::PropertyChanged(BusObject::SessionWatcher, "IsActive")
         )),
         2
      );
   }

   #[tokio::test(start_paused = true)]
   async fn test_at_most_one_session_is_active() {
      let login = Arc::new(FakeLogin::default());
      login.add("1", FakeSession::new(1, UID, "tty", true));
      login.add("2", FakeSession::new(2, UID, "x11", true));
      let (watcher, _, _) = start(&login).await;

      assert_eq!(watcher.active_session(), Some(SmolStr::new("1")));
      assert!(!watcher.is_x11_session_active());

      login.remove("1");
      settle().await;
      assert_eq!(watcher.active_session(), Some(SmolStr::new("2")));
      assert!(watcher.is_x11_session_active());
   }

   #[tokio::test(start_paused = true)]
   async fn test_new_session_is_picked_up() {
      let login = Arc::new(FakeLogin::default());
      let (watcher, effects, _) = start(&login).await;
      assert!(watcher.is_active());
      assert!(watcher.get_sessions().is_empty());

      login.announce("5", FakeSession::new(5, UID, "x11", false));
      settle().await;
      assert_eq!(watcher.get_sessions().len(), 1);
      assert!(!watcher.is_active());
      assert_eq!(*effects.calls.lock(), vec!["suspend"]);
   }

   #[tokio::test]
   async fn test_pactl_suspends_every_sink_and_source() {
      let runner = RecordingRunner::new();
      let effects = DesktopEffects::new(runner.clone(), None);
      effects.suspend_audio(true).await;

      let calls = runner.calls();
      assert_eq!(calls[0], "pactl list short sinks");
      assert_eq!(calls[1], "pactl list short sources");
      effects.refresh_brightness().await;
   }
}
