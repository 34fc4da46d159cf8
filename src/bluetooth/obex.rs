//! OBEX object push for `SendFiles`.
//!
//! A send creates one obexd session, pushes the files one at a time and polls
//! each transfer until it settles. Cancellation is a one-shot channel per
//! session, checked between polls.

use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, info, warn};
use parking_lot::Mutex;
use smol_str::SmolStr;
use strum::{Display, EnumString};
use tokio::{select, sync::oneshot, time};
use zbus::{
   Connection, proxy,
   proxy::CacheProperties,
   zvariant::{ObjectPath, OwnedObjectPath, OwnedValue, Value},
};

use crate::{
   error::{DaemonError, Result},
   event::{Event, EventSender},
};

/// Delay between transfer status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[proxy(
   interface = "org.bluez.obex.Client1",
   default_service = "org.bluez.obex",
   default_path = "/org/bluez/obex"
)]
trait Client1 {
   fn create_session(
      &self,
      destination: &str,
      args: HashMap<&str, Value<'_>>,
   ) -> zbus::Result<OwnedObjectPath>;

   fn remove_session(&self, session: &ObjectPath<'_>) -> zbus::Result<()>;
}

#[proxy(interface = "org.bluez.obex.ObjectPush1", default_service = "org.bluez.obex")]
trait ObjectPush1 {
   fn send_file(
      &self,
      sourcefile: &str,
   ) -> zbus::Result<(OwnedObjectPath, HashMap<String, OwnedValue>)>;
}

#[proxy(interface = "org.bluez.obex.Transfer1", default_service = "org.bluez.obex")]
trait Transfer1 {
   fn cancel(&self) -> zbus::Result<()>;

   #[zbus(property)]
   fn status(&self) -> zbus::Result<String>;
}

/// obexd transfer status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum TransferStatus {
   Queued,
   Active,
   Suspended,
   Complete,
   Error,
}

#[async_trait]
pub trait ObexClient: Send + Sync {
   /// Opens an object push session to `destination` (a device address).
   async fn create_session(&self, destination: &str) -> Result<SmolStr>;
   async fn remove_session(&self, session: &str) -> Result<()>;
   /// Queues `file` and returns the transfer path.
   async fn send_file(&self, session: &str, file: &str) -> Result<SmolStr>;
   async fn transfer_status(&self, transfer: &str) -> Result<TransferStatus>;
   async fn cancel_transfer(&self, transfer: &str) -> Result<()>;
}

/// obexd on the session bus.
pub struct ZbusObex {
   conn: Connection,
}

impl ZbusObex {
   pub const fn new(conn: Connection) -> Self {
      Self { conn }
   }

   async fn transfer(&self, transfer: &str) -> Result<Transfer1Proxy<'static>> {
      Ok(Transfer1Proxy::builder(&self.conn)
         .path(transfer.to_string())?
         .cache_properties(CacheProperties::No)
         .build()
         .await?)
   }
}

#[async_trait]
impl ObexClient for ZbusObex {
   async fn create_session(&self, destination: &str) -> Result<SmolStr> {
      let client = Client1Proxy::new(&self.conn).await?;
      let args = HashMap::from([("Target", Value::from("opp"))]);
      let path = client.create_session(destination, args).await?;
      Ok(path.as_str().into())
   }

   async fn remove_session(&self, session: &str) -> Result<()> {
      let client = Client1Proxy::new(&self.conn).await?;
      let path = ObjectPath::try_from(session).map_err(zbus::Error::from)?;
      Ok(client.remove_session(&path).await?)
   }

   async fn send_file(&self, session: &str, file: &str) -> Result<SmolStr> {
      let push = ObjectPush1Proxy::builder(&self.conn)
         .path(session.to_string())?
         .build()
         .await?;
      let (transfer, _) = push.send_file(file).await?;
      Ok(transfer.as_str().into())
   }

   async fn transfer_status(&self, transfer: &str) -> Result<TransferStatus> {
      let status = self.transfer(transfer).await?.status().await?;
      TransferStatus::from_str(&status)
         .map_err(|_| DaemonError::CommandFailed(format!("unknown transfer status {status}")))
   }

   async fn cancel_transfer(&self, transfer: &str) -> Result<()> {
      Ok(self.transfer(transfer).await?.cancel().await?)
   }
}

/// Runs object push sessions and keeps their cancel channels.
pub struct FileSender {
   client: Arc<dyn ObexClient>,
   bus: EventSender,
   sessions: Mutex<HashMap<SmolStr, oneshot::Sender<()>>>,
}

impl FileSender {
   pub fn new(client: Arc<dyn ObexClient>, bus: EventSender) -> Arc<Self> {
      Arc::new(Self {
         client,
         bus,
         sessions: Mutex::new(HashMap::new()),
      })
   }

   /// Starts pushing `files` to `destination`; returns the session path.
   pub async fn send_files(self: &Arc<Self>, destination: &str, files: Vec<String>) -> Result<SmolStr> {
      if files.is_empty() {
         return Err(DaemonError::EmptyFileList);
      }
      let session = self.client.create_session(destination).await?;
      info!("Sending {} file(s) to {destination} via {session}", files.len());

      let (cancel_tx, cancel_rx) = oneshot::channel();
      self.sessions.lock().insert(session.clone(), cancel_tx);
      tokio::spawn(self.clone().run(session.clone(), files, cancel_rx));
      Ok(session)
   }

   pub fn cancel(&self, session: &str) -> Result<()> {
      let tx = self
         .sessions
         .lock()
         .remove(session)
         .ok_or_else(|| DaemonError::TransferNotFound(session.into()))?;
      let _ = tx.send(());
      Ok(())
   }

   async fn run(self: Arc<Self>, session: SmolStr, files: Vec<String>, mut cancel: oneshot::Receiver<()>) {
      'files: for file in files {
         let transfer = match self.client.send_file(&session, &file).await {
            Ok(transfer) => transfer,
            Err(e) => {
               warn!("Failed to send {file}: {e}");
               self.bus.emit(Event::TransferFailed {
                  file,
                  session: session.clone(),
                  message: e.to_string(),
               });
               break;
            },
         };
         self.bus.emit(Event::TransferCreated {
            file: file.clone(),
            transfer: transfer.clone(),
            session: session.clone(),
         });

         let done = loop {
            select! {
               _ = &mut cancel => {
                  debug!("transfer session {session} cancelled");
                  if let Err(e) = self.client.cancel_transfer(&transfer).await {
                     warn!("Failed to cancel {transfer}: {e}");
                  }
                  self.bus.emit(Event::TransferRemoved {
                     file,
                     transfer,
                     session: session.clone(),
                     done: false,
                  });
                  break 'files;
               },
               () = time::sleep(POLL_INTERVAL) => {},
            }
            match self.client.transfer_status(&transfer).await {
               Ok(TransferStatus::Complete) => break true,
               Ok(TransferStatus::Error) => break false,
               Ok(_) => {},
               // obexd drops finished transfers right away.
               Err(e) => {
                  debug!("{transfer} vanished: {e}");
                  break true;
               },
            }
         };

         self.bus.emit(Event::TransferRemoved {
            file: file.clone(),
            transfer,
            session: session.clone(),
            done,
         });
         if !done {
            self.bus.emit(Event::TransferFailed {
               file,
               session: session.clone(),
               message: "transfer failed".to_string(),
            });
            break;
         }
      }

      self.sessions.lock().remove(&session);
      if let Err(e) = self.client.remove_session(&session).await {
         debug!("Failed to remove OBEX session {session}: {e}");
      }
   }
}

#[cfg(test)]
mod tests {
   use std::collections::VecDeque;

   use super::*;
   use crate::event::testing::RecordingBus;

   /// obexd stand-in: each transfer reports the scripted statuses in order.
   #[derive(Default)]
   struct FakeObex {
      script: Mutex<VecDeque<TransferStatus>>,
      calls: Mutex<Vec<String>>,
   }

   impl FakeObex {
      fn with(script: &[TransferStatus]) -> Arc<Self> {
         Arc::new(Self {
            script: Mutex::new(script.iter().copied().collect()),
            calls: Mutex::new(Vec::new()),
         })
      }

      fn calls(&self) -> Vec<String> {
         self.calls.lock().clone()
      }
   }

   #[async_trait]
   impl ObexClient for FakeObex {
      async fn create_session(&self, destination: &str) -> Result<SmolStr> {
         self.calls.lock().push(format!("session {destination}"));
         Ok("/org/bluez/obex/client/session0".into())
      }

      async fn remove_session(&self, session: &str) -> Result<()> {
         self.calls.lock().push(format!("remove {session}"));
         Ok(())
      }

      async fn send_file(&self, _session: &str, file: &str) -> Result<SmolStr> {
         self.calls.lock().push(format!("send {file}"));
         Ok(format!("/org/bluez/obex/client/session0/transfer{}", file.len()).into())
      }

      async fn transfer_status(&self, _transfer: &str) -> Result<TransferStatus> {
         Ok(self
            .script
            .lock()
            .pop_front()
            .unwrap_or(TransferStatus::Active))
      }

      async fn cancel_transfer(&self, transfer: &str) -> Result<()> {
         self.calls.lock().push(format!("cancel {transfer}"));
         Ok(())
      }
   }

   fn removed(bus: &RecordingBus) -> Vec<bool> {
      bus.events()
         .into_iter()
         .filter_map(|e| match e {
            Event::TransferRemoved { done, .. } => Some(done),
            _ => None,
         })
         .collect()
   }

   #[tokio::test(start_paused = true)]
   async fn test_files_are_sent_in_order() {
      let bus = RecordingBus::new();
      let obex = FakeObex::with(&[
         TransferStatus::Active,
         TransferStatus::Complete,
         TransferStatus::Complete,
      ]);
      let sender = FileSender::new(obex.clone(), bus.clone());

      let session = sender
         .send_files("AA:BB:CC:00:00:01", vec!["/a".into(), "/bb".into()])
         .await
         .unwrap();
      time::sleep(Duration::from_secs(5)).await;

      assert_eq!(removed(&bus), vec![true, true]);
      assert_eq!(
         obex.calls(),
         vec![
            "session AA:BB:CC:00:00:01".to_string(),
            "send /a".into(),
            "send /bb".into(),
            format!("remove {session}"),
         ]
      );
      assert!(sender.cancel(&session).is_err());
   }

   #[tokio::test(start_paused = true)]
   async fn test_failed_transfer_stops_the_session() {
      let bus = RecordingBus::new();
      let obex = FakeObex::with(&[TransferStatus::Error]);
      let sender = FileSender::new(obex.clone(), bus.clone());

      sender
         .send_files("AA:BB:CC:00:00:01", vec!["/a".into(), "/bb".into()])
         .await
         .unwrap();
      time::sleep(Duration::from_secs(5)).await;

      assert_eq!(removed(&bus), vec![false]);
      assert_eq!(
         bus.count(|e| matches!(e, Event::TransferFailed { .. })),
         1
      );
      assert!(!obex.calls().contains(&"send /bb".to_string()));
   }

   #[tokio::test(start_paused = true)]
   async fn test_cancel_between_polls() {
      let bus = RecordingBus::new();
      let obex = FakeObex::with(&[]);
      let sender = FileSender::new(obex.clone(), bus.clone());

      let session = sender
         .send_files("AA:BB:CC:00:00:01", vec!["/a".into(), "/bb".into()])
         .await
         .unwrap();
      time::sleep(Duration::from_secs(2)).await;
      sender.cancel(&session).unwrap();
      time::sleep(Duration::from_secs(2)).await;

      assert_eq!(removed(&bus), vec![false]);
      let calls = obex.calls();
      assert!(calls.iter().any(|c| c.starts_with("cancel ")));
      assert!(calls.contains(&format!("remove {session}")));
      assert!(matches!(
         sender.cancel(&session),
         Err(DaemonError::TransferNotFound(_))
      ));
   }

   #[tokio::test]
   async fn test_empty_file_list_is_rejected() {
      let sender = FileSender::new(FakeObex::with(&[]), RecordingBus::new());
      assert!(matches!(
         sender.send_files("AA:BB:CC:00:00:01", Vec::new()).await,
         Err(DaemonError::EmptyFileList)
      ));
   }
}
