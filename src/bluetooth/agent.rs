//! Pairing agent.
//!
//! BlueZ calls into the agent while pairing. Requests that need an answer
//! from the user are forwarded to the shell as [`Event::Pairing`] and parked
//! until `Confirm`, `FeedPinCode` or `FeedPasskey` arrives for the same
//! device. When BlueZ gives up first, the parked request is dropped and the
//! shell is told with [`PairingRequest::Cancelled`].

use std::{collections::HashMap, sync::Arc};

use bluer::agent::{
   Agent, AuthorizeService, DisplayPasskey, DisplayPinCode, ReqError, ReqResult,
   RequestAuthorization, RequestConfirmation, RequestPasskey, RequestPinCode,
};
use futures::FutureExt;
use log::{debug, info};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tokio::sync::oneshot;

use crate::{
   bluetooth::remote::device_path,
   error::{DaemonError, Result},
   event::{Event, EventSender, PairingRequest},
};

/// Highest passkey BlueZ accepts.
pub const MAX_PASSKEY: u32 = 999_999;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
   accept: bool,
   key: String,
}

#[derive(Default)]
struct Pending {
   next_id: u64,
   requests: HashMap<SmolStr, (u64, oneshot::Sender<Reply>)>,
}

pub struct PairingAgent {
   bus: EventSender,
   pending: Mutex<Pending>,
}

/// Announces a cancellation if the request is dropped unanswered.
struct PendingGuard<'a> {
   agent: &'a PairingAgent,
   device: SmolStr,
   id: u64,
   answered: bool,
}

impl Drop for PendingGuard<'_> {
   fn drop(&mut self) {
      if self.answered {
         return;
      }
      let mut pending = self.agent.pending.lock();
      if pending
         .requests
         .get(&self.device)
         .is_some_and(|(id, _)| *id == self.id)
      {
         pending.requests.remove(&self.device);
      }
      drop(pending);
      debug!("pairing request for {} cancelled", self.device);
      self.agent.bus.emit(Event::Pairing {
         device: self.device.clone(),
         request: PairingRequest::Cancelled,
      });
   }
}

impl PairingAgent {
   pub fn new(bus: EventSender) -> Arc<Self> {
      Arc::new(Self {
         bus,
         pending: Mutex::new(Pending::default()),
      })
   }

   /// Forwards `request` and waits for the user's answer.
   async fn ask(&self, device: SmolStr, request: PairingRequest) -> Result<Reply> {
      let (tx, rx) = oneshot::channel();
      let id = {
         let mut pending = self.pending.lock();
         pending.next_id += 1;
         let id = pending.next_id;
         // A newer request supersedes the old one; its waiter sees a rejection.
         pending.requests.insert(device.clone(), (id, tx));
         id
      };

      let mut guard = PendingGuard {
         agent: self,
         device: device.clone(),
         id,
         answered: false,
      };
      self.bus.emit(Event::Pairing { device, request });

      let reply = rx.await;
      guard.answered = true;
      match reply {
         Ok(reply) if reply.accept => Ok(reply),
         _ => Err(DaemonError::RequestRejected),
      }
   }

   fn notify(&self, device: SmolStr, request: PairingRequest) {
      self.bus.emit(Event::Pairing { device, request });
   }

   /// Answers the request parked for `device`.
   pub fn feed(&self, device: &str, accept: bool, key: impl Into<String>) -> Result<()> {
      let (_, tx) = self
         .pending
         .lock()
         .requests
         .remove(device)
         .ok_or_else(|| DaemonError::NoPendingRequest(device.into()))?;
      tx.send(Reply {
         accept,
         key: key.into(),
      })
      .map_err(|_| DaemonError::NoPendingRequest(device.into()))
   }

   pub fn confirm(&self, device: &str, accept: bool) -> Result<()> {
      self.feed(device, accept, "")
   }

   pub fn feed_pin_code(&self, device: &str, accept: bool, pin_code: &str) -> Result<()> {
      self.feed(device, accept, pin_code)
   }

   pub fn feed_passkey(&self, device: &str, accept: bool, passkey: u32) -> Result<()> {
      if passkey > MAX_PASSKEY {
         return Err(DaemonError::InvalidPasskey(passkey));
      }
      self.feed(device, accept, format!("{passkey:06}"))
   }

   /// Builds the `bluer` agent whose callbacks route through this object.
   pub fn to_bluer(self: &Arc<Self>) -> Agent {
      let pin = self.clone();
      let passkey = self.clone();
      let confirmation = self.clone();
      let authorization = self.clone();
      let service = self.clone();
      let display_pin = self.clone();
      let display_passkey = self.clone();

      Agent {
         request_default: true,
         request_pin_code: Some(Box::new(move |req: RequestPinCode| {
            let agent = pin.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               let reply = agent.answer(device, PairingRequest::RequestPinCode).await?;
               Ok(reply.key)
            }
            .boxed()
         })),
         request_passkey: Some(Box::new(move |req: RequestPasskey| {
            let agent = passkey.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               let reply = agent.answer(device, PairingRequest::RequestPasskey).await?;
               reply.key.parse::<u32>().map_err(|_| ReqError::Rejected)
            }
            .boxed()
         })),
         request_confirmation: Some(Box::new(move |req: RequestConfirmation| {
            let agent = confirmation.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               let request = PairingRequest::RequestConfirmation(format!("{:06}", req.passkey));
               agent.answer(device, request).await.map(|_| ())
            }
            .boxed()
         })),
         request_authorization: Some(Box::new(move |req: RequestAuthorization| {
            let agent = authorization.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               agent
                  .answer(device, PairingRequest::RequestAuthorization)
                  .await
                  .map(|_| ())
            }
            .boxed()
         })),
         authorize_service: Some(Box::new(move |req: AuthorizeService| {
            let agent = service.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               let request = PairingRequest::AuthorizeService(req.service.to_string());
               agent.answer(device, request).await.map(|_| ())
            }
            .boxed()
         })),
         display_pin_code: Some(Box::new(move |req: DisplayPinCode| {
            let agent = display_pin.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               agent.notify(device, PairingRequest::DisplayPinCode(req.pincode));
               Ok(())
            }
            .boxed()
         })),
         display_passkey: Some(Box::new(move |req: DisplayPasskey| {
            let agent = display_passkey.clone();
            async move {
               let device = device_path(&req.adapter, req.device);
               agent.notify(device, PairingRequest::DisplayPasskey {
                  passkey: req.passkey,
                  entered: req.entered,
               });
               Ok(())
            }
            .boxed()
         })),
         ..Default::default()
      }
   }

   async fn answer(&self, device: SmolStr, request: PairingRequest) -> ReqResult<Reply> {
      info!("Pairing request {request:?} for {device}");
      self.ask(device, request).await.map_err(|_| ReqError::Rejected)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::event::testing::RecordingBus;

   const DEV: &str = "/org/bluez/hci0/dev_AA_BB_CC_00_00_01";

   fn requests(bus: &RecordingBus) -> Vec<PairingRequest> {
      bus.events()
         .into_iter()
         .filter_map(|e| match e {
            Event::Pairing { request, .. } => Some(request),
            _ => None,
         })
         .collect()
   }

   #[tokio::test]
   async fn test_passkey_is_zero_padded() {
      let bus = RecordingBus::new();
      let agent = PairingAgent::new(bus.clone());

      let waiter = {
         let agent = agent.clone();
         tokio::spawn(async move { agent.ask(DEV.into(), PairingRequest::RequestPasskey).await })
      };
      tokio::task::yield_now().await;
      assert_eq!(requests(&bus), vec![PairingRequest::RequestPasskey]);

      agent.feed_passkey(DEV, true, 42).unwrap();
      assert_eq!(waiter.await.unwrap().unwrap().key, "000042");
   }

   #[tokio::test]
   async fn test_rejects_out_of_range_passkey() {
      let agent = PairingAgent::new(RecordingBus::new());
      assert!(matches!(
         agent.feed_passkey(DEV, true, 1_000_000),
         Err(DaemonError::InvalidPasskey(1_000_000))
      ));
   }

   #[tokio::test]
   async fn test_feed_without_request_fails() {
      let agent = PairingAgent::new(RecordingBus::new());
      assert!(matches!(
         agent.confirm(DEV, true),
         Err(DaemonError::NoPendingRequest(_))
      ));
   }

   #[tokio::test]
   async fn test_declined_request_is_rejected() {
      let bus = RecordingBus::new();
      let agent = PairingAgent::new(bus.clone());
      let waiter = {
         let agent = agent.clone();
         tokio::spawn(async move {
            agent
               .ask(DEV.into(), PairingRequest::RequestConfirmation("123456".into()))
               .await
         })
      };
      tokio::task::yield_now().await;
      agent.confirm(DEV, false).unwrap();
      assert!(matches!(
         waiter.await.unwrap(),
         Err(DaemonError::RequestRejected)
      ));
      assert!(!requests(&bus).contains(&PairingRequest::Cancelled));
   }

   #[tokio::test]
   async fn test_abandoned_request_announces_cancel() {
      let bus = RecordingBus::new();
      let agent = PairingAgent::new(bus.clone());
      let waiter = {
         let agent = agent.clone();
         tokio::spawn(async move { agent.ask(DEV.into(), PairingRequest::RequestPinCode).await })
      };
      tokio::task::yield_now().await;
      waiter.abort();
      let _ = waiter.await;

      assert_eq!(
         requests(&bus),
         vec![PairingRequest::RequestPinCode, PairingRequest::Cancelled]
      );
      assert!(agent.feed_pin_code(DEV, true, "0000").is_err());
   }
}
