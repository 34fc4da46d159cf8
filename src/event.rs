//! Event handling for bus-visible state changes.
//!
//! Subsystems never talk to the bus connection directly. They push [`Event`]s
//! into an [`EventBus`]; the dispatcher in `main` turns them into D-Bus
//! signals and property-changed notifications in arrival order.

use std::sync::Arc;

use smol_str::SmolStr;

/// Bus objects whose properties are published through `PropertiesChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusObject {
   Bluetooth,
   SessionWatcher,
   Gesture,
   Touchpad,
   WarnLevel,
}

/// Pairing agent requests forwarded to the shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingRequest {
   RequestPinCode,
   RequestPasskey,
   RequestConfirmation(String),
   RequestAuthorization,
   AuthorizeService(String),
   DisplayPinCode(String),
   DisplayPasskey { passkey: u32, entered: u16 },
   Cancelled,
}

/// Events that can be emitted by the daemons.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
   AdapterAdded(String),
   AdapterRemoved(String),
   AdapterPropertiesChanged(String),
   DeviceAdded(String),
   DeviceRemoved(String),
   DevicePropertiesChanged(String),
   /// A pending connection target vanished; carries the device path and the
   /// last alias known for it.
   ConnectFailed {
      device: SmolStr,
      alias: String,
   },
   Pairing {
      device: SmolStr,
      request: PairingRequest,
   },
   TransferCreated {
      file: String,
      transfer: SmolStr,
      session: SmolStr,
   },
   TransferRemoved {
      file: String,
      transfer: SmolStr,
      session: SmolStr,
      done: bool,
   },
   TransferFailed {
      file: String,
      session: SmolStr,
      message: String,
   },
   PropertyChanged(BusObject, &'static str),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Queues an event for delivery. Must not block.
   fn emit(&self, event: Event);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;

#[cfg(test)]
pub mod testing {
   use parking_lot::Mutex;

   use super::*;

   /// Event bus that records everything it is given.
   #[derive(Default)]
   pub struct RecordingBus {
      events: Mutex<Vec<Event>>,
   }

   impl RecordingBus {
      pub fn new() -> Arc<Self> {
         Arc::new(Self::default())
      }

      pub fn events(&self) -> Vec<Event> {
         self.events.lock().clone()
      }

      pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
         self.events.lock().iter().filter(|e| pred(e)).count()
      }

      pub fn clear(&self) {
         self.events.lock().clear();
      }
   }

   impl EventBus for RecordingBus {
      fn emit(&self, event: Event) {
         self.events.lock().push(event);
      }
   }
}
