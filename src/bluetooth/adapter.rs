//! Mirrored BlueZ adapter and its discovery state machine.
//!
//! An adapter owns two single-shot timers: the discovery expiry, which stops
//! scanning after a quiet period and freezes the device list into the backup
//! snapshot, and the find-device expiry, which reports a pending connection
//! target that never showed up. Both are built by the manager, since their
//! callbacks act on the manager's collections.

use std::{fs, sync::Arc, time::Duration};

use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;
use smol_str::SmolStr;
use tokio::task::JoinHandle;

use crate::{
   bluetooth::remote::{AdapterHandle, AdapterProp, AdapterProxy},
   error::Result,
   event::{Event, EventSender},
   property::{PropertySink, PropertyStore},
   timer::OneShotTimer,
};

const FIRST_BOOT_HOSTNAME: &str = "first-boot-hostname";

/// Published adapter state.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct AdapterProps {
   pub path: SmolStr,
   pub name: String,
   pub alias: String,
   pub powered: bool,
   pub discovering: bool,
   pub discoverable: bool,
   pub discoverable_timeout: u32,

   #[serde(skip)]
   pub address: String,
   /// The last discovery ended by expiry rather than by the user.
   #[serde(skip)]
   pub discovery_timed_out: bool,
   /// A find-device window is open for the pending connection target.
   #[serde(skip)]
   pub find_device_pending: bool,
}

/// What the manager has to do after a remote property change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterFollowUp {
   Nothing,
   Changed,
   PoweredOn,
   PoweredOff,
}

struct AdapterSink {
   bus: EventSender,
}

impl PropertySink<AdapterProps> for AdapterSink {
   fn changed(&self, path: &str, name: &'static str, state: &AdapterProps) {
      debug!("{path} {name} changed");
      match serde_json::to_string(state) {
         Ok(json) => self.bus.emit(Event::AdapterPropertiesChanged(json)),
         Err(e) => warn!("Failed to serialize adapter {path}: {e}"),
      }
   }
}

/// Timing parameters copied from the configuration at creation.
#[derive(Debug, Clone, Copy)]
pub struct AdapterTimeouts {
   pub discovery: Duration,
   pub find_device: Duration,
}

pub struct Adapter {
   proxy: AdapterHandle,
   props: PropertyStore<AdapterProps>,
   timeouts: AdapterTimeouts,
   discovery_timer: Arc<OneShotTimer>,
   find_device_timer: Arc<OneShotTimer>,
   monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Adapter {
   /// Builds the mirror. Reads are best effort; the first-boot placeholder
   /// alias is cleared when the machine has been given a real host name.
   pub async fn new(
      path: SmolStr,
      proxy: AdapterHandle,
      bus: EventSender,
      timeouts: AdapterTimeouts,
      discovery_timer: Arc<OneShotTimer>,
      find_device_timer: Arc<OneShotTimer>,
   ) -> Arc<Self> {
      if proxy.alias().await.is_ok_and(|a| a == FIRST_BOOT_HOSTNAME) {
         match hostname() {
            Ok(host) if host != FIRST_BOOT_HOSTNAME => {
               if let Err(e) = proxy.set_alias("").await {
                  warn!("Failed to reset alias of {path}: {e}");
               }
            },
            Ok(_) => {},
            Err(e) => warn!("Failed to read host name: {e}"),
         }
      }

      let props = AdapterProps {
         path: path.clone(),
         name: proxy.system_name().await.unwrap_or_default(),
         alias: proxy.alias().await.unwrap_or_default(),
         powered: proxy.is_powered().await.unwrap_or_default(),
         discovering: proxy.is_discovering().await.unwrap_or_default(),
         discoverable: proxy.is_discoverable().await.unwrap_or_default(),
         discoverable_timeout: proxy.discoverable_timeout().await.unwrap_or_default(),
         address: proxy
            .address()
            .await
            .map(|a| a.to_string())
            .unwrap_or_default(),
         discovery_timed_out: false,
         find_device_pending: false,
      };

      Arc::new(Self {
         proxy,
         props: PropertyStore::new(path, props, Arc::new(AdapterSink { bus })),
         timeouts,
         discovery_timer,
         find_device_timer,
         monitor: Mutex::new(None),
      })
   }

   pub fn path(&self) -> &SmolStr {
      self.props.path()
   }

   pub fn proxy(&self) -> &AdapterHandle {
      &self.proxy
   }

   pub fn snapshot(&self) -> AdapterProps {
      self.props.snapshot()
   }

   pub fn to_json(&self) -> String {
      self
         .props
         .read(|p| serde_json::to_string(p))
         .unwrap_or_default()
   }

   pub fn address(&self) -> String {
      self.props.read(|p| p.address.clone())
   }

   pub fn is_powered(&self) -> bool {
      self.props.read(|p| p.powered)
   }

   pub fn discovery_timed_out(&self) -> bool {
      self.props.read(|p| p.discovery_timed_out)
   }

   pub fn set_discovery_timed_out(&self, timed_out: bool) {
      self.props.update(|p| p.discovery_timed_out = timed_out);
   }

   pub(crate) fn set_monitor(&self, handle: JoinHandle<()>) {
      if let Some(old) = self.monitor.lock().replace(handle) {
         old.abort();
      }
   }

   /// Applies a remote property change.
   pub fn apply(&self, prop: AdapterProp) -> AdapterFollowUp {
      let props = &self.props;
      let changed = |updated: bool| {
         if updated {
            AdapterFollowUp::Changed
         } else {
            AdapterFollowUp::Nothing
         }
      };
      match prop {
         AdapterProp::Name(v) => changed(props.set("Name", |p| &mut p.name, v).is_updated()),
         AdapterProp::Alias(v) => changed(props.set("Alias", |p| &mut p.alias, v).is_updated()),
         AdapterProp::Discoverable(v) => {
            changed(props.set("Discoverable", |p| &mut p.discoverable, v).is_updated())
         },
         AdapterProp::DiscoverableTimeout(v) => {
            changed(props.set_quiet(|p| &mut p.discoverable_timeout, v).is_updated())
         },
         AdapterProp::Discovering(v) => {
            // Scanning that flips against the power state is noise from the
            // power sequence, unless it is the expiry stopping a scan.
            let op = props.set_when("Discovering", |p| &mut p.discovering, v, |p| {
               p.discovery_timed_out || p.discovering == p.powered
            });
            changed(op.is_updated())
         },
         AdapterProp::Powered(v) => {
            if !props.set("Powered", |p| &mut p.powered, v).is_updated() {
               return AdapterFollowUp::Nothing;
            }
            if v {
               AdapterFollowUp::PoweredOn
            } else {
               self.set_discovery_timed_out(false);
               self.discovery_timer.reset(self.timeouts.discovery);
               AdapterFollowUp::PoweredOff
            }
         },
      }
   }

   /// Starts scanning and arms the discovery expiry once BlueZ accepted.
   pub async fn start_discovery(&self) {
      self.set_discovery_timed_out(false);
      match self.proxy.start_discovery().await {
         Ok(()) => {
            debug!("{}: discovery started, expiry armed", self.path());
            self.discovery_timer.reset(self.timeouts.discovery);
         },
         Err(e) => warn!("Failed to start discovery on {}: {e}", self.path()),
      }
   }

   /// Re-arms the discovery expiry without touching the remote scan.
   pub fn reset_discovery_expiry(&self) {
      self.discovery_timer.reset(self.timeouts.discovery);
   }

   pub async fn stop_discovery(&self) -> Result<()> {
      self.proxy.stop_discovery().await
   }

   /// Opens the find-device window for the pending connection target.
   pub fn arm_find_device(&self) {
      self.props.update(|p| p.find_device_pending = true);
      self.find_device_timer.reset(self.timeouts.find_device);
   }

   /// Closes the find-device window. Returns whether it was open.
   pub fn close_find_device(&self) -> bool {
      self
         .props
         .update(|p| std::mem::replace(&mut p.find_device_pending, false))
   }

   /// Detaches the monitor and releases both timers.
   pub fn destroy(&self) {
      if let Some(handle) = self.monitor.lock().take() {
         handle.abort();
      }
      self.discovery_timer.stop();
      self.find_device_timer.stop();
   }
}

impl Drop for Adapter {
   fn drop(&mut self) {
      self.destroy();
   }
}

fn hostname() -> std::io::Result<String> {
   Ok(fs::read_to_string("/proc/sys/kernel/hostname")?
      .trim()
      .to_string())
}
