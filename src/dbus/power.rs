use std::sync::Arc;

use zbus::{interface, object_server::SignalEmitter};

use crate::{
   dbus::{setting_bool, setting_int},
   power::warn_level::WarnLevelManager,
   settings::{ChangeOrigin, SettingValue},
};

pub struct WarnLevelService {
   manager: Arc<WarnLevelManager>,
}

impl WarnLevelService {
   pub const fn new(manager: Arc<WarnLevelManager>) -> Self {
      Self { manager }
   }

   fn int(&self, property: &str) -> zbus::fdo::Result<i32> {
      setting_int(self.manager.get(property)?)
   }

   fn set_int(&self, property: &str, value: i32) -> zbus::fdo::Result<()> {
      self
         .manager
         .set(property, SettingValue::Int(value.into()), ChangeOrigin::Bus)?;
      Ok(())
   }

   pub async fn notify_property(
      &self,
      name: &str,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match name {
         "UsePercentageForPolicy" => self.use_percentage_for_policy_changed(emitter).await,
         "LowTime" => self.low_time_changed(emitter).await,
         "DangerTime" => self.danger_time_changed(emitter).await,
         "CriticalTime" => self.critical_time_changed(emitter).await,
         "ActionTime" => self.action_time_changed(emitter).await,
         "LowPowerNotifyThreshold" => self.low_power_notify_threshold_changed(emitter).await,
         "LowPercentage" => self.low_percentage_changed(emitter).await,
         "DangerPercentage" => self.danger_percentage_changed(emitter).await,
         "CriticalPercentage" => self.critical_percentage_changed(emitter).await,
         "ActionPercentage" => self.action_percentage_changed(emitter).await,
         _ => Ok(()),
      }
   }
}

#[interface(name = "org.desktopd.Power.WarnLevelConfig")]
impl WarnLevelService {
   async fn reset(&self) {
      self.manager.reset();
   }

   #[zbus(property)]
   async fn use_percentage_for_policy(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.manager.get("UsePercentageForPolicy")?)
   }

   #[zbus(property)]
   async fn set_use_percentage_for_policy(&self, value: bool) -> zbus::fdo::Result<()> {
      self.manager.set(
         "UsePercentageForPolicy",
         SettingValue::Bool(value),
         ChangeOrigin::Bus,
      )?;
      Ok(())
   }

   #[zbus(property)]
   async fn low_time(&self) -> zbus::fdo::Result<i32> {
      self.int("LowTime")
   }

   #[zbus(property)]
   async fn set_low_time(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("LowTime", value)
   }

   #[zbus(property)]
   async fn danger_time(&self) -> zbus::fdo::Result<i32> {
      self.int("DangerTime")
   }

   #[zbus(property)]
   async fn set_danger_time(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("DangerTime", value)
   }

   #[zbus(property)]
   async fn critical_time(&self) -> zbus::fdo::Result<i32> {
      self.int("CriticalTime")
   }

   #[zbus(property)]
   async fn set_critical_time(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("CriticalTime", value)
   }

   #[zbus(property)]
   async fn action_time(&self) -> zbus::fdo::Result<i32> {
      self.int("ActionTime")
   }

   #[zbus(property)]
   async fn set_action_time(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("ActionTime", value)
   }

   #[zbus(property)]
   async fn low_power_notify_threshold(&self) -> zbus::fdo::Result<i32> {
      self.int("LowPowerNotifyThreshold")
   }

   #[zbus(property)]
   async fn set_low_power_notify_threshold(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("LowPowerNotifyThreshold", value)
   }

   #[zbus(property)]
   async fn low_percentage(&self) -> zbus::fdo::Result<i32> {
      self.int("LowPercentage")
   }

   #[zbus(property)]
   async fn set_low_percentage(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("LowPercentage", value)
   }

   #[zbus(property)]
   async fn danger_percentage(&self) -> zbus::fdo::Result<i32> {
      self.int("DangerPercentage")
   }

   #[zbus(property)]
   async fn set_danger_percentage(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("DangerPercentage", value)
   }

   #[zbus(property)]
   async fn critical_percentage(&self) -> zbus::fdo::Result<i32> {
      self.int("CriticalPercentage")
   }

   #[zbus(property)]
   async fn set_critical_percentage(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("CriticalPercentage", value)
   }

   #[zbus(property)]
   async fn action_percentage(&self) -> zbus::fdo::Result<i32> {
      self.int("ActionPercentage")
   }

   #[zbus(property)]
   async fn set_action_percentage(&self, value: i32) -> zbus::fdo::Result<()> {
      self.set_int("ActionPercentage", value)
   }
}
