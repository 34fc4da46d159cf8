use std::sync::Arc;

use zbus::{interface, object_server::SignalEmitter};

use crate::{
   dbus::{setting_bool, setting_double, setting_int},
   input::touchpad::Touchpad,
   settings::{ChangeOrigin, SettingValue},
};

pub struct TouchpadService {
   touchpad: Arc<Touchpad>,
}

impl TouchpadService {
   pub const fn new(touchpad: Arc<Touchpad>) -> Self {
      Self { touchpad }
   }

   fn store(&self, property: &str, value: SettingValue) -> zbus::fdo::Result<()> {
      self.touchpad.set(property, value, ChangeOrigin::Bus)?;
      Ok(())
   }

   pub async fn notify_property(
      &self,
      name: &str,
      emitter: &SignalEmitter<'_>,
   ) -> zbus::Result<()> {
      match name {
         "Exist" => self.exist_changed(emitter).await,
         "DeviceList" => self.device_list_changed(emitter).await,
         "TPadEnable" => self.t_pad_enable_changed(emitter).await,
         "LeftHanded" => self.left_handed_changed(emitter).await,
         "DisableIfTyping" => self.disable_if_typing_changed(emitter).await,
         "NaturalScroll" => self.natural_scroll_changed(emitter).await,
         "EdgeScroll" => self.edge_scroll_changed(emitter).await,
         "HorizScroll" => self.horiz_scroll_changed(emitter).await,
         "VertScroll" => self.vert_scroll_changed(emitter).await,
         "TapClick" => self.tap_click_changed(emitter).await,
         "PalmDetect" => self.palm_detect_changed(emitter).await,
         "MotionAcceleration" => self.motion_acceleration_changed(emitter).await,
         "MotionThreshold" => self.motion_threshold_changed(emitter).await,
         "MotionScaling" => self.motion_scaling_changed(emitter).await,
         "DoubleClick" => self.double_click_changed(emitter).await,
         "DragThreshold" => self.drag_threshold_changed(emitter).await,
         "DeltaScroll" => self.delta_scroll_changed(emitter).await,
         "PalmMinWidth" => self.palm_min_width_changed(emitter).await,
         "PalmMinZ" => self.palm_min_z_changed(emitter).await,
         _ => Ok(()),
      }
   }
}

#[interface(name = "org.desktopd.InputDevice.Touchpad")]
impl TouchpadService {
   async fn reset(&self) {
      self.touchpad.reset();
   }

   #[zbus(property)]
   async fn exist(&self) -> bool {
      self.touchpad.exist()
   }

   #[zbus(property)]
   async fn device_list(&self) -> String {
      self.touchpad.device_list()
   }

   #[zbus(property, name = "TPadEnable")]
   async fn tpad_enable(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("TPadEnable")?)
   }

   #[zbus(property, name = "TPadEnable")]
   async fn set_tpad_enable(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("TPadEnable", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn left_handed(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("LeftHanded")?)
   }

   #[zbus(property)]
   async fn set_left_handed(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("LeftHanded", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn disable_if_typing(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("DisableIfTyping")?)
   }

   #[zbus(property)]
   async fn set_disable_if_typing(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("DisableIfTyping", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn natural_scroll(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("NaturalScroll")?)
   }

   #[zbus(property)]
   async fn set_natural_scroll(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("NaturalScroll", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn edge_scroll(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("EdgeScroll")?)
   }

   #[zbus(property)]
   async fn set_edge_scroll(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("EdgeScroll", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn horiz_scroll(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("HorizScroll")?)
   }

   #[zbus(property)]
   async fn set_horiz_scroll(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("HorizScroll", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn vert_scroll(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("VertScroll")?)
   }

   #[zbus(property)]
   async fn set_vert_scroll(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("VertScroll", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn tap_click(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("TapClick")?)
   }

   #[zbus(property)]
   async fn set_tap_click(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("TapClick", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn palm_detect(&self) -> zbus::fdo::Result<bool> {
      setting_bool(self.touchpad.get("PalmDetect")?)
   }

   #[zbus(property)]
   async fn set_palm_detect(&self, value: bool) -> zbus::fdo::Result<()> {
      self.store("PalmDetect", SettingValue::Bool(value))
   }

   #[zbus(property)]
   async fn motion_acceleration(&self) -> zbus::fdo::Result<f64> {
      setting_double(self.touchpad.get("MotionAcceleration")?)
   }

   #[zbus(property)]
   async fn set_motion_acceleration(&self, value: f64) -> zbus::fdo::Result<()> {
      self.store("MotionAcceleration", SettingValue::Double(value))
   }

   #[zbus(property)]
   async fn motion_threshold(&self) -> zbus::fdo::Result<f64> {
      setting_double(self.touchpad.get("MotionThreshold")?)
   }

   #[zbus(property)]
   async fn set_motion_threshold(&self, value: f64) -> zbus::fdo::Result<()> {
      self.store("MotionThreshold", SettingValue::Double(value))
   }

   #[zbus(property)]
   async fn motion_scaling(&self) -> zbus::fdo::Result<f64> {
      setting_double(self.touchpad.get("MotionScaling")?)
   }

   #[zbus(property)]
   async fn set_motion_scaling(&self, value: f64) -> zbus::fdo::Result<()> {
      self.store("MotionScaling", SettingValue::Double(value))
   }

   #[zbus(property)]
   async fn double_click(&self) -> zbus::fdo::Result<i32> {
      setting_int(self.touchpad.get("DoubleClick")?)
   }

   #[zbus(property)]
   async fn set_double_click(&self, value: i32) -> zbus::fdo::Result<()> {
      self.store("DoubleClick", SettingValue::Int(value.into()))
   }

   #[zbus(property)]
   async fn drag_threshold(&self) -> zbus::fdo::Result<i32> {
      setting_int(self.touchpad.get("DragThreshold")?)
   }

   #[zbus(property)]
   async fn set_drag_threshold(&self, value: i32) -> zbus::fdo::Result<()> {
      self.store("DragThreshold", SettingValue::Int(value.into()))
   }

   #[zbus(property)]
   async fn delta_scroll(&self) -> zbus::fdo::Result<i32> {
      setting_int(self.touchpad.get("DeltaScroll")?)
   }

   #[zbus(property)]
   async fn set_delta_scroll(&self, value: i32) -> zbus::fdo::Result<()> {
      self.store("DeltaScroll", SettingValue::Int(value.into()))
   }

   #[zbus(property)]
   async fn palm_min_width(&self) -> zbus::fdo::Result<i32> {
      setting_int(self.touchpad.get("PalmMinWidth")?)
   }

   #[zbus(property)]
   async fn set_palm_min_width(&self, value: i32) -> zbus::fdo::Result<()> {
      self.store("PalmMinWidth", SettingValue::Int(value.into()))
   }

   #[zbus(property)]
   async fn palm_min_z(&self) -> zbus::fdo::Result<i32> {
      setting_int(self.touchpad.get("PalmMinZ")?)
   }

   #[zbus(property)]
   async fn set_palm_min_z(&self, value: i32) -> zbus::fdo::Result<()> {
      self.store("PalmMinZ", SettingValue::Int(value.into()))
   }
}
