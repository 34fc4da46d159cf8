//! Touchpad backend driving libinput properties through `xinput`.

use std::sync::Arc;

use async_trait::async_trait;

use crate::{
   error::{DaemonError, Result},
   input::touchpad::{TouchpadBackend, TouchpadInfo, TouchpadSetting},
   process::CommandRunner,
};

pub struct XinputBackend {
   runner: Arc<dyn CommandRunner>,
}

impl XinputBackend {
   pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
      Self { runner }
   }

   async fn set_prop(&self, device: &TouchpadInfo, prop: &str, values: &[String]) -> Result<()> {
      let id = device.id.to_string();
      let mut args = vec!["set-prop", id.as_str(), prop];
      args.extend(values.iter().map(String::as_str));
      self.runner.run("xinput", &args).await.map(|_| ())
   }
}

fn flag(enabled: bool) -> String {
   if enabled { "1" } else { "0" }.to_string()
}

/// Parses `xinput list --short`, keeping pointer slaves that look like
/// touchpads.
pub fn parse_touchpads(listing: &str) -> Vec<TouchpadInfo> {
   listing
      .lines()
      .filter(|line| line.contains("slave  pointer"))
      .filter_map(|line| {
         let (name, rest) = line.split_once("id=")?;
         let id = rest.split_whitespace().next()?.parse().ok()?;
         let name = name
            .trim_start_matches(|c: char| !c.is_alphanumeric())
            .trim()
            .to_string();
         let lower = name.to_lowercase();
         (lower.contains("touchpad") || lower.contains("trackpad")).then_some(TouchpadInfo { id, name })
      })
      .collect()
}

#[async_trait]
impl TouchpadBackend for XinputBackend {
   async fn touchpads(&self) -> Result<Vec<TouchpadInfo>> {
      let listing = self.runner.run("xinput", &["list", "--short"]).await?;
      Ok(parse_touchpads(&listing))
   }

   async fn configure(&self, device: &TouchpadInfo, setting: &TouchpadSetting) -> Result<()> {
      match *setting {
         TouchpadSetting::Enabled(v) => self.set_prop(device, "Device Enabled", &[flag(v)]).await,
         TouchpadSetting::LeftHanded(v) => {
            self
               .set_prop(device, "libinput Left Handed Enabled", &[flag(v)])
               .await
         },
         TouchpadSetting::NaturalScroll(v) => {
            self
               .set_prop(device, "libinput Natural Scrolling Enabled", &[flag(v)])
               .await
         },
         TouchpadSetting::EdgeScroll(v) => {
            let values = [flag(!v), flag(v), flag(false)];
            self
               .set_prop(device, "libinput Scroll Method Enabled", &values)
               .await
         },
         TouchpadSetting::TwoFingerScroll { horiz, .. } => {
            self
               .set_prop(device, "libinput Horizontal Scroll Enabled", &[flag(horiz)])
               .await
         },
         TouchpadSetting::TapClick(v) => {
            self
               .set_prop(device, "libinput Tapping Enabled", &[flag(v)])
               .await
         },
         TouchpadSetting::MotionAcceleration(v) => {
            let speed = v.clamp(-1.0, 1.0);
            self
               .set_prop(device, "libinput Accel Speed", &[format!("{speed:.2}")])
               .await
         },
         TouchpadSetting::DisableWhileTyping(v) => {
            self
               .set_prop(device, "libinput Disable While Typing Enabled", &[flag(v)])
               .await
         },
         _ => Err(DaemonError::FeatureNotSupported(format!(
            "{setting:?} on {}",
            device.name
         ))),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::process::testing::RecordingRunner;

   const LISTING: &str = "\
⎡ Virtual core pointer                    \tid=2\t[master pointer  (3)]
⎜   ↳ Virtual core XTEST pointer              \tid=4\t[slave  pointer  (2)]
⎜   ↳ SynPS/2 Synaptics TouchPad              \tid=12\t[slave  pointer  (2)]
⎜   ↳ Logitech USB Receiver Mouse             \tid=9\t[slave  pointer  (2)]
⎣ Virtual core keyboard                   \tid=3\t[master keyboard (2)]
    ↳ AT Translated Set 2 keyboard            \tid=13\t[slave  keyboard (3)]";

   #[test]
   fn test_parse_touchpads() {
      assert_eq!(parse_touchpads(LISTING), vec![TouchpadInfo {
         id: 12,
         name: "SynPS/2 Synaptics TouchPad".into(),
      }]);
   }

   #[tokio::test]
   async fn test_tapping_prop() {
      let runner = RecordingRunner::new();
      let backend = XinputBackend::new(runner.clone());
      let device = TouchpadInfo {
         id: 12,
         name: "pad".into(),
      };
      backend
         .configure(&device, &TouchpadSetting::TapClick(true))
         .await
         .unwrap();
      assert!(
         backend
            .configure(&device, &TouchpadSetting::PalmDetect(true))
            .await
            .is_err()
      );
      assert_eq!(runner.calls(), vec!["xinput set-prop 12 libinput Tapping Enabled 1"]);
   }
}
