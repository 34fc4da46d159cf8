//! Gesture table.
//!
//! The table is a JSON array of `{Name, Direction, Fingers, Action}` records,
//! read once at startup and written back wholesale on every update.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::Result;

/// Reserved name of the synthetic long-press entries.
pub const TOUCH_RIGHT_BUTTON: &str = "touch right button";

/// How an action payload is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum ActionKind {
   /// `xdotool key <payload>`.
   Shortcut,
   /// `/bin/sh -c <payload>`.
   Commandline,
   /// A named entry of the built-in registry.
   Builtin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionInfo {
   /// Kept as text so an unknown kind only fails the gesture using it.
   #[serde(rename = "Type")]
   pub kind: String,
   #[serde(rename = "Action")]
   pub action: String,
}

impl ActionInfo {
   pub fn new(kind: ActionKind, action: impl Into<String>) -> Self {
      Self {
         kind: kind.to_string(),
         action: action.into(),
      }
   }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GestureInfo {
   pub name: String,
   pub direction: String,
   pub fingers: i32,
   pub action: ActionInfo,
}

impl GestureInfo {
   pub fn matches(&self, name: &str, direction: &str, fingers: i32) -> bool {
      self.name == name && self.direction == direction && self.fingers == fingers
   }

   pub fn is_touch_right_button(&self) -> bool {
      self.name == TOUCH_RIGHT_BUTTON
   }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GestureInfos(Vec<GestureInfo>);

impl GestureInfos {
   pub fn new(infos: Vec<GestureInfo>) -> Self {
      Self(infos)
   }

   pub fn from_json(json: &str) -> Result<Self> {
      Ok(serde_json::from_str(json)?)
   }

   pub fn load(path: &Path) -> Result<Self> {
      Self::from_json(&fs::read_to_string(path)?)
   }

   pub fn to_json(&self) -> Result<String> {
      Ok(serde_json::to_string(self)?)
   }

   /// Writes the whole table to `path`, creating parent directories.
   pub fn save(&self, path: &Path) -> Result<()> {
      if let Some(parent) = path.parent() {
         fs::create_dir_all(parent)?;
      }
      fs::write(path, self.to_json()?)?;
      Ok(())
   }

   pub fn get(&self, name: &str, direction: &str, fingers: i32) -> Option<&GestureInfo> {
      self.0.iter().find(|i| i.matches(name, direction, fingers))
   }

   pub fn iter(&self) -> impl Iterator<Item = &GestureInfo> {
      self.0.iter()
   }

   pub fn len(&self) -> usize {
      self.0.len()
   }

   pub fn is_empty(&self) -> bool {
      self.0.is_empty()
   }

   /// Appends the long-press right button entries unless already present.
   pub fn with_touch_right_button(mut self) -> Self {
      for (direction, command) in [("down", "xdotool mousedown 3"), ("up", "xdotool mouseup 3")] {
         if self.get(TOUCH_RIGHT_BUTTON, direction, 0).is_none() {
            self.0.push(GestureInfo {
               name: TOUCH_RIGHT_BUTTON.to_string(),
               direction: direction.to_string(),
               fingers: 0,
               action: ActionInfo::new(ActionKind::Commandline, command),
            });
         }
      }
      self
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   const TABLE: &str = r#"[
      {"Name":"swipe","Direction":"up","Fingers":3,"Action":{"Type":"builtin","Action":"ShowWindow"}},
      {"Name":"pinch","Direction":"in","Fingers":4,"Action":{"Type":"shortcut","Action":"super+d"}},
      {"Name":"tap","Direction":"none","Fingers":3,"Action":{"Type":"teleport","Action":"x"}}
   ]"#;

   #[test]
   fn test_lookup_is_exact_on_the_triple() {
      let infos = GestureInfos::from_json(TABLE).unwrap();
      assert_eq!(infos.len(), 3);
      assert_eq!(
         infos.get("swipe", "up", 3).unwrap().action.action,
         "ShowWindow"
      );
      assert!(infos.get("swipe", "up", 4).is_none());
      assert!(infos.get("swipe", "down", 3).is_none());
   }

   #[test]
   fn test_unknown_kind_survives_loading() {
      let infos = GestureInfos::from_json(TABLE).unwrap();
      let tap = infos.get("tap", "none", 3).unwrap();
      assert!(ActionKind::from_str(&tap.action.kind).is_err());
      assert_eq!(
         ActionKind::from_str("commandline").unwrap(),
         ActionKind::Commandline
      );
   }

   #[test]
   fn test_touch_right_button_entries_added_once() {
      let infos = GestureInfos::from_json(TABLE)
         .unwrap()
         .with_touch_right_button()
         .with_touch_right_button();
      assert_eq!(infos.len(), 5);
      let up = infos.get(TOUCH_RIGHT_BUTTON, "up", 0).unwrap();
      assert_eq!(up.action, ActionInfo::new(ActionKind::Commandline, "xdotool mouseup 3"));
   }

   #[test]
   fn test_save_writes_whole_table() {
      let dir = tempfile::tempdir().unwrap();
      let path = dir.path().join("nested/gesture.json");
      let infos = GestureInfos::from_json(TABLE).unwrap();
      infos.save(&path).unwrap();
      assert_eq!(GestureInfos::load(&path).unwrap(), infos);
   }
}
