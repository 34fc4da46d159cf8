//! Built-in gesture actions.

use std::str::FromStr;

use async_trait::async_trait;
use strum::{AsRefStr, Display, EnumString};

use crate::error::{DaemonError, Result};

/// Window-manager capabilities the built-ins are made of.
#[async_trait]
pub trait WindowManager: Send + Sync {
   async fn toggle_maximize(&self) -> Result<()>;
   async fn minimize(&self) -> Result<()>;
   /// Moves to the next (or previous) workspace, wrapping around.
   async fn switch_workspace(&self, forward: bool) -> Result<()>;
   /// Sends a key chord to the window manager, e.g. `super+s`.
   async fn key(&self, keys: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString)]
pub enum Builtin {
   ShowWorkspace,
   ShowWindow,
   ShowAllWindow,
   ToggleMaximize,
   Minimize,
   SwitchApplication,
   ReverseSwitchApplication,
   SwitchWorkspace,
   ReverseSwitchWorkspace,
   SplitWindowLeft,
   SplitWindowRight,
}

impl Builtin {
   pub fn parse(name: &str) -> Result<Self> {
      Self::from_str(name).map_err(|_| DaemonError::InvalidBuiltin(name.to_string()))
   }

   pub async fn run(self, wm: &dyn WindowManager) -> Result<()> {
      match self {
         Self::ShowWorkspace => wm.key("super+s").await,
         Self::ShowWindow => wm.key("super+w").await,
         Self::ShowAllWindow => wm.key("super+a").await,
         Self::ToggleMaximize => wm.toggle_maximize().await,
         Self::Minimize => wm.minimize().await,
         Self::SwitchApplication => wm.key("alt+Tab").await,
         Self::ReverseSwitchApplication => wm.key("alt+shift+Tab").await,
         Self::SwitchWorkspace => wm.switch_workspace(true).await,
         Self::ReverseSwitchWorkspace => wm.switch_workspace(false).await,
         Self::SplitWindowLeft => wm.key("super+Left").await,
         Self::SplitWindowRight => wm.key("super+Right").await,
      }
   }
}


#[cfg(test)]
mod tests {
   use super::{testing::RecordingWm, *};

   #[tokio::test]
   async fn test_builtins_reach_the_window_manager() {
      let wm = RecordingWm::default();
      Builtin::parse("ReverseSwitchWorkspace")
         .unwrap()
         .run(&wm)
         .await
         .unwrap();
      Builtin::parse("ShowWorkspace").unwrap().run(&wm).await.unwrap();
      assert_eq!(*wm.calls.lock(), vec!["switch_workspace false", "key super+s"]);
   }

   #[test]
   fn test_unknown_builtin() {
      assert!(matches!(
         Builtin::parse("Levitate"),
         Err(DaemonError::InvalidBuiltin(name)) if name == "Levitate"
      ));
   }
}
