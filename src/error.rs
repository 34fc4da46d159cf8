//! Error types for the desktop daemons.
//!
//! Every subsystem reports failures through [`DaemonError`]. Errors that reach
//! a D-Bus method call are converted into `zbus::fdo::Error` at the interface
//! boundary; errors on background paths (signal callbacks, timers) are only
//! logged.

use smol_str::SmolStr;
use thiserror::Error;

/// Main error type for the daemons.
#[derive(Error, Debug)]
pub enum DaemonError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus call failed: {0}")]
   DBusCall(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Adapter not found: {0}")]
   AdapterNotFound(SmolStr),

   #[error("Device not found: {0}")]
   DeviceNotFound(SmolStr),

   #[error("Session not found: {0}")]
   SessionNotFound(SmolStr),

   #[error("Invalid object path: {0}")]
   InvalidPath(SmolStr),

   #[error("'{0}' is powered off")]
   AdapterPoweredOff(SmolStr),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Files is empty")]
   EmptyFileList,

   #[error("Transfer session does not exist: {0}")]
   TransferNotFound(SmolStr),

   #[error("No pending agent request for {0}")]
   NoPendingRequest(SmolStr),

   #[error("Agent request was rejected")]
   RequestRejected,

   #[error("Invalid passkey: {0}")]
   InvalidPasskey(u32),

   #[error("Gesture not found: {name}, {direction}, {fingers}")]
   GestureNotFound {
      name: String,
      direction: String,
      fingers: i32,
   },

   #[error("Invalid action type: {0}")]
   InvalidActionKind(String),

   #[error("Invalid built-in action: {0}")]
   InvalidBuiltin(String),

   #[error("Another process grabbed the keyboard")]
   KeyboardGrabbed,

   #[error("Command failed: {0}")]
   CommandFailed(String),

   #[error("No touchscreen")]
   NoTouchscreen,

   #[error("X11 error: {0}")]
   X11(String),

   #[error("Feature not supported: {0}")]
   FeatureNotSupported(String),

   #[error("Unknown setting: {0}")]
   UnknownSetting(String),

   #[error("Setting {0} has a different type")]
   SettingType(String),

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("Manager has been shut down")]
   ManagerShutdown,
}

/// Convenience type alias for Results with `DaemonError`.
pub type Result<T> = std::result::Result<T, DaemonError>;

impl From<DaemonError> for zbus::fdo::Error {
   fn from(err: DaemonError) -> Self {
      match err {
         DaemonError::DBusCall(e) => e,
         DaemonError::InvalidPath(_)
         | DaemonError::InvalidPasskey(_)
         | DaemonError::EmptyFileList
         | DaemonError::UnknownSetting(_)
         | DaemonError::SettingType(_) => Self::InvalidArgs(err.to_string()),
         _ => Self::Failed(err.to_string()),
      }
   }
}
