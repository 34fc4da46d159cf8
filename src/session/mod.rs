//! Session activity watching.

pub mod login1;
pub mod watcher;

/// Answers whether the user's session is the foreground one.
pub trait SessionGate: Send + Sync {
   fn is_active(&self) -> bool;
}
