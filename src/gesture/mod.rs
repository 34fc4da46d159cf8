//! Gesture dispatch.

pub mod builtin;
pub mod daemon;
pub mod info;
pub mod manager;
pub mod screen;
pub mod x11;
