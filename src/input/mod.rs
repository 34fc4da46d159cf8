//! Input device configuration.

pub mod touchpad;
pub mod xinput;
