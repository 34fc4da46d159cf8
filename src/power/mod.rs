//! Power management settings.

pub mod warn_level;
