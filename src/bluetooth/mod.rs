//! Bluetooth adapter and device management on top of BlueZ.
//!
//! [`manager::BluetoothManager`] mirrors every adapter and device into
//! property stores, arbitrates discovery and pending connections, and
//! forwards pairing and OBEX transfers to the shell.

pub mod adapter;
pub mod agent;
pub mod device;
pub mod manager;
pub mod obex;
pub mod remote;

#[cfg(test)]
pub mod testing;
