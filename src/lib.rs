//! Peripheral GW - device manager for control-surface peripherals
//!
//! Keeps a configured set of MIDI controllers, Stream Decks, X-Keys panels and
//! HTTP-polled endpoints alive, forwards their triggers and routes feedback back
//! to them.

pub mod config;
pub mod devices;
pub mod feedback;
pub mod manager;
pub mod midi;

pub use config::AppConfig;
pub use manager::{DeviceTrigger, Manager, ManagerError};
