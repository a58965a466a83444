//! Device construction from configuration entries

use anyhow::Result;
use std::sync::Arc;

use crate::config::DeviceConfig;
use crate::devices::{Device, HttpDevice, MidiDevice, StreamDeckDevice, XKeysDevice};

/// Builds (but does not initialize) a device for one configuration entry
pub trait DeviceFactory: Send + Sync {
    fn create(&self, device_id: &str, config: &DeviceConfig) -> Result<Arc<dyn Device>>;
}

/// Factory for the built-in hardware and network integrations
#[derive(Debug, Default, Clone, Copy)]
pub struct IntegrationFactory;

impl DeviceFactory for IntegrationFactory {
    fn create(&self, device_id: &str, config: &DeviceConfig) -> Result<Arc<dyn Device>> {
        let device: Arc<dyn Device> = match config {
            DeviceConfig::Http(cfg) => Arc::new(HttpDevice::new(device_id, cfg.clone())?),
            DeviceConfig::Midi(cfg) => Arc::new(MidiDevice::new(device_id, cfg.clone())),
            DeviceConfig::StreamDeck(cfg) => Arc::new(StreamDeckDevice::new(device_id, cfg.clone())),
            DeviceConfig::XKeys(cfg) => Arc::new(XKeysDevice::new(device_id, cfg.clone())),
        };
        Ok(device)
    }
}
