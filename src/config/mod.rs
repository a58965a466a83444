//! Configuration management for Peripheral GW
//!
//! Handles loading, parsing, validation and hot-reloading of YAML configuration files.

pub mod watcher;

use anyhow::{Context, Result};
use schemars::schema::RootSchema;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tokio::fs;

pub use watcher::ConfigWatcher;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub manager: ManagerSettings,
    /// Device id -> device configuration. Ordered so iteration is stable.
    #[serde(default)]
    pub devices: BTreeMap<String, DeviceConfig>,
}

/// Timing knobs for the device manager
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Period of the reconciliation pass that recreates missing devices
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
    /// Upper bound for a single device's `init()`
    #[serde(default = "default_init_timeout")]
    pub init_timeout_ms: u64,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            refresh_interval_ms: default_refresh_interval(),
            init_timeout_ms: default_init_timeout(),
        }
    }
}

impl ManagerSettings {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh_interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }
}

/// Per-device configuration, tagged by integration type
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DeviceConfig {
    Http(HttpDeviceConfig),
    Midi(MidiDeviceConfig),
    StreamDeck(StreamDeckConfig),
    XKeys(XKeysConfig),
}

impl DeviceConfig {
    pub fn kind(&self) -> DeviceKind {
        match self {
            DeviceConfig::Http(_) => DeviceKind::Http,
            DeviceConfig::Midi(_) => DeviceKind::Midi,
            DeviceConfig::StreamDeck(_) => DeviceKind::StreamDeck,
            DeviceConfig::XKeys(_) => DeviceKind::XKeys,
        }
    }
}

/// Device family tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Http,
    Midi,
    StreamDeck,
    XKeys,
}

impl DeviceKind {
    pub const ALL: [DeviceKind; 4] = [
        DeviceKind::Http,
        DeviceKind::Midi,
        DeviceKind::StreamDeck,
        DeviceKind::XKeys,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Http => "http",
            DeviceKind::Midi => "midi",
            DeviceKind::StreamDeck => "streamdeck",
            DeviceKind::XKeys => "xkeys",
        }
    }

    /// JSON schema describing the fields accepted for this device type
    pub fn manifest(&self) -> RootSchema {
        match self {
            DeviceKind::Http => schemars::schema_for!(HttpDeviceConfig),
            DeviceKind::Midi => schemars::schema_for!(MidiDeviceConfig),
            DeviceKind::StreamDeck => schemars::schema_for!(StreamDeckConfig),
            DeviceKind::XKeys => schemars::schema_for!(XKeysConfig),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration manifests for every known device type, keyed by type tag
pub fn config_manifests() -> BTreeMap<DeviceKind, RootSchema> {
    DeviceKind::ALL
        .iter()
        .map(|kind| (*kind, kind.manifest()))
        .collect()
}

/// HTTP endpoint polled for trigger events
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct HttpDeviceConfig {
    /// URL returning a JSON array of trigger events
    pub url: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Optional URL receiving feedback (POST) and clear requests (DELETE)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_url: Option<String>,
    /// Consecutive failed polls before the device is considered dead
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "default_http_timeout")]
    pub request_timeout_ms: u64,
}

/// MIDI controller (port names are substring matches)
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct MidiDeviceConfig {
    pub input_port: String,
    /// Output port used for LED feedback; feedback is dropped when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_port: Option<String>,
}

/// Elgato Stream Deck panel
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct StreamDeckConfig {
    /// Serial number to bind to; the first Stream Deck found otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,
    /// Panel brightness in percent (0-100)
    #[serde(default = "default_brightness")]
    pub brightness: u8,
}

/// P.I. Engineering X-Keys panel
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct XKeysConfig {
    /// USB product id to bind to; the first X-Keys panel found otherwise
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    /// Number of button columns reported by the panel
    #[serde(default = "default_xkeys_columns")]
    pub columns: u8,
}

impl AppConfig {
    /// Load configuration from file with validation
    pub async fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path))?;

        Self::from_yaml(&contents).with_context(|| format!("Invalid config file: {}", path))
    }

    /// Parse and validate configuration from a YAML string
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: AppConfig =
            serde_yaml::from_str(contents).context("Failed to parse YAML config")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration for correctness and consistency
    pub fn validate(&self) -> Result<()> {
        if self.manager.refresh_interval_ms == 0 {
            anyhow::bail!("manager.refresh_interval_ms must be greater than 0");
        }
        if self.manager.init_timeout_ms == 0 {
            anyhow::bail!("manager.init_timeout_ms must be greater than 0");
        }

        for (device_id, device) in &self.devices {
            if device_id.trim().is_empty() {
                anyhow::bail!("Device id cannot be empty");
            }
            validate_device(device)
                .with_context(|| format!("Invalid {} device '{}'", device.kind(), device_id))?;
        }

        Ok(())
    }
}

fn validate_device(device: &DeviceConfig) -> Result<()> {
    match device {
        DeviceConfig::Http(http) => {
            if !(http.url.starts_with("http://") || http.url.starts_with("https://")) {
                anyhow::bail!("url '{}' must start with http:// or https://", http.url);
            }
            if let Some(feedback_url) = &http.feedback_url {
                if !(feedback_url.starts_with("http://") || feedback_url.starts_with("https://")) {
                    anyhow::bail!(
                        "feedback_url '{}' must start with http:// or https://",
                        feedback_url
                    );
                }
            }
            if http.poll_interval_ms == 0 {
                anyhow::bail!("poll_interval_ms must be greater than 0");
            }
            if http.max_failures == 0 {
                anyhow::bail!("max_failures must be at least 1");
            }
        }
        DeviceConfig::Midi(midi) => {
            if midi.input_port.is_empty() {
                anyhow::bail!("input_port cannot be empty");
            }
            if matches!(&midi.output_port, Some(port) if port.is_empty()) {
                anyhow::bail!("output_port cannot be empty when set");
            }
        }
        DeviceConfig::StreamDeck(deck) => {
            if deck.brightness > 100 {
                anyhow::bail!("brightness {} is invalid (must be 0-100)", deck.brightness);
            }
        }
        DeviceConfig::XKeys(xkeys) => {
            if xkeys.columns == 0 || xkeys.columns > 16 {
                anyhow::bail!("columns {} is invalid (must be 1-16)", xkeys.columns);
            }
        }
    }
    Ok(())
}

// Default value functions
fn default_refresh_interval() -> u64 { 5000 }
fn default_init_timeout() -> u64 { 10_000 }
fn default_poll_interval() -> u64 { 1000 }
fn default_max_failures() -> u32 { 3 }
fn default_http_timeout() -> u64 { 2000 }
fn default_brightness() -> u8 { 70 }
fn default_xkeys_columns() -> u8 { 4 }
