//! Device integrations (MIDI, HTTP, Stream Deck, X-Keys)
//!
//! Every integration implements [`Device`] and reports inputs through its
//! [`DeviceEvents`] channel. The manager subscribes to that channel before
//! calling `init()` and detaches exactly once at teardown.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::DeviceKind;
use crate::feedback::Feedback;

pub mod events;
pub mod hid;
pub mod http;
pub mod midi;
pub mod streamdeck;
pub mod xkeys;

pub use events::{DeviceEvents, ErrorCallback, TriggerCallback};
pub use http::HttpDevice;
pub use midi::MidiDevice;
pub use streamdeck::StreamDeckDevice;
pub use xkeys::XKeysDevice;

/// Scalar value attached to a trigger
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum ArgValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<u8> for ArgValue {
    fn from(value: u8) -> Self {
        ArgValue::Int(value as i64)
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Text(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Text(value)
    }
}

/// Discrete input reported by a device
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerEvent {
    pub trigger_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<BTreeMap<String, ArgValue>>,
    /// Supersedes any not-yet-delivered event for the same trigger
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replaces_previous: Option<bool>,
}

impl TriggerEvent {
    pub fn new(trigger_id: impl Into<String>) -> Self {
        Self {
            trigger_id: trigger_id.into(),
            arguments: None,
            replaces_previous: None,
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<ArgValue>) -> Self {
        self.arguments
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    pub fn replacing_previous(mut self) -> Self {
        self.replaces_previous = Some(true);
        self
    }
}

/// Device trait - all peripheral integrations implement this
///
/// Note: All methods take &self (not &mut self) to support Arc<dyn Device>.
/// Devices use interior mutability for their protocol handles.
#[async_trait]
pub trait Device: Send + Sync {
    /// Device family of this instance
    fn kind(&self) -> DeviceKind;

    /// Event channel the manager subscribes to
    fn events(&self) -> &DeviceEvents;

    /// Open the protocol connection. No events may be delivered before this succeeds.
    async fn init(&self) -> Result<()>;

    /// Send a feedback payload to one control. Failures do not kill the device.
    async fn set_feedback(&self, trigger_id: &str, feedback: &Feedback) -> Result<()>;

    /// Reset every feedback indicator to its default state
    async fn clear_feedback_all(&self) -> Result<()>;

    /// Release all resources and detach all listeners. Must be idempotent.
    ///
    /// Default implementation: only detaches listeners. Integrations holding
    /// resources override this and still call `self.events().detach_all()`.
    async fn destroy(&self) -> Result<()> {
        self.events().detach_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_trigger_event_wire_format() {
        let event = TriggerEvent::new("cc:1:7")
            .with_argument("value", 64u8)
            .replacing_previous();

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"triggerId": "cc:1:7", "arguments": {"value": 64}, "replacesPrevious": true})
        );

        let minimal: TriggerEvent = serde_json::from_value(json!({"triggerId": "t1"})).unwrap();
        assert_eq!(minimal, TriggerEvent::new("t1"));
    }

    #[test]
    fn test_argument_scalars() {
        let event: TriggerEvent = serde_json::from_value(json!({
            "triggerId": "t",
            "arguments": {"on": true, "n": 3, "x": 0.5, "label": "hi"}
        }))
        .unwrap();

        let args = event.arguments.unwrap();
        assert_eq!(args["on"], ArgValue::Bool(true));
        assert_eq!(args["n"], ArgValue::Int(3));
        assert_eq!(args["x"], ArgValue::Float(0.5));
        assert_eq!(args["label"], ArgValue::Text("hi".into()));
    }
}
