//! MIDI controller integration
//!
//! Note-on and control-change messages become triggers (`note:<ch>:<note>`,
//! `cc:<ch>:<cc>`, channels 1-based). Feedback lights the matching note/CC on
//! the optional output port.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Device, DeviceEvents, TriggerEvent};
use crate::config::{DeviceKind, MidiDeviceConfig};
use crate::feedback::Feedback;
use crate::midi::{find_port_by_substring, format_hex, MidiMessage};

/// How often the input port is checked for disappearance
const PORT_WATCH_INTERVAL: Duration = Duration::from_secs(2);

/// Addressable MIDI control (channel is 1-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MidiControl {
    Note { channel: u8, note: u8 },
    Cc { channel: u8, cc: u8 },
}

impl MidiControl {
    /// Message that sets this control to `value` (0 = off)
    fn message(&self, value: u8) -> MidiMessage {
        match *self {
            MidiControl::Note { channel, note } => MidiMessage::NoteOn {
                channel: channel - 1,
                note,
                velocity: value.min(127),
            },
            MidiControl::Cc { channel, cc } => MidiMessage::ControlChange {
                channel: channel - 1,
                cc,
                value: value.min(127),
            },
        }
    }
}

impl fmt::Display for MidiControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MidiControl::Note { channel, note } => write!(f, "note:{}:{}", channel, note),
            MidiControl::Cc { channel, cc } => write!(f, "cc:{}:{}", channel, cc),
        }
    }
}

impl FromStr for MidiControl {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let (Some(kind), Some(channel), Some(number), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            bail!("invalid MIDI trigger id '{}'", s);
        };

        let channel: u8 = channel
            .parse()
            .with_context(|| format!("invalid channel in trigger id '{}'", s))?;
        if !(1..=16).contains(&channel) {
            bail!("channel {} out of range in trigger id '{}' (must be 1-16)", channel, s);
        }
        let number: u8 = number
            .parse()
            .with_context(|| format!("invalid number in trigger id '{}'", s))?;
        if number > 127 {
            bail!("number {} out of range in trigger id '{}' (must be 0-127)", number, s);
        }

        match kind {
            "note" => Ok(MidiControl::Note { channel, note: number }),
            "cc" => Ok(MidiControl::Cc { channel, cc: number }),
            other => bail!("unknown MIDI control kind '{}' in trigger id '{}'", other, s),
        }
    }
}

/// Map an incoming message to a trigger, if it is a discrete input
pub fn trigger_for_message(msg: &MidiMessage) -> Option<TriggerEvent> {
    match *msg {
        MidiMessage::NoteOn { channel, note, velocity } => Some(
            TriggerEvent::new(MidiControl::Note { channel: channel + 1, note }.to_string())
                .with_argument("velocity", velocity),
        ),
        MidiMessage::ControlChange { channel, cc, value } => Some(
            TriggerEvent::new(MidiControl::Cc { channel: channel + 1, cc }.to_string())
                .with_argument("value", value)
                .replacing_previous(),
        ),
        _ => None,
    }
}

/// LED value (0-127) for `color`/`off` payloads; other payloads have no LED mapping
fn feedback_value(feedback: &Feedback) -> Option<u8> {
    match feedback {
        Feedback::Color(color) => Some(color.brightness() / 2),
        Feedback::Off => Some(0),
        Feedback::Text { .. } | Feedback::Image { .. } => None,
    }
}

/// MIDI controller device
pub struct MidiDevice {
    id: String,
    config: MidiDeviceConfig,
    events: Arc<DeviceEvents>,

    midi_in: Mutex<Option<MidiInputConnection<()>>>,
    midi_out: Mutex<Option<MidiOutputConnection>>,

    /// Controls currently lit, so they can be cleared
    lit: Mutex<BTreeSet<MidiControl>>,
    port_watch: Mutex<Option<JoinHandle<()>>>,
}

// All port handles sit behind mutexes and are only touched through them
unsafe impl Send for MidiDevice {}
unsafe impl Sync for MidiDevice {}

impl MidiDevice {
    pub fn new(id: impl Into<String>, config: MidiDeviceConfig) -> Self {
        Self {
            id: id.into(),
            config,
            events: Arc::new(DeviceEvents::new()),
            midi_in: Mutex::new(None),
            midi_out: Mutex::new(None),
            lit: Mutex::new(BTreeSet::new()),
            port_watch: Mutex::new(None),
        }
    }

    fn open_input(&self) -> Result<MidiInputConnection<()>> {
        let midi_in = MidiInput::new(&format!("peripheral-gw-{}-in", self.id))?;
        let port = find_port_by_substring(&midi_in, &self.config.input_port)
            .ok_or_else(|| anyhow!("MIDI input port '{}' not found", self.config.input_port))?;

        let events = self.events.clone();
        let device_id = self.id.clone();

        midi_in
            .connect(
                &port,
                &format!("peripheral-gw-{}", self.config.input_port),
                move |_timestamp, data, _| {
                    trace!("MIDI RX [{}] {}", device_id, format_hex(data));
                    if let Some(trigger) = MidiMessage::parse(data).as_ref().and_then(trigger_for_message) {
                        events.emit_trigger(trigger);
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("Failed to open MIDI input '{}': {}", self.config.input_port, e))
    }

    fn open_output(&self, port_name: &str) -> Result<MidiOutputConnection> {
        let midi_out = MidiOutput::new(&format!("peripheral-gw-{}-out", self.id))?;
        let port = find_port_by_substring(&midi_out, port_name)
            .ok_or_else(|| anyhow!("MIDI output port '{}' not found", port_name))?;

        midi_out
            .connect(&port, &format!("peripheral-gw-{}", port_name))
            .map_err(|e| anyhow!("Failed to open MIDI output '{}': {}", port_name, e))
    }

    /// Emit an error once the input port disappears (midir reports no disconnects)
    fn spawn_port_watch(&self) -> JoinHandle<()> {
        let events = self.events.clone();
        let port_name = self.config.input_port.clone();
        let client_name = format!("peripheral-gw-{}-watch", self.id);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PORT_WATCH_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let client_name = client_name.clone();
                let wanted = port_name.clone();
                // Port enumeration talks to the OS MIDI service and may block
                let present = tokio::task::spawn_blocking(move || {
                    MidiInput::new(&client_name)
                        .map(|midi_in| find_port_by_substring(&midi_in, &wanted).is_some())
                        .unwrap_or(false)
                })
                .await
                .unwrap_or(false);
                if !present {
                    events.emit_error(anyhow!("MIDI input port '{}' disappeared", port_name));
                    break;
                }
            }
        })
    }

    fn send(&self, control: MidiControl, value: u8) -> Result<()> {
        let mut midi_out = self.midi_out.lock();
        let Some(conn) = midi_out.as_mut() else {
            trace!("MIDI feedback skipped for '{}' (no output port)", self.id);
            return Ok(());
        };

        let bytes = control.message(value).encode();
        trace!("MIDI TX [{}] {}", self.id, format_hex(&bytes));
        conn.send(&bytes)
            .map_err(|e| anyhow!("MIDI send to '{}' failed: {}", self.id, e))?;

        let mut lit = self.lit.lock();
        if value > 0 {
            lit.insert(control);
        } else {
            lit.remove(&control);
        }
        Ok(())
    }
}

#[async_trait]
impl Device for MidiDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Midi
    }

    fn events(&self) -> &DeviceEvents {
        &self.events
    }

    async fn init(&self) -> Result<()> {
        debug!(
            "Initializing MIDI device '{}': in='{}' out={:?}",
            self.id, self.config.input_port, self.config.output_port
        );

        let output = match &self.config.output_port {
            Some(port) => Some(self.open_output(port)?),
            None => None,
        };
        let input = self.open_input()?;

        *self.midi_out.lock() = output;
        *self.midi_in.lock() = Some(input);

        self.events.activate()?;
        *self.port_watch.lock() = Some(self.spawn_port_watch());

        debug!("MIDI device '{}' active", self.id);
        Ok(())
    }

    async fn set_feedback(&self, trigger_id: &str, feedback: &Feedback) -> Result<()> {
        let control: MidiControl = trigger_id.parse()?;
        match feedback_value(feedback) {
            Some(value) => self.send(control, value),
            None => {
                trace!("MIDI device '{}' ignores non-LED feedback for {}", self.id, control);
                Ok(())
            }
        }
    }

    async fn clear_feedback_all(&self) -> Result<()> {
        let lit: Vec<MidiControl> = self.lit.lock().iter().copied().collect();
        for control in lit {
            if let Err(e) = self.send(control, 0) {
                warn!("Failed to clear {} on '{}': {}", control, self.id, e);
            }
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        if let Some(watch) = self.port_watch.lock().take() {
            watch.abort();
        }
        let input = self.midi_in.lock().take();
        let output = self.midi_out.lock().take();
        if input.is_some() || output.is_some() {
            debug!("MIDI device '{}' closed", self.id);
        }
        self.lit.lock().clear();
        self.events.detach_all();
        Ok(())
    }
}
