//! P.I. Engineering X-Keys integration
//!
//! Button presses become `button:<n>` triggers, numbered column-major from 1
//! like the labels on the panel. Feedback drives the blue/red key backlights.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hidapi::HidDevice;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

use super::hid::{self, padded, HidSummary, ReportReader};
use super::{Device, DeviceEvents, TriggerEvent};
use crate::config::{DeviceKind, XKeysConfig};
use crate::feedback::Feedback;

pub const XKEYS_VENDOR_ID: u16 = 0x05f3;

const INPUT_REPORT_LEN: usize = 32;
const OUTPUT_REPORT_LEN: usize = 36;
/// Button bitmaps start after the unit id and a status byte
const BUTTON_OFFSET: usize = 2;
const ROWS: u8 = 8;

const CMD_BACKLIGHT: u8 = 0xB5;
const CMD_BACKLIGHT_ALL: u8 = 0xB6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Bank {
    Blue = 0,
    Red = 1,
}

/// Backlight state a feedback payload maps to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backlight {
    Off,
    Blue,
    Red,
}

impl Backlight {
    /// Backlight for `color`/`off` payloads; key displays are not supported
    pub fn for_feedback(feedback: &Feedback) -> Option<Self> {
        let color = match feedback {
            Feedback::Color(color) => *color,
            Feedback::Off => return Some(Backlight::Off),
            Feedback::Text { .. } | Feedback::Image { .. } => return None,
        };
        Some(if color.is_black() {
            Backlight::Off
        } else if color.r > color.g && color.r > color.b {
            Backlight::Red
        } else {
            Backlight::Blue
        })
    }
}

/// Button number (1-based) for a bit in the column bitmaps
pub fn button_index(column: u8, row: u8) -> u16 {
    column as u16 * ROWS as u16 + row as u16 + 1
}

fn parse_button(trigger_id: &str, columns: u8) -> Result<u16> {
    let button: u16 = trigger_id
        .strip_prefix("button:")
        .ok_or_else(|| anyhow!("invalid X-Keys trigger id '{}'", trigger_id))?
        .parse()
        .with_context(|| format!("invalid button number in '{}'", trigger_id))?;
    let max = columns as u16 * ROWS as u16;
    if button == 0 || button > max {
        bail!("button {} out of range (1..={})", button, max);
    }
    Ok(button)
}

/// Buttons that went down since the previous report
pub fn newly_pressed(previous: &mut [u8], report: &[u8]) -> Vec<u16> {
    let Some(bitmaps) = report.get(BUTTON_OFFSET..) else {
        return Vec::new();
    };

    let mut pressed = Vec::new();
    for (column, prev) in previous.iter_mut().enumerate() {
        let current = bitmaps.get(column).copied().unwrap_or(0);
        let rising = current & !*prev;
        for row in 0..ROWS {
            if rising & (1 << row) != 0 {
                pressed.push(button_index(column as u8, row));
            }
        }
        *prev = current;
    }
    pressed
}

fn matches(product_id: Option<u16>, summary: &HidSummary) -> bool {
    summary.vendor_id == XKEYS_VENDOR_ID && product_id.map_or(true, |pid| pid == summary.product_id)
}

/// Output report setting one key's backlight in one bank
pub fn backlight_report(button: u16, bank: Bank, on: bool, columns: u8) -> Vec<u8> {
    let offset = match bank {
        Bank::Blue => 0,
        Bank::Red => columns as u16 * ROWS as u16,
    };
    let index = (button - 1 + offset) as u8;
    padded(vec![0x00, CMD_BACKLIGHT, index, on as u8], OUTPUT_REPORT_LEN)
}

/// Output report switching a whole backlight bank
pub fn bank_report(bank: Bank, on: bool) -> Vec<u8> {
    let value = if on { 0xFF } else { 0x00 };
    padded(vec![0x00, CMD_BACKLIGHT_ALL, bank as u8, value], OUTPUT_REPORT_LEN)
}

/// X-Keys programmable keypad
pub struct XKeysDevice {
    id: String,
    config: XKeysConfig,
    events: Arc<DeviceEvents>,
    panel: Mutex<Option<(Arc<Mutex<HidDevice>>, ReportReader)>>,
}

impl XKeysDevice {
    pub fn new(id: impl Into<String>, config: XKeysConfig) -> Self {
        Self {
            id: id.into(),
            config,
            events: Arc::new(DeviceEvents::new()),
            panel: Mutex::new(None),
        }
    }

    async fn write(&self, reports: Vec<Vec<u8>>) -> Result<()> {
        let handle = self
            .panel
            .lock()
            .as_ref()
            .map(|(handle, _)| handle.clone())
            .ok_or_else(|| anyhow!("X-Keys '{}' is not connected", self.id))?;

        hid::run_blocking(move || {
            let device = handle.lock();
            for report in &reports {
                device.write(report).context("Failed to write X-Keys report")?;
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl Device for XKeysDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::XKeys
    }

    fn events(&self) -> &DeviceEvents {
        &self.events
    }

    async fn init(&self) -> Result<()> {
        debug!("Initializing X-Keys '{}' (product {:?})", self.id, self.config.product_id);

        let product_id = self.config.product_id;
        let (device, summary) =
            hid::run_blocking(move || hid::open_first(|summary| matches(product_id, summary)))
                .await
                .with_context(|| format!("X-Keys for '{}' not available", self.id))?;
        let handle = Arc::new(Mutex::new(device));

        let events = self.events.clone();
        let error_events = self.events.clone();
        let mut columns = vec![0u8; self.config.columns as usize];
        let reader = ReportReader::spawn(
            self.id.clone(),
            handle.clone(),
            INPUT_REPORT_LEN,
            move |report| {
                for button in newly_pressed(&mut columns, report) {
                    trace!("X-Keys button {} pressed", button);
                    events.emit_trigger(TriggerEvent::new(format!("button:{}", button)));
                }
            },
            move |e| error_events.emit_error(e),
        )?;

        if let Err(e) = self.events.activate() {
            reader.stop();
            return Err(e);
        }

        debug!(
            "X-Keys '{}' active ({})",
            self.id,
            summary.product.as_deref().unwrap_or("unknown model")
        );
        *self.panel.lock() = Some((handle, reader));
        Ok(())
    }

    async fn set_feedback(&self, trigger_id: &str, feedback: &Feedback) -> Result<()> {
        let columns = self.config.columns;
        let button = parse_button(trigger_id, columns)?;
        let Some(backlight) = Backlight::for_feedback(feedback) else {
            trace!("X-Keys '{}' ignores {} feedback", self.id, trigger_id);
            return Ok(());
        };
        let (blue, red) = match backlight {
            Backlight::Off => (false, false),
            Backlight::Blue => (true, false),
            Backlight::Red => (false, true),
        };
        self.write(vec![
            backlight_report(button, Bank::Blue, blue, columns),
            backlight_report(button, Bank::Red, red, columns),
        ])
        .await
    }

    async fn clear_feedback_all(&self) -> Result<()> {
        self.write(vec![bank_report(Bank::Blue, false), bank_report(Bank::Red, false)])
            .await
    }

    async fn destroy(&self) -> Result<()> {
        if let Some((_, reader)) = self.panel.lock().take() {
            reader.stop();
            debug!("X-Keys '{}' closed", self.id);
        }
        self.events.detach_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feedback::Rgb;

    #[test]
    fn test_button_numbering() {
        assert_eq!(button_index(0, 0), 1);
        assert_eq!(button_index(0, 7), 8);
        assert_eq!(button_index(2, 3), 20);
    }

    #[test]
    fn test_newly_pressed() {
        let mut columns = vec![0u8; 2];

        let report = [0x00, 0x00, 0b0000_0001, 0b1000_0000];
        assert_eq!(newly_pressed(&mut columns, &report), vec![1, 16]);
        assert!(newly_pressed(&mut columns, &report).is_empty());

        let next = [0x00, 0x00, 0b0000_0011, 0b0000_0000];
        assert_eq!(newly_pressed(&mut columns, &next), vec![2]);
        assert_eq!(columns, vec![0b11, 0]);

        assert!(newly_pressed(&mut columns, &[0x00]).is_empty());
    }

    #[test]
    fn test_parse_button() {
        assert_eq!(parse_button("button:1", 4).unwrap(), 1);
        assert_eq!(parse_button("button:32", 4).unwrap(), 32);
        assert!(parse_button("button:33", 4).is_err());
        assert!(parse_button("button:0", 4).is_err());
        assert!(parse_button("key:1", 4).is_err());
    }

    #[test]
    fn test_backlight_reports() {
        let blue = backlight_report(3, Bank::Blue, true, 4);
        assert_eq!(blue.len(), OUTPUT_REPORT_LEN);
        assert_eq!(&blue[..4], &[0x00, 0xB5, 2, 1]);

        let red = backlight_report(3, Bank::Red, false, 4);
        assert_eq!(&red[..4], &[0x00, 0xB5, 34, 0]);

        assert_eq!(&bank_report(Bank::Red, true)[..4], &[0x00, 0xB6, 1, 0xFF]);
    }

    #[test]
    fn test_backlight_for_feedback() {
        assert_eq!(Backlight::for_feedback(&Feedback::Off), Some(Backlight::Off));
        assert_eq!(
            Backlight::for_feedback(&Feedback::Color(Rgb::new(200, 10, 10))),
            Some(Backlight::Red)
        );
        assert_eq!(
            Backlight::for_feedback(&Feedback::Color(Rgb::new(0, 0, 255))),
            Some(Backlight::Blue)
        );
        assert_eq!(
            Backlight::for_feedback(&Feedback::Color(Rgb::BLACK)),
            Some(Backlight::Off)
        );
        let label = Feedback::Text { text: "GO".into(), color: None, background: None };
        assert_eq!(Backlight::for_feedback(&label), None);
    }

    #[test]
    fn test_product_filter() {
        let summary = HidSummary {
            vendor_id: XKEYS_VENDOR_ID,
            product_id: 1089,
            serial: None,
            product: None,
        };
        assert!(matches(None, &summary));
        assert!(matches(Some(1089), &summary));
        assert!(!matches(Some(1090), &summary));
        assert!(!matches(None, &HidSummary { vendor_id: 0x0fd9, ..summary }));
    }

    #[tokio::test]
    async fn test_feedback_requires_connection() {
        let device = XKeysDevice::new("panel", XKeysConfig { product_id: None, columns: 4 });
        let err = device
            .set_feedback("button:1", &Feedback::Color(Rgb::WHITE))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not connected"));
        device.destroy().await.unwrap();
    }
}
