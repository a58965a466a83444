//! Elgato Stream Deck integration (JPEG-generation panels over raw HID)
//!
//! Key presses become `key:<n>` triggers (0-based, row-major). Feedback is
//! rendered to a key bitmap and streamed to the panel as JPEG pages.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use hidapi::HidDevice;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::hid::{self, padded, HidSummary, ReportReader};
use super::{Device, DeviceEvents, TriggerEvent};
use crate::config::{DeviceKind, StreamDeckConfig};
use crate::feedback::{self, Feedback};

pub const ELGATO_VENDOR_ID: u16 = 0x0fd9;

const IMAGE_REPORT_LEN: usize = 1024;
const IMAGE_HEADER_LEN: usize = 8;
const FEATURE_REPORT_LEN: usize = 32;
/// Key states start after the report id and a 3 byte header
const KEY_STATE_OFFSET: usize = 4;
const JPEG_QUALITY: u8 = 90;

/// Supported panel model
#[derive(Debug, PartialEq, Eq)]
pub struct Model {
    pub name: &'static str,
    pub product_id: u16,
    pub keys: u8,
    pub key_size: u32,
}

pub const MODELS: &[Model] = &[
    Model { name: "Stream Deck Original V2", product_id: 0x006d, keys: 15, key_size: 72 },
    Model { name: "Stream Deck MK.2", product_id: 0x0080, keys: 15, key_size: 72 },
    Model { name: "Stream Deck XL", product_id: 0x006c, keys: 32, key_size: 96 },
    Model { name: "Stream Deck XL V2", product_id: 0x008f, keys: 32, key_size: 96 },
];

pub fn model_for(product_id: u16) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.product_id == product_id)
}

fn parse_key(trigger_id: &str, model: &Model) -> Result<u8> {
    let key: u8 = trigger_id
        .strip_prefix("key:")
        .ok_or_else(|| anyhow!("invalid Stream Deck trigger id '{}'", trigger_id))?
        .parse()
        .with_context(|| format!("invalid key index in '{}'", trigger_id))?;
    if key >= model.keys {
        bail!("key {} out of range for {} ({} keys)", key, model.name, model.keys);
    }
    Ok(key)
}

/// Keys that went from released to pressed between two state reports
pub fn newly_pressed(previous: &mut [bool], report: &[u8]) -> Vec<u8> {
    if report.first() != Some(&0x01) {
        return Vec::new();
    }
    let states = report.get(KEY_STATE_OFFSET..).unwrap_or_default();

    let mut pressed = Vec::new();
    for (key, was_down) in previous.iter_mut().enumerate() {
        let down = states.get(key).is_some_and(|s| *s != 0);
        if down && !*was_down {
            pressed.push(key as u8);
        }
        *was_down = down;
    }
    pressed
}

/// Whether an enumerated device is a supported panel with the wanted serial
fn matches(serial: Option<&str>, summary: &HidSummary) -> bool {
    summary.vendor_id == ELGATO_VENDOR_ID
        && model_for(summary.product_id).is_some()
        && serial.map_or(true, |serial| summary.serial.as_deref() == Some(serial))
}

/// Encode a key bitmap the way the panel expects it (rotated 180°, JPEG)
pub fn encode_key_image(img: &RgbImage) -> Result<Vec<u8>> {
    let rotated = image::imageops::rotate180(img);
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&rotated)
        .context("Failed to encode key image")?;
    Ok(jpeg)
}

/// Split an encoded key image into fixed-size output reports
pub fn image_reports(key: u8, jpeg: &[u8]) -> Vec<Vec<u8>> {
    let payload_len = IMAGE_REPORT_LEN - IMAGE_HEADER_LEN;
    let pages = jpeg.len().div_ceil(payload_len).max(1);

    (0..pages)
        .map(|page| {
            let start = page * payload_len;
            let chunk = &jpeg[start.min(jpeg.len())..(start + payload_len).min(jpeg.len())];
            let is_last = page + 1 == pages;

            let mut report = Vec::with_capacity(IMAGE_REPORT_LEN);
            report.extend_from_slice(&[
                0x02,
                0x07,
                key,
                is_last as u8,
                (chunk.len() & 0xff) as u8,
                (chunk.len() >> 8) as u8,
                (page & 0xff) as u8,
                (page >> 8) as u8,
            ]);
            report.extend_from_slice(chunk);
            padded(report, IMAGE_REPORT_LEN)
        })
        .collect()
}

struct Panel {
    handle: Arc<Mutex<HidDevice>>,
    model: &'static Model,
    reader: ReportReader,
}

/// Elgato Stream Deck device
pub struct StreamDeckDevice {
    id: String,
    config: StreamDeckConfig,
    events: Arc<DeviceEvents>,
    panel: Mutex<Option<Panel>>,
}

impl StreamDeckDevice {
    pub fn new(id: impl Into<String>, config: StreamDeckConfig) -> Self {
        Self {
            id: id.into(),
            config,
            events: Arc::new(DeviceEvents::new()),
            panel: Mutex::new(None),
        }
    }

    fn connected(&self) -> Result<(Arc<Mutex<HidDevice>>, &'static Model)> {
        self.panel
            .lock()
            .as_ref()
            .map(|panel| (panel.handle.clone(), panel.model))
            .ok_or_else(|| anyhow!("Stream Deck '{}' is not connected", self.id))
    }

    fn write_key(handle: &Mutex<HidDevice>, key: u8, img: &RgbImage) -> Result<()> {
        let jpeg = encode_key_image(img)?;
        let device = handle.lock();
        for report in image_reports(key, &jpeg) {
            device
                .write(&report)
                .with_context(|| format!("Failed to write image for key {}", key))?;
        }
        Ok(())
    }

    fn set_brightness(handle: &Mutex<HidDevice>, percent: u8) -> Result<()> {
        handle
            .lock()
            .send_feature_report(&padded(vec![0x03, 0x08, percent.min(100)], FEATURE_REPORT_LEN))
            .context("Failed to set brightness")
    }
}

#[async_trait]
impl Device for StreamDeckDevice {
    fn kind(&self) -> DeviceKind {
        DeviceKind::StreamDeck
    }

    fn events(&self) -> &DeviceEvents {
        &self.events
    }

    async fn init(&self) -> Result<()> {
        debug!("Initializing Stream Deck '{}' (serial {:?})", self.id, self.config.serial);

        let serial = self.config.serial.clone();
        let brightness = self.config.brightness;
        let (handle, model) = hid::run_blocking(move || {
            let (device, summary) = hid::open_first(|summary| matches(serial.as_deref(), summary))?;
            let model = model_for(summary.product_id).ok_or_else(|| {
                anyhow!("unsupported Stream Deck product {:04x}", summary.product_id)
            })?;
            let handle = Arc::new(Mutex::new(device));
            Self::set_brightness(&handle, brightness)?;
            Ok((handle, model))
        })
        .await
        .with_context(|| format!("Stream Deck for '{}' not available", self.id))?;

        let events = self.events.clone();
        let error_events = self.events.clone();
        let mut key_states = vec![false; model.keys as usize];
        let reader = ReportReader::spawn(
            self.id.clone(),
            handle.clone(),
            KEY_STATE_OFFSET + model.keys as usize,
            move |report| {
                for key in newly_pressed(&mut key_states, report) {
                    trace!("Stream Deck key {} pressed", key);
                    events.emit_trigger(TriggerEvent::new(format!("key:{}", key)));
                }
            },
            move |e| error_events.emit_error(e),
        )?;

        if let Err(e) = self.events.activate() {
            reader.stop();
            return Err(e);
        }

        debug!("{} '{}' active ({} keys)", model.name, self.id, model.keys);
        *self.panel.lock() = Some(Panel { handle, model, reader });
        Ok(())
    }

    async fn set_feedback(&self, trigger_id: &str, feedback: &Feedback) -> Result<()> {
        let (handle, model) = self.connected()?;
        let key = parse_key(trigger_id, model)?;
        let feedback = feedback.clone();
        hid::run_blocking(move || {
            let img = feedback::render_key(&feedback, model.key_size)?;
            Self::write_key(&handle, key, &img)
        })
        .await
    }

    async fn clear_feedback_all(&self) -> Result<()> {
        let (handle, model) = self.connected()?;
        hid::run_blocking(move || {
            let blank = feedback::render_key(&Feedback::Off, model.key_size)?;
            for key in 0..model.keys {
                Self::write_key(&handle, key, &blank)?;
            }
            Ok(())
        })
        .await
    }

    async fn destroy(&self) -> Result<()> {
        let panel = self.panel.lock().take();
        if let Some(Panel { handle, reader, .. }) = panel {
            reader.stop();
            // Hand the panel back in its reset state (logo screen)
            let reset = hid::run_blocking(move || {
                handle
                    .lock()
                    .send_feature_report(&padded(vec![0x03, 0x02], FEATURE_REPORT_LEN))
                    .context("Failed to reset panel")
            })
            .await;
            if let Err(e) = reset {
                warn!("Failed to reset Stream Deck '{}': {:#}", self.id, e);
            }
            debug!("Stream Deck '{}' closed", self.id);
        }
        self.events.detach_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_lookup() {
        assert_eq!(model_for(0x0080).unwrap().keys, 15);
        assert_eq!(model_for(0x006c).unwrap().key_size, 96);
        assert!(model_for(0x0063).is_none());
    }

    #[test]
    fn test_serial_filter() {
        let summary = HidSummary {
            vendor_id: ELGATO_VENDOR_ID,
            product_id: 0x0080,
            serial: Some("AL12".into()),
            product: None,
        };
        assert!(matches(None, &summary));
        assert!(matches(Some("AL12"), &summary));
        assert!(!matches(Some("CL99"), &summary));
        assert!(!matches(None, &HidSummary { product_id: 0x0063, ..summary }));
    }

    #[test]
    fn test_parse_key() {
        let model = model_for(0x0080).unwrap();
        assert_eq!(parse_key("key:0", model).unwrap(), 0);
        assert_eq!(parse_key("key:14", model).unwrap(), 14);
        assert!(parse_key("key:15", model).is_err());
        assert!(parse_key("button:1", model).is_err());
        assert!(parse_key("key:x", model).is_err());
    }

    #[test]
    fn test_newly_pressed_reports_edges_only() {
        let mut states = vec![false; 4];
        let report = [0x01, 0x00, 0x04, 0x00, 1, 0, 1, 0];

        assert_eq!(newly_pressed(&mut states, &report), vec![0, 2]);
        // Held keys do not retrigger
        assert_eq!(newly_pressed(&mut states, &report), Vec::<u8>::new());

        let released = [0x01, 0x00, 0x04, 0x00, 0, 0, 1, 1];
        assert_eq!(newly_pressed(&mut states, &released), vec![3]);
        assert_eq!(states, vec![false, false, true, true]);
    }

    #[test]
    fn test_non_key_reports_are_ignored() {
        let mut states = vec![false; 2];
        assert!(newly_pressed(&mut states, &[0x03, 0, 0, 0, 1, 1]).is_empty());
        assert_eq!(states, vec![false, false]);
    }

    #[test]
    fn test_image_reports_are_paged() {
        let jpeg = vec![0xAB; 2000];
        let reports = image_reports(5, &jpeg);

        assert_eq!(reports.len(), 2);
        assert!(reports.iter().all(|r| r.len() == IMAGE_REPORT_LEN));

        assert_eq!(&reports[0][..4], &[0x02, 0x07, 5, 0]);
        assert_eq!(reports[0][4] as usize | (reports[0][5] as usize) << 8, 1016);

        let last = &reports[1];
        assert_eq!(last[3], 1);
        assert_eq!(last[4] as usize | (last[5] as usize) << 8, 2000 - 1016);
        assert_eq!(&last[6..8], &[1, 0]);
    }

    #[test]
    fn test_encoded_key_image_is_jpeg() {
        let img = feedback::render_key(&Feedback::Off, 72).unwrap();
        let jpeg = encode_key_image(&img).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    }

    #[tokio::test]
    async fn test_feedback_requires_connection() {
        let device = StreamDeckDevice::new("deck", StreamDeckConfig { serial: None, brightness: 50 });
        assert!(device.set_feedback("key:0", &Feedback::Off).await.is_err());
        device.destroy().await.unwrap();
        device.destroy().await.unwrap();
    }
}
