//! Feedback payloads sent back to devices (LED colors, key text, key bitmaps)
//!
//! The device manager treats [`Feedback`] as opaque and passes it through untouched;
//! only integrations look inside. Integrations with displays turn a payload into a
//! key bitmap with [`render_key`].

mod render;

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub use render::render_key;

/// 24-bit color
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const BLACK: Rgb = Rgb::new(0, 0, 0);
    pub const WHITE: Rgb = Rgb::new(255, 255, 255);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Brightest channel, used by LED-only hardware
    pub fn brightness(&self) -> u8 {
        self.r.max(self.g).max(self.b)
    }

    pub fn is_black(&self) -> bool {
        *self == Rgb::BLACK
    }
}

/// Feedback payload addressed to one trigger/control
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Feedback {
    /// Solid color (LED or key background)
    Color(Rgb),
    /// Label drawn on a key display
    Text {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<Rgb>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        background: Option<Rgb>,
    },
    /// Raw RGB888 bitmap, row-major
    Image { width: u32, height: u32, rgb: Vec<u8> },
    /// Indicator off / key blank
    Off,
}

/// Font size class for key labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelFont {
    Small,
    Large,
}

/// Shared settings for key bitmap rendering
#[derive(Debug, Clone)]
pub struct KeyRenderer {
    pub default_text: Rgb,
    pub default_background: Rgb,
    /// Keys at least this wide get the large font
    pub large_font_min_size: u32,
}

impl Default for KeyRenderer {
    fn default() -> Self {
        Self {
            default_text: Rgb::WHITE,
            default_background: Rgb::BLACK,
            large_font_min_size: 96,
        }
    }
}

impl KeyRenderer {
    pub fn font_for(&self, size: u32) -> LabelFont {
        if size >= self.large_font_min_size {
            LabelFont::Large
        } else {
            LabelFont::Small
        }
    }
}

static RENDERER: OnceCell<KeyRenderer> = OnceCell::new();

/// One-time setup of the shared renderer. Calling it again is a no-op.
pub fn init() {
    let mut fresh = false;
    RENDERER.get_or_init(|| {
        fresh = true;
        KeyRenderer::default()
    });
    if fresh {
        debug!("Feedback renderer initialized");
    }
}

/// Shared renderer settings (initialized lazily if `init()` was skipped)
pub fn renderer() -> &'static KeyRenderer {
    RENDERER.get_or_init(KeyRenderer::default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_feedback_wire_format() {
        let fb: Feedback = serde_json::from_value(json!({"type": "color", "r": 255, "g": 0, "b": 10})).unwrap();
        assert_eq!(fb, Feedback::Color(Rgb::new(255, 0, 10)));

        let fb: Feedback = serde_json::from_value(json!({"type": "text", "text": "REC"})).unwrap();
        assert_eq!(
            fb,
            Feedback::Text { text: "REC".into(), color: None, background: None }
        );

        let fb: Feedback = serde_json::from_value(json!({"type": "off"})).unwrap();
        assert_eq!(fb, Feedback::Off);
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init();
        assert_eq!(renderer().font_for(72), LabelFont::Small);
        assert_eq!(renderer().font_for(96), LabelFont::Large);
    }
}
