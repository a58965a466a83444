//! Key bitmap rendering

use anyhow::{bail, Result};
use embedded_graphics::{
    mono_font::{
        ascii::{FONT_10X20, FONT_6X10},
        MonoTextStyle,
    },
    pixelcolor::Rgb888,
    prelude::*,
    text::{Alignment, Baseline, Text, TextStyleBuilder},
};
use image::{imageops::FilterType, RgbImage};
use std::convert::Infallible;

use super::{renderer, Feedback, LabelFont, Rgb};

/// embedded-graphics draw target backed by an `image` buffer
struct KeyCanvas<'a>(&'a mut RgbImage);

impl OriginDimensions for KeyCanvas<'_> {
    fn size(&self) -> Size {
        Size::new(self.0.width(), self.0.height())
    }
}

impl DrawTarget for KeyCanvas<'_> {
    type Color = Rgb888;
    type Error = Infallible;

    fn draw_iter<I>(&mut self, pixels: I) -> Result<(), Self::Error>
    where
        I: IntoIterator<Item = Pixel<Self::Color>>,
    {
        let (width, height) = self.0.dimensions();
        for Pixel(point, color) in pixels {
            if point.x < 0 || point.y < 0 {
                continue;
            }
            let (x, y) = (point.x as u32, point.y as u32);
            if x < width && y < height {
                self.0.put_pixel(x, y, image::Rgb([color.r(), color.g(), color.b()]));
            }
        }
        Ok(())
    }
}

fn solid(size: u32, color: Rgb) -> RgbImage {
    RgbImage::from_pixel(size, size, image::Rgb([color.r, color.g, color.b]))
}

/// Render a feedback payload into a square key bitmap of `size` pixels
pub fn render_key(feedback: &Feedback, size: u32) -> Result<RgbImage> {
    let settings = renderer();

    match feedback {
        Feedback::Off => Ok(solid(size, Rgb::BLACK)),
        Feedback::Color(color) => Ok(solid(size, *color)),
        Feedback::Text { text, color, background } => {
            let mut img = solid(size, background.unwrap_or(settings.default_background));
            let fg = color.unwrap_or(settings.default_text);

            let font = match settings.font_for(size) {
                LabelFont::Small => &FONT_6X10,
                LabelFont::Large => &FONT_10X20,
            };
            let style = MonoTextStyle::new(font, Rgb888::new(fg.r, fg.g, fg.b));
            let text_style = TextStyleBuilder::new()
                .alignment(Alignment::Center)
                .baseline(Baseline::Middle)
                .build();

            // Center the whole block, not just the first line
            let lines = text.lines().count().max(1) as i32;
            let line_height = font.character_size.height as i32;
            let center = size as i32 / 2;
            let origin = Point::new(center, center - (lines - 1) * line_height / 2);

            let mut canvas = KeyCanvas(&mut img);
            let _ = Text::with_text_style(text, origin, style, text_style).draw(&mut canvas);
            Ok(img)
        }
        Feedback::Image { width, height, rgb } => {
            let Some(expected) = (*width as usize)
                .checked_mul(*height as usize)
                .and_then(|pixels| pixels.checked_mul(3))
            else {
                bail!("image payload of {}x{} is too large", width, height);
            };
            if rgb.len() != expected {
                bail!(
                    "image payload has {} bytes, expected {} for {}x{}",
                    rgb.len(),
                    expected,
                    width,
                    height
                );
            }
            let Some(src) = RgbImage::from_raw(*width, *height, rgb.clone()) else {
                bail!("invalid {}x{} image payload", width, height);
            };
            if *width == size && *height == size {
                return Ok(src);
            }
            Ok(image::imageops::resize(&src, size, size, FilterType::Triangle))
        }
    }
}
