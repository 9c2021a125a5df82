//! Locked preview rendering: darkened copy of the output with a padlock glyph.

use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use std::io::Cursor;
use thiserror::Error;

const GLYPH_SCALE: f32 = 0.2;
const GLYPH_MIN_PX: u32 = 100;
const GLYPH_MAX_PX: u32 = 200;

const GLYPH_COLOR: Rgba<u8> = Rgba([255, 255, 255, 230]);
const KEYHOLE_COLOR: Rgba<u8> = Rgba([40, 40, 40, 255]);

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("Failed to render preview: {0}")]
    Image(#[from] image::ImageError),

    #[error("Overlay alpha {0} outside 0.0-1.0")]
    InvalidAlpha(f32),
}

/// Side length of the padlock for an image of the given width
pub fn glyph_size(width: u32, height: u32) -> u32 {
    let scaled = (width as f32 * GLYPH_SCALE).round() as u32;
    scaled
        .clamp(GLYPH_MIN_PX, GLYPH_MAX_PX)
        .min(width)
        .min(height)
}

fn blend(base: &mut Rgba<u8>, over: Rgba<u8>) {
    let a = over.0[3] as f32 / 255.0;
    for c in 0..3 {
        base.0[c] = (over.0[c] as f32 * a + base.0[c] as f32 * (1.0 - a)).round() as u8;
    }
}

fn darken(img: &mut RgbaImage, alpha: f32) {
    let keep = 1.0 - alpha;
    for px in img.pixels_mut() {
        for c in 0..3 {
            px.0[c] = (px.0[c] as f32 * keep).round() as u8;
        }
    }
}

/// Paint a padlock centered in the image: a ring-shaped shackle over a solid
/// body with a keyhole.
fn draw_padlock(img: &mut RgbaImage) {
    let (width, height) = img.dimensions();
    let s = glyph_size(width, height) as f32;
    if s < 1.0 {
        return;
    }

    let x0 = (width as f32 - s) / 2.0;
    let y0 = (height as f32 - s) / 2.0;
    let cx = width as f32 / 2.0;

    let body_top = y0 + 0.45 * s;
    let body_left = x0 + 0.15 * s;
    let body_right = x0 + 0.85 * s;
    let body_bottom = y0 + s;

    let shackle_outer = 0.28 * s;
    let shackle_inner = 0.18 * s;

    let keyhole_cy = y0 + 0.65 * s;
    let keyhole_r = 0.07 * s;
    let slot_half = 0.025 * s;
    let slot_bottom = y0 + 0.85 * s;

    let xs = x0.max(0.0) as u32..((x0 + s).ceil() as u32).min(width);
    let ys = y0.max(0.0) as u32..((y0 + s).ceil() as u32).min(height);

    for y in ys {
        for x in xs.clone() {
            let (fx, fy) = (x as f32 + 0.5, y as f32 + 0.5);

            let in_body =
                fx >= body_left && fx < body_right && fy >= body_top && fy < body_bottom;

            let dist = ((fx - cx).powi(2) + (fy - body_top).powi(2)).sqrt();
            let in_shackle = fy < body_top && dist <= shackle_outer && dist >= shackle_inner;

            let keyhole_dist = ((fx - cx).powi(2) + (fy - keyhole_cy).powi(2)).sqrt();
            let in_keyhole = keyhole_dist <= keyhole_r
                || ((fx - cx).abs() <= slot_half && fy >= keyhole_cy && fy < slot_bottom);

            let px = img.get_pixel_mut(x, y);
            if in_body && in_keyhole {
                blend(px, KEYHOLE_COLOR);
            } else if in_body || in_shackle {
                blend(px, GLYPH_COLOR);
            }
        }
    }
}

/// Render the locked preview of `output` as PNG bytes
pub fn render_locked_preview(output: &[u8], overlay_alpha: f32) -> Result<Vec<u8>, PreviewError> {
    if !(0.0..=1.0).contains(&overlay_alpha) {
        return Err(PreviewError::InvalidAlpha(overlay_alpha));
    }

    let mut img = image::load_from_memory(output)?.to_rgba8();
    darken(&mut img, overlay_alpha);
    draw_padlock(&mut img);

    let mut buf = Cursor::new(Vec::new());
    DynamicImage::ImageRgba8(img).write_to(&mut buf, ImageFormat::Png)?;
    Ok(buf.into_inner())
}
