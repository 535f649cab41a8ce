use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum FontError {
    #[error("Failed to read font file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Invalid font data in {0}")]
    Invalid(String),
}

const GLYPH_WIDTH: u32 = 5;
const GLYPH_HEIGHT: u32 = 7;

/// Built-in 5x7 bitmap glyphs, one row per byte, most significant of the low
/// five bits on the left. Lowercase letters render as uppercase.
fn glyph(c: char) -> [u8; 7] {
    match c.to_ascii_uppercase() {
        'A' => [0x0E, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'B' => [0x1E, 0x11, 0x11, 0x1E, 0x11, 0x11, 0x1E],
        'C' => [0x0E, 0x11, 0x10, 0x10, 0x10, 0x11, 0x0E],
        'D' => [0x1E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x1E],
        'E' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x1F],
        'F' => [0x1F, 0x10, 0x10, 0x1E, 0x10, 0x10, 0x10],
        'G' => [0x0E, 0x11, 0x10, 0x17, 0x11, 0x11, 0x0F],
        'H' => [0x11, 0x11, 0x11, 0x1F, 0x11, 0x11, 0x11],
        'I' => [0x0E, 0x04, 0x04, 0x04, 0x04, 0x04, 0x0E],
        'J' => [0x07, 0x02, 0x02, 0x02, 0x02, 0x12, 0x0C],
        'K' => [0x11, 0x12, 0x14, 0x18, 0x14, 0x12, 0x11],
        'L' => [0x10, 0x10, 0x10, 0x10, 0x10, 0x10, 0x1F],
        'M' => [0x11, 0x1B, 0x15, 0x15, 0x11, 0x11, 0x11],
        'N' => [0x11, 0x11, 0x19, 0x15, 0x13, 0x11, 0x11],
        'O' => [0x0E, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'P' => [0x1E, 0x11, 0x11, 0x1E, 0x10, 0x10, 0x10],
        'Q' => [0x0E, 0x11, 0x11, 0x11, 0x15, 0x12, 0x0D],
        'R' => [0x1E, 0x11, 0x11, 0x1E, 0x14, 0x12, 0x11],
        'S' => [0x0F, 0x10, 0x10, 0x0E, 0x01, 0x01, 0x1E],
        'T' => [0x1F, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        'U' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x11, 0x0E],
        'V' => [0x11, 0x11, 0x11, 0x11, 0x11, 0x0A, 0x04],
        'W' => [0x11, 0x11, 0x11, 0x15, 0x15, 0x15, 0x0A],
        'X' => [0x11, 0x11, 0x0A, 0x04, 0x0A, 0x11, 0x11],
        'Y' => [0x11, 0x11, 0x0A, 0x04, 0x04, 0x04, 0x04],
        'Z' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x10, 0x1F],
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '%' => [0x18, 0x19, 0x02, 0x04, 0x08, 0x13, 0x03],
        '|' => [0x04, 0x04, 0x04, 0x04, 0x04, 0x04, 0x04],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ' ' => [0x00; 7],
        _ => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x00, 0x04],
    }
}

pub enum Typeface {
    TrueType(FontVec),
    Bitmap,
}

impl Typeface {
    pub fn load(path: &Path) -> Result<Self, FontError> {
        let data = std::fs::read(path)?;
        let font = FontVec::try_from_vec(data)
            .map_err(|_| FontError::Invalid(path.display().to_string()))?;
        Ok(Typeface::TrueType(font))
    }

    pub fn is_builtin(&self) -> bool {
        matches!(self, Typeface::Bitmap)
    }

    fn bitmap_scale(size: f32) -> u32 {
        ((size / (GLYPH_HEIGHT + 1) as f32).round() as u32).max(1)
    }

    /// `(width, height)` of the rendered text in pixels.
    pub fn measure(&self, size: f32, text: &str) -> (u32, u32) {
        match self {
            Typeface::TrueType(font) => text_size(PxScale::from(size), font, text),
            Typeface::Bitmap => {
                let scale = Self::bitmap_scale(size);
                let chars = text.chars().count() as u32;
                let width = chars * (GLYPH_WIDTH + 1) * scale;
                (width.saturating_sub(scale), GLYPH_HEIGHT * scale)
            }
        }
    }

    /// Draws with the top-left corner at `(x, y)`. Pixels outside the canvas
    /// are skipped.
    pub fn draw(&self, canvas: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, size: f32, text: &str) {
        match self {
            Typeface::TrueType(font) => {
                draw_text_mut(canvas, color, x, y, PxScale::from(size), font, text)
            }
            Typeface::Bitmap => {
                let scale = Self::bitmap_scale(size);
                let advance = ((GLYPH_WIDTH + 1) * scale) as i32;
                for (i, c) in text.chars().enumerate() {
                    let origin_x = x + i as i32 * advance;
                    for (row, bits) in glyph(c).iter().enumerate() {
                        for col in 0..GLYPH_WIDTH {
                            if bits & (0x10 >> col) == 0 {
                                continue;
                            }
                            let px = origin_x + (col * scale) as i32;
                            let py = y + (row as u32 * scale) as i32;
                            draw_filled_rect_mut(canvas, Rect::at(px, py).of_size(scale, scale), color);
                        }
                    }
                }
            }
        }
    }
}

/// Heading and body faces for annotations.
pub struct FontSet {
    pub bold: Typeface,
    pub regular: Typeface,
}

impl FontSet {
    pub fn builtin() -> Self {
        Self {
            bold: Typeface::Bitmap,
            regular: Typeface::Bitmap,
        }
    }

    /// Never fails: faces that cannot be loaded fall back to the bitmap font.
    pub fn load(bold_path: &Path, regular_path: &Path) -> Self {
        let load_or_fallback = |path: &Path| match Typeface::load(path) {
            Ok(face) => {
                log::info!("Loaded annotation font {}", path.display());
                face
            }
            Err(e) => {
                log::warn!("Font unavailable ({}), using built-in bitmap font", e);
                Typeface::Bitmap
            }
        };
        Self {
            bold: load_or_fallback(bold_path),
            regular: load_or_fallback(regular_path),
        }
    }
}
