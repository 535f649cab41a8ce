use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array4, ArrayView4};
use std::path::Path;

pub const INPUT_SIZE: u32 = 224;

#[derive(Debug, thiserror::Error)]
pub enum PreprocessError {
    #[error("Failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
}

/// `(1, 224, 224, 3)` batch in NHWC order, values in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct NormalizedTensor {
    data: Array4<f32>,
}

impl NormalizedTensor {
    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data.iter().copied().collect()
    }
}

pub fn decode(bytes: &[u8]) -> Result<RgbImage, PreprocessError> {
    Ok(image::load_from_memory(bytes)?.to_rgb8())
}

/// Format is sniffed from the content; the file name is not consulted.
pub fn decode_file(path: &Path) -> Result<RgbImage, PreprocessError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Stretches to the model input size; aspect ratio is not preserved.
pub fn preprocess_image(image: &RgbImage) -> NormalizedTensor {
    let resized = imageops::resize(image, INPUT_SIZE, INPUT_SIZE, FilterType::Triangle);
    let side = INPUT_SIZE as usize;
    let data = Array4::from_shape_fn((1, side, side, 3), |(_, y, x, c)| {
        resized.get_pixel(x as u32, y as u32)[c] as f32 / 255.0
    });
    NormalizedTensor { data }
}

/// Byte-level entry point; callers that need the decoded original for the
/// overlay use `decode` and `preprocess_image` separately.
pub fn preprocess(bytes: &[u8]) -> Result<NormalizedTensor, PreprocessError> {
    let image = decode(bytes)?;
    Ok(preprocess_image(&image))
}
