use crate::config::DEFAULT_INPUT_SIZE;
use crate::error::{Error, Result};
use image::buffer::ConvertBuffer;
use image::imageops::FilterType;
use image::{RgbImage, RgbaImage};
use ndarray::Array3;
use std::borrow::Cow;

pub const CHANNELS: usize = 3;
const NORMALIZE_CENTER: f32 = 127.5;

/// `H x W x C` float tensor, row-major, RGB interleaved per pixel.
pub type InputTensor = Array3<f32>;

/// Turns an arbitrary-size RGBA buffer into the network's square input tensor.
///
/// Resampling is bilinear ([`FilterType::Triangle`]), which is deterministic for a
/// given source buffer. Each channel maps through `(v - 127.5) / 127.5`, so `0`
/// becomes `-1.0`, `255` becomes `1.0`, `127` lands just below zero and `128`
/// just above. Alpha is dropped.
#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    size: usize,
    filter: FilterType,
}

impl Default for Preprocessor {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_SIZE)
    }
}

impl Preprocessor {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            filter: FilterType::Triangle,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn output_shape(&self) -> [usize; 3] {
        [self.size, self.size, CHANNELS]
    }

    pub fn preprocess(&self, pixels: &RgbaImage) -> Result<InputTensor> {
        let (width, height) = pixels.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::InvalidImage(format!(
                "Source image has zero extent ({width}x{height})"
            )));
        }
        let side = self.size as u32;
        let resized: Cow<'_, RgbaImage> = if (width, height) == (side, side) {
            Cow::Borrowed(pixels)
        } else {
            Cow::Owned(image::imageops::resize(pixels, side, side, self.filter))
        };

        let mut data: Vec<f32> = Vec::with_capacity(self.size * self.size * CHANNELS);
        // `pixels()` walks rows outer, columns inner.
        for pixel in resized.pixels() {
            data.extend_from_slice(&[
                normalize_channel(pixel[0]),
                normalize_channel(pixel[1]),
                normalize_channel(pixel[2]),
            ]);
        }
        let actual = vec![data.len()];
        Array3::from_shape_vec((self.size, self.size, CHANNELS), data).map_err(|_| {
            Error::ShapeMismatch {
                expected: self.output_shape().to_vec(),
                actual,
            }
        })
    }
}

/// Widens an RGB buffer to RGBA with opaque alpha.
pub fn rgba_from_rgb(pixels: &RgbImage) -> RgbaImage {
    pixels.convert()
}

pub fn normalize_channel(value: u8) -> f32 {
    (value as f32 - NORMALIZE_CENTER) / NORMALIZE_CENTER
}

/// HWC to CHW reordering for runtimes that declare channels-first inputs.
pub fn hwc_to_chw(tensor: &InputTensor) -> Vec<f32> {
    let (h, w, c) = tensor.dim();
    let plane = h * w;
    let mut out = vec![0.0; plane * c];
    for ((y, x, ch), value) in tensor.indexed_iter() {
        out[ch * plane + y * w + x] = *value;
    }
    out
}
