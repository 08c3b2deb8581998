use crate::config::TensorLayout;
use crate::error::{Error, FingerprintError, Result};
use crate::fingerprint::{Fingerprint, FingerprintGenerator};
use crate::model::ModelInput;
use image::imageops::FilterType;
use image::{GenericImageView, RgbImage};
use ndarray::Array4;

/// Decoded request image, ready for inference.
pub struct PreprocessedImage {
    pub tensor: Array4<f32>,
    /// Hash of the full-size decoded image, not the resized copy.
    pub fingerprint: std::result::Result<Fingerprint, FingerprintError>,
    pub width: u32,
    pub height: u32,
    pub format: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ImagePreprocessor {
    input: ModelInput,
    fingerprints: FingerprintGenerator,
}

impl ImagePreprocessor {
    pub fn new(input: ModelInput, fingerprints: FingerprintGenerator) -> Self {
        Self {
            input,
            fingerprints,
        }
    }

    pub fn input(&self) -> ModelInput {
        self.input
    }

    /// Decodes `bytes`, cover-fits them to the model's square input and
    /// scales pixels to `[0, 1]`. A decode failure ends the request.
    pub fn preprocess(&self, bytes: &[u8]) -> Result<PreprocessedImage> {
        let format = image::guess_format(bytes)
            .map_err(|e| Error::Decode(format!("unrecognized image format: {e}")))?;
        let img = image::load_from_memory_with_format(bytes, format)
            .map_err(|e| Error::Decode(e.to_string()))?;
        let (width, height) = img.dimensions();
        if width == 0 || height == 0 {
            return Err(Error::Decode("image has no pixels".into()));
        }

        let fingerprint = self.fingerprints.fingerprint_image(&img);

        let size = self.input.size;
        let resized = img.resize_to_fill(size, size, FilterType::Triangle).to_rgb8();
        let data = match self.input.layout {
            TensorLayout::Nhwc => rgb8_to_nhwc(&resized),
            TensorLayout::Nchw => rgb8_to_nchw(&resized, size, size),
        };
        let tensor = Array4::from_shape_vec(self.input.shape(), data)
            .map_err(|e| Error::Decode(format!("Invalid input tensor shape: {e}")))?;

        Ok(PreprocessedImage {
            tensor,
            fingerprint,
            width,
            height,
            format: format!("{format:?}").to_lowercase(),
        })
    }
}

fn rgb8_to_nhwc(img: &RgbImage) -> Vec<f32> {
    let mut input: Vec<f32> = Vec::with_capacity((img.width() * img.height() * 3) as usize);
    for pixel in img.pixels() {
        input.extend_from_slice(&[
            pixel[0] as f32 / 255.0,
            pixel[1] as f32 / 255.0,
            pixel[2] as f32 / 255.0,
        ]);
    }
    input
}

fn rgb8_to_nchw(img: &RgbImage, w: u32, h: u32) -> Vec<f32> {
    let plane = (w * h) as usize;
    let mut input = vec![0.0; plane * 3];
    for (x, y, pixel) in img.enumerate_pixels() {
        let idx = (y * w + x) as usize;
        input[idx] = pixel[0] as f32 / 255.0;
        input[idx + plane] = pixel[1] as f32 / 255.0;
        input[idx + plane * 2] = pixel[2] as f32 / 255.0;
    }
    input
}
