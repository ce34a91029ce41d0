//! Turns an uploaded image into the tensor layout the classifier expects.
//!
//! Every stage is a standalone function; [`preprocess`] chains them in the
//! order the models were trained with.

use image::{imageops::FilterType, DynamicImage, GrayImage, Rgb, RgbImage, RgbaImage};
use ndarray::Array4;
use serde::Deserialize;
use std::io::Cursor;
use thiserror::Error;

/// Pixels at or below this alpha are ignored when estimating ink brightness.
pub const ALPHA_THRESHOLD: u8 = 10;
const CONTENT_MID_GRAY: f64 = 128.0;
const CORNER_MID_GRAY: f64 = 127.0;
pub const DEFAULT_INPUT_SIZE: u32 = 224;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Error, Debug)]
pub enum PreprocessError {
    #[error("Error decoding image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("Image has no pixels")]
    EmptyImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSize {
    pub width: u32,
    pub height: u32,
}

impl InputSize {
    pub fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }
}

impl Default for InputSize {
    fn default() -> Self {
        Self::square(DEFAULT_INPUT_SIZE)
    }
}

/// Value transform applied after resizing, matching the backbone's training.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Normalization {
    /// EfficientNet graphs rescale internally, inputs stay in `[0, 255]`.
    #[default]
    EfficientNet,
    /// Scale to `[-1, 1]`.
    Tf,
    /// Scale to `[0, 1]` then standardize with the ImageNet statistics.
    Torch,
}

impl Normalization {
    fn apply(self, channel: usize, value: f32) -> f32 {
        match self {
            Normalization::EfficientNet => value,
            Normalization::Tf => value / 127.5 - 1.0,
            Normalization::Torch => (value / 255.0 - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Background {
    White,
    Black,
}

impl Background {
    fn value(self) -> u32 {
        match self {
            Background::White => 255,
            Background::Black => 0,
        }
    }
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
    let image = image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(image::ImageError::IoError)?
        .decode()?;

    if image.width() == 0 || image.height() == 0 {
        return Err(PreprocessError::EmptyImage);
    }
    Ok(image)
}

/// Picks the background that keeps the visible content contrasted: dark ink
/// lands on white, light ink on black. Fully transparent images get black.
pub fn infer_background(image: &RgbaImage) -> Background {
    let (sum, count) = image
        .pixels()
        .filter(|p| p[3] > ALPHA_THRESHOLD)
        .fold((0u64, 0u64), |(sum, count), p| {
            (sum + p[0] as u64 + p[1] as u64 + p[2] as u64, count + 3)
        });

    if count == 0 {
        return Background::Black;
    }

    let mean = sum as f64 / count as f64;
    tracing::debug!(content_brightness = mean, "Estimated content brightness");
    if mean < CONTENT_MID_GRAY {
        Background::White
    } else {
        Background::Black
    }
}

pub fn composite(image: &RgbaImage, background: Background) -> RgbImage {
    let bg = background.value();
    RgbImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let alpha = p[3] as u32;
        let blend = |fg: u8| ((fg as u32 * alpha + bg * (255 - alpha) + 127) / 255) as u8;
        Rgb([blend(p[0]), blend(p[1]), blend(p[2])])
    })
}

/// ITU-R 601-2 luma in fixed point.
pub fn to_grayscale(image: &RgbImage) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let p = image.get_pixel(x, y);
        let luma = (p[0] as u32 * 19595 + p[1] as u32 * 38470 + p[2] as u32 * 7471 + 0x8000) >> 16;
        image::Luma([luma as u8])
    })
}

/// Inverts the image when its corners are light so content ends up light on
/// dark. Returns whether an inversion happened.
pub fn normalize_polarity(image: &mut GrayImage) -> bool {
    let (w, h) = image.dimensions();
    if w == 0 || h == 0 {
        return false;
    }

    let corners = [(0, 0), (w - 1, 0), (0, h - 1), (w - 1, h - 1)];
    let corner_brightness =
        corners.iter().map(|&(x, y)| image.get_pixel(x, y)[0] as f64).sum::<f64>() / 4.0;

    tracing::debug!(corner_brightness, "Sampled corner brightness");
    if corner_brightness > CORNER_MID_GRAY {
        image::imageops::invert(image);
        return true;
    }
    false
}

/// Stretches the histogram so the darkest pixel maps to 0 and the lightest
/// to 255. Flat images are left untouched.
pub fn autocontrast(image: &mut GrayImage) {
    let Some((lo, hi)) = image.pixels().fold(None, |acc: Option<(u8, u8)>, p| {
        let v = p[0];
        Some(match acc {
            Some((lo, hi)) => (lo.min(v), hi.max(v)),
            None => (v, v),
        })
    }) else {
        return;
    };

    if hi <= lo {
        return;
    }

    let scale = 255.0 / (hi - lo) as f64;
    let offset = -(lo as f64) * scale;
    let lut: Vec<u8> = (0..=255u32)
        .map(|ix| ((ix as f64 * scale + offset) as i64).clamp(0, 255) as u8)
        .collect();

    for p in image.pixels_mut() {
        p[0] = lut[p[0] as usize];
    }
}

/// Resizes a three-channel image and lays it out as a `(1, H, W, 3)` tensor.
pub fn to_tensor(image: &RgbImage, size: InputSize, normalization: Normalization) -> Array4<f32> {
    let resized = image::imageops::resize(image, size.width, size.height, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, size.height as usize, size.width as usize, 3));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for (c, value) in pixel.0.iter().enumerate() {
            input[[0, y as usize, x as usize, c]] = normalization.apply(c, *value as f32);
        }
    }
    input
}

pub fn preprocess(
    bytes: &[u8],
    size: InputSize,
    normalization: Normalization,
) -> Result<Array4<f32>, PreprocessError> {
    let image = decode(bytes)?;
    tracing::debug!(
        width = image.width(),
        height = image.height(),
        color = ?image.color(),
        "Processing image"
    );

    let rgba = image.to_rgba8();
    let background = infer_background(&rgba);
    tracing::debug!(?background, "Compositing on background");
    let rgb = composite(&rgba, background);

    let mut gray = to_grayscale(&rgb);
    if normalize_polarity(&mut gray) {
        tracing::debug!("Inverted image to light on dark");
    }
    autocontrast(&mut gray);

    let replicated = DynamicImage::ImageLuma8(gray).to_rgb8();
    Ok(to_tensor(&replicated, size, normalization))
}
