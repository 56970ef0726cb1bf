use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array3, Array4, Axis};
use std::path::{Path, PathBuf};

use crate::classifier::error::ClassifierError;
use crate::config::PreprocessBackend;

/// ImageNet normalization mean values (RGB)
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet normalization std values (RGB)
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// An image handed to the classifier: raw upload bytes or a file on disk.
#[derive(Debug, Clone)]
pub enum ImageInput {
    Bytes(Vec<u8>),
    Path(PathBuf),
}

impl ImageInput {
    pub fn decode(&self) -> Result<RgbImage, ClassifierError> {
        let image = match self {
            ImageInput::Bytes(bytes) => image::load_from_memory(bytes)?,
            ImageInput::Path(path) => {
                let bytes = std::fs::read(path).map_err(|source| ClassifierError::ImageIo {
                    path: path.clone(),
                    source,
                })?;
                image::load_from_memory(&bytes)?
            }
        };
        Ok(image.to_rgb8())
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Bytes(bytes)
    }
}

impl From<&[u8]> for ImageInput {
    fn from(bytes: &[u8]) -> Self {
        ImageInput::Bytes(bytes.to_vec())
    }
}

impl From<PathBuf> for ImageInput {
    fn from(path: PathBuf) -> Self {
        ImageInput::Path(path)
    }
}

impl From<&Path> for ImageInput {
    fn from(path: &Path) -> Self {
        ImageInput::Path(path.to_path_buf())
    }
}

/// Resize + normalize + NCHW tensor conversion.
pub trait Preprocessor: Send + Sync {
    fn name(&self) -> &'static str;

    fn input_size(&self) -> u32;

    /// Returns a `[1, 3, size, size]` tensor.
    fn tensor(&self, image: &RgbImage) -> Array4<f32>;
}

fn resize(image: &RgbImage, size: u32) -> RgbImage {
    if image.dimensions() == (size, size) {
        image.clone()
    } else {
        imageops::resize(image, size, size, FilterType::Triangle)
    }
}

/// Vectorised normalization on ndarray views.
#[derive(Debug, Clone)]
pub struct NdarrayPreprocessor {
    size: u32,
    mean: Array3<f32>,
    std: Array3<f32>,
}

impl NdarrayPreprocessor {
    pub fn new(size: u32) -> Self {
        let channel = |values: [f32; 3]| {
            Array3::from_shape_vec((3, 1, 1), values.to_vec())
                .unwrap_or_else(|_| Array3::zeros((3, 1, 1)))
        };
        Self {
            size,
            mean: channel(IMAGENET_MEAN),
            std: channel(IMAGENET_STD),
        }
    }
}

impl Preprocessor for NdarrayPreprocessor {
    fn name(&self) -> &'static str {
        "ndarray"
    }

    fn input_size(&self) -> u32 {
        self.size
    }

    fn tensor(&self, image: &RgbImage) -> Array4<f32> {
        let resized = resize(image, self.size);
        let side = self.size as usize;
        let hwc = Array3::from_shape_vec((side, side, 3), resized.into_raw())
            .unwrap_or_else(|_| Array3::zeros((side, side, 3)));
        let chw = hwc.permuted_axes([2, 0, 1]).mapv(|v| v as f32 / 255.0);
        let normalized = (&chw - &self.mean) / &self.std;
        normalized.insert_axis(Axis(0)).as_standard_layout().to_owned()
    }
}

/// Per-pixel loop; used when the vectorised path is disabled.
#[derive(Debug, Clone)]
pub struct ScalarPreprocessor {
    size: u32,
}

impl ScalarPreprocessor {
    pub fn new(size: u32) -> Self {
        Self { size }
    }
}

impl Preprocessor for ScalarPreprocessor {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn input_size(&self) -> u32 {
        self.size
    }

    fn tensor(&self, image: &RgbImage) -> Array4<f32> {
        let resized = resize(image, self.size);
        let side = self.size as usize;
        let num_pixels = side * side;
        let mut normalized = vec![0.0f32; 3 * num_pixels];

        for (i, pixel) in resized.pixels().enumerate() {
            for c in 0..3 {
                normalized[c * num_pixels + i] =
                    (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
            }
        }

        Array4::from_shape_vec((1, 3, side, side), normalized)
            .unwrap_or_else(|_| Array4::zeros((1, 3, side, side)))
    }
}

pub fn build_preprocessor(backend: PreprocessBackend, size: u32) -> Box<dyn Preprocessor> {
    match backend {
        PreprocessBackend::Ndarray => Box::new(NdarrayPreprocessor::new(size)),
        PreprocessBackend::Scalar => Box::new(ScalarPreprocessor::new(size)),
    }
}

/// The deterministic views averaged by test-time augmentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtaView {
    Identity,
    FlipHorizontal,
    FlipVertical,
    /// 90° counter-clockwise.
    Rotate90,
    /// 270° counter-clockwise.
    Rotate270,
}

impl TtaView {
    pub const ALL: [TtaView; 5] = [
        TtaView::Identity,
        TtaView::FlipHorizontal,
        TtaView::FlipVertical,
        TtaView::Rotate90,
        TtaView::Rotate270,
    ];

    pub fn apply(&self, image: &RgbImage) -> RgbImage {
        match self {
            TtaView::Identity => image.clone(),
            TtaView::FlipHorizontal => imageops::flip_horizontal(image),
            TtaView::FlipVertical => imageops::flip_vertical(image),
            // imageops rotates clockwise
            TtaView::Rotate90 => imageops::rotate270(image),
            TtaView::Rotate270 => imageops::rotate90(image),
        }
    }
}
