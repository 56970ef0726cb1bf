#![allow(dead_code)]

use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array1, Array2, Array4, Axis};
use plum_backend::classifier::backend::{ModelLoader, Network, OutputLayout, RawOutput};
use plum_backend::classifier::error::{InferenceError, LoadError};
use plum_backend::classifier::{ClassifierService, ModelMetadata};
use plum_backend::config::ServiceConfig;
use plum_backend::registry::{JsonModelRegistry, ModelRegistry};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const INPUT_SIZE: u32 = 32;

/// Network whose logits are a fixed bias on one class plus a small term from
/// the channel means of the input.
pub struct MockNetwork {
    favor: usize,
    num_classes: usize,
    confidence: Option<f32>,
    fail: bool,
    delay: Duration,
}

impl Network for MockNetwork {
    fn architecture(&self) -> &str {
        "mock"
    }

    fn layout(&self) -> OutputLayout {
        if self.confidence.is_some() {
            OutputLayout::LogitsWithConfidence
        } else {
            OutputLayout::Logits
        }
    }

    fn forward(&self, input: &Array4<f32>) -> Result<RawOutput, InferenceError> {
        if self.fail {
            return Err(InferenceError::Backend("mock forward failure".to_string()));
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let batch = input.dim().0;
        let means: Vec<f32> = (0..3)
            .map(|c| input.index_axis(Axis(1), c).mean().unwrap_or(0.0))
            .collect();
        let logits = Array2::from_shape_fn((batch, self.num_classes), |(_, j)| {
            let bias = if j == self.favor { 3.0 } else { 0.0 };
            bias + 0.1 * means[j % 3]
        });
        Ok(match self.confidence {
            Some(confidence) => {
                RawOutput::with_confidence(logits, Array1::from_elem(batch, confidence))
            }
            None => RawOutput::logits(logits),
        })
    }
}

/// Reads `key=value` lines from the weight file:
/// `favor`, `confidence`, `fail_forward`, `delay_ms`. A line `broken` makes
/// loading fail.
#[derive(Default)]
pub struct MockLoader {
    loads: AtomicUsize,
}

impl MockLoader {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModelLoader for MockLoader {
    fn device(&self) -> String {
        "cpu".to_string()
    }

    fn load(&self, weights: &Path, metadata: &ModelMetadata) -> Result<Box<dyn Network>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let contents = std::fs::read_to_string(weights)?;

        let mut network = MockNetwork {
            favor: 0,
            num_classes: metadata.num_classes,
            confidence: None,
            fail: false,
            delay: Duration::ZERO,
        };
        for line in contents.lines().map(str::trim).filter(|l| !l.is_empty()) {
            match line.split_once('=') {
                Some(("favor", v)) => network.favor = v.parse().unwrap_or(0),
                Some(("confidence", v)) => network.confidence = v.parse().ok(),
                Some(("fail_forward", v)) => network.fail = v == "true",
                Some(("delay_ms", v)) => {
                    network.delay = Duration::from_millis(v.parse().unwrap_or(0))
                }
                _ if line == "broken" => {
                    return Err(LoadError::Backend("corrupt weight file".to_string()));
                }
                _ => {}
            }
        }
        Ok(Box::new(network))
    }
}

pub struct Fixture {
    pub dir: TempDir,
    pub registry: Arc<JsonModelRegistry>,
    pub loader: Arc<MockLoader>,
    pub service: Arc<ClassifierService>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let registry = Arc::new(JsonModelRegistry::in_memory());
        Self::with_registry(dir, registry)
    }

    pub fn with_registry(dir: TempDir, registry: Arc<JsonModelRegistry>) -> Self {
        let loader = Arc::new(MockLoader::default());
        let service = Arc::new(ClassifierService::new(
            config(dir.path()),
            registry.clone() as Arc<dyn ModelRegistry>,
            loader.clone(),
        ));
        Self {
            dir,
            registry,
            loader,
            service,
        }
    }

    pub fn weights(&self, name: &str, contents: &str) -> PathBuf {
        write_file(self.dir.path(), name, contents)
    }
}

pub fn config(model_dir: &Path) -> ServiceConfig {
    ServiceConfig {
        model_dir: model_dir.to_path_buf(),
        registry_path: None,
        input_size: INPUT_SIZE,
        ..ServiceConfig::default()
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

pub fn solid_image(color: [u8; 3], width: u32, height: u32) -> RgbImage {
    RgbImage::from_pixel(width, height, Rgb(color))
}

pub fn png_bytes(image: &RgbImage) -> Vec<u8> {
    let mut buf = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .unwrap();
    buf
}

pub fn plum_png() -> Vec<u8> {
    let image = RgbImage::from_fn(40, 24, |x, y| {
        Rgb([(120 + x % 60) as u8, (30 + y * 2) as u8, 90])
    });
    png_bytes(&image)
}
