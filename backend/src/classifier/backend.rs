use ndarray::{Array1, Array2, Array4};
use serde::Serialize;
use std::path::Path;

use crate::classifier::error::{InferenceError, LoadError};
use crate::classifier::metadata::ModelMetadata;

/// Output convention of a loaded network, detected once at load time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputLayout {
    /// Forward returns class logits only.
    Logits,
    /// Forward returns `(logits, confidence)` where confidence is a sigmoid scalar per sample.
    LogitsWithConfidence,
}

impl OutputLayout {
    pub fn has_confidence_head(&self) -> bool {
        matches!(self, OutputLayout::LogitsWithConfidence)
    }
}

/// Canonical forward-pass output: `[batch, classes]` logits plus an optional
/// `[batch]` confidence estimate.
#[derive(Debug, Clone)]
pub struct RawOutput {
    pub logits: Array2<f32>,
    pub confidence: Option<Array1<f32>>,
}

impl RawOutput {
    pub fn logits(logits: Array2<f32>) -> Self {
        Self {
            logits,
            confidence: None,
        }
    }

    pub fn with_confidence(logits: Array2<f32>, confidence: Array1<f32>) -> Self {
        Self {
            logits,
            confidence: Some(confidence),
        }
    }

    pub fn check(&self, layout: OutputLayout, num_classes: usize) -> Result<(), InferenceError> {
        let (rows, cols) = self.logits.dim();
        if rows == 0 {
            return Err(InferenceError::Shape("empty batch".to_string()));
        }
        if cols != num_classes {
            return Err(InferenceError::Shape(format!(
                "expected {} class logits, got {}",
                num_classes, cols
            )));
        }
        match (&self.confidence, layout) {
            (Some(confidence), OutputLayout::LogitsWithConfidence) if confidence.len() == rows => {
                Ok(())
            }
            (Some(confidence), OutputLayout::LogitsWithConfidence) => {
                Err(InferenceError::Shape(format!(
                    "expected {} confidence values, got {}",
                    rows,
                    confidence.len()
                )))
            }
            (None, OutputLayout::Logits) => Ok(()),
            (found, expected) => Err(InferenceError::Shape(format!(
                "output layout changed after load: expected {:?}, confidence head present: {}",
                expected,
                found.is_some()
            ))),
        }
    }
}

/// A loaded network in inference mode.
pub trait Network: Send + Sync {
    fn architecture(&self) -> &str;

    fn layout(&self) -> OutputLayout;

    /// Runs a forward pass on an NCHW batch.
    fn forward(&self, input: &Array4<f32>) -> Result<RawOutput, InferenceError>;
}

/// Turns a weight file plus metadata into a ready [`Network`].
pub trait ModelLoader: Send + Sync {
    fn device(&self) -> String;

    fn load(&self, weights: &Path, metadata: &ModelMetadata) -> Result<Box<dyn Network>, LoadError>;
}
