use std::path::PathBuf;
use uuid::Uuid;

use crate::registry::RegistryError;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Invalid image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("Failed to read image {path}: {source}")]
    ImageIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Model artifact not found: {0}")]
    NotFound(Uuid),
    #[error("Model file does not exist: {0}")]
    MissingFile(PathBuf),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("Model loading failed: {0}")]
    Load(#[from] LoadError),
    #[error("Model unavailable: {0}")]
    Unavailable(String),
    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),
}

impl ClassifierError {
    /// True for errors caused by the caller's input rather than model state.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ClassifierError::InvalidImage(_) | ClassifierError::ImageIo { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("No model artifact is registered and no weight file was found in {0}")]
    NoArtifact(PathBuf),
    #[error("Weight file does not exist: {0}")]
    MissingWeights(PathBuf),
    #[error("Invalid metadata file {path}: {message}")]
    Metadata { path: PathBuf, message: String },
    #[error("Unsupported checkpoint: {0}")]
    Checkpoint(String),
    #[error("Backend error: {0}")]
    Backend(String),
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("Unexpected model output: {0}")]
    Shape(String),
    #[error("Backend error: {0}")]
    Backend(String),
}
