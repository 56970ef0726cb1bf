pub mod models;
pub mod repository;

pub use models::{ArtifactDescriptor, ModelArtifact, PerformanceMetrics, TrainingInfo};
pub use repository::{JsonModelRegistry, ModelRegistry, RegistryError};
