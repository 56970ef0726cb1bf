use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub accuracy: Option<f32>,
    pub precision: Option<f32>,
    pub recall: Option<f32>,
    pub f1_score: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingInfo {
    pub training_date: Option<String>,
    /// Seconds.
    pub training_duration: Option<f64>,
    pub dataset_size: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub id: Uuid,
    pub name: String,
    pub version: String,
    pub file_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    pub model_type: String,
    pub num_classes: usize,
    pub input_shape: Vec<i64>,
    pub confidence_threshold: f32,
    #[serde(default)]
    pub metrics: PerformanceMetrics,
    #[serde(default)]
    pub training: TrainingInfo,
    pub is_active: bool,
    pub is_production: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything needed to register a new artifact.
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    pub file_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    pub model_type: String,
    pub num_classes: usize,
    pub input_shape: Vec<i64>,
    pub confidence_threshold: f32,
    pub metrics: PerformanceMetrics,
    pub training: TrainingInfo,
    pub activate: bool,
}

impl ArtifactDescriptor {
    pub fn new(name: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            version: "1.0.0".to_string(),
            file_path: file_path.into(),
            metadata_path: None,
            model_type: "efficientnet".to_string(),
            num_classes: 6,
            input_shape: vec![1, 3, 320, 320],
            confidence_threshold: 0.7,
            metrics: PerformanceMetrics::default(),
            training: TrainingInfo::default(),
            activate: false,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_metadata_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.metadata_path = Some(path.into());
        self
    }

    pub fn activated(mut self) -> Self {
        self.activate = true;
        self
    }
}

impl ModelArtifact {
    pub fn from_descriptor(descriptor: ArtifactDescriptor) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: descriptor.name,
            version: descriptor.version,
            file_path: descriptor.file_path,
            metadata_path: descriptor.metadata_path,
            model_type: descriptor.model_type,
            num_classes: descriptor.num_classes,
            input_shape: descriptor.input_shape,
            confidence_threshold: descriptor.confidence_threshold,
            metrics: descriptor.metrics,
            training: descriptor.training,
            is_active: descriptor.activate,
            is_production: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn file_exists(&self) -> bool {
        self.file_path.is_file()
    }

    pub fn points_to(&self, path: &Path) -> bool {
        self.file_path == path
    }

    pub fn set_active(&mut self, active: bool) {
        if self.is_active != active {
            self.is_active = active;
            self.updated_at = Utc::now();
        }
    }

    pub fn set_production(&mut self, production: bool) {
        self.is_production = production;
        self.updated_at = Utc::now();
    }
}
