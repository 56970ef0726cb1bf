use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::classifier::error::LoadError;
use crate::registry::{ArtifactDescriptor, PerformanceMetrics, TrainingInfo};

pub const DEFAULT_INPUT_SIZE: u32 = 320;
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.7;
pub const DEFAULT_DROPOUT_RATE: f32 = 0.4;
pub const DEFAULT_ARCHITECTURE: &str = "efficientnet_b4";
pub const DEFAULT_MODEL_TYPE: &str = "efficientnet";
pub const DEFAULT_VERSION: &str = "1.0.0";

lazy_static! {
    pub static ref DEFAULT_CLASS_MAPPING: ClassMapping = ClassMapping::new([
        "good_quality",
        "unripe",
        "spotted",
        "cracked",
        "bruised",
        "rotten",
    ]);
}

/// Index to class-name mapping of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassMapping(BTreeMap<usize, String>);

impl ClassMapping {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            names
                .into_iter()
                .enumerate()
                .map(|(i, name)| (i, name.into()))
                .collect(),
        )
    }

    /// Parses the `{"0": "good_quality", ...}` shape used in metadata files.
    pub fn from_string_keys(raw: &HashMap<String, String>) -> Result<Self, String> {
        let mut mapping = BTreeMap::new();
        for (key, name) in raw {
            let idx = key
                .trim()
                .parse::<usize>()
                .map_err(|_| format!("class index '{}' is not a number", key))?;
            if mapping.insert(idx, name.clone()).is_some() {
                return Err(format!("class index {} is listed twice", idx));
            }
        }
        // names key the probability map
        let mut seen = HashSet::new();
        if let Some(name) = mapping.values().find(|name| !seen.insert(name.as_str())) {
            return Err(format!("class name '{}' is used by more than one index", name));
        }
        Ok(Self(mapping))
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        self.0.get(&idx).map(String::as_str)
    }

    /// Name used as the probability-map key; unnamed indices become `class_{i}`.
    pub fn label(&self, idx: usize) -> String {
        self.name(idx)
            .map(str::to_string)
            .unwrap_or_else(|| format!("class_{}", idx))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &str)> {
        self.0.iter().map(|(i, name)| (*i, name.as_str()))
    }
}

/// The metadata JSON written next to a weight file at training time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawMetadata {
    pub model_name: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub model_type: Option<String>,
    pub num_classes: Option<usize>,
    pub confidence_threshold: Option<f32>,
    pub input_size: Option<u32>,
    pub input_shape: Option<Vec<i64>>,
    pub dropout_rate: Option<f32>,
    pub idx_to_class: Option<HashMap<String, String>>,
    /// TorchScript file holding the architecture that state-dict weights load into.
    pub architecture_file: Option<String>,
    pub accuracy: Option<f32>,
    pub precision: Option<f32>,
    pub recall: Option<f32>,
    pub f1_score: Option<f32>,
    pub training_date: Option<String>,
    pub training_duration: Option<f64>,
    pub dataset_size: Option<u64>,
}

/// Fallbacks taken from service configuration.
#[derive(Debug, Clone, Copy)]
pub struct MetadataDefaults {
    pub input_size: u32,
    pub confidence_threshold: f32,
}

impl Default for MetadataDefaults {
    fn default() -> Self {
        Self {
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelMetadata {
    pub name: String,
    pub version: String,
    pub architecture: String,
    pub model_type: String,
    pub num_classes: usize,
    pub classes: ClassMapping,
    pub confidence_threshold: f32,
    pub input_size: u32,
    pub input_shape: Vec<i64>,
    pub dropout_rate: f32,
    pub architecture_file: Option<PathBuf>,
    pub metrics: PerformanceMetrics,
    pub training: TrainingInfo,
}

/// `weights/plum_v2.pt` -> `weights/plum_v2_metadata.json`.
pub fn metadata_path_for(weights: &Path) -> PathBuf {
    let stem = weights
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    weights.with_file_name(format!("{}_metadata.json", stem))
}

impl ModelMetadata {
    /// Reads `path` when given and present, otherwise applies defaults.
    pub fn load(path: Option<&Path>, defaults: MetadataDefaults) -> Result<Self, LoadError> {
        let raw = match path {
            Some(path) if path.is_file() => {
                let contents = std::fs::read_to_string(path)?;
                serde_json::from_str::<RawMetadata>(&contents).map_err(|e| {
                    LoadError::Metadata {
                        path: path.to_path_buf(),
                        message: e.to_string(),
                    }
                })?
            }
            Some(path) => {
                log::warn!(
                    "Metadata file {} not found, using defaults",
                    path.display()
                );
                RawMetadata::default()
            }
            None => RawMetadata::default(),
        };

        let base_dir = path.and_then(Path::parent);
        Self::from_raw(raw, defaults, base_dir).map_err(|message| LoadError::Metadata {
            path: path.map(Path::to_path_buf).unwrap_or_default(),
            message,
        })
    }

    pub fn from_raw(
        raw: RawMetadata,
        defaults: MetadataDefaults,
        base_dir: Option<&Path>,
    ) -> Result<Self, String> {
        let classes = match &raw.idx_to_class {
            Some(map) if !map.is_empty() => ClassMapping::from_string_keys(map)?,
            _ => DEFAULT_CLASS_MAPPING.clone(),
        };
        let num_classes = raw.num_classes.unwrap_or(classes.len());
        if num_classes == 0 {
            return Err("num_classes must be greater than 0".to_string());
        }

        let input_size = raw
            .input_size
            .or_else(|| {
                raw.input_shape
                    .as_ref()
                    .and_then(|shape| shape.last())
                    .and_then(|&side| u32::try_from(side).ok())
            })
            .unwrap_or(defaults.input_size);
        if input_size == 0 {
            return Err("input_size must be greater than 0".to_string());
        }
        let input_shape = raw
            .input_shape
            .clone()
            .unwrap_or_else(|| vec![1, 3, input_size as i64, input_size as i64]);

        let confidence_threshold = raw
            .confidence_threshold
            .unwrap_or(defaults.confidence_threshold);

        let architecture_file = raw.architecture_file.as_ref().map(|file| {
            let file = PathBuf::from(file);
            match base_dir {
                Some(dir) if file.is_relative() => dir.join(file),
                _ => file,
            }
        });

        let architecture = raw
            .model_name
            .clone()
            .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string());

        Ok(Self {
            name: raw
                .name
                .clone()
                .or_else(|| raw.model_name.clone())
                .unwrap_or_else(|| "plum_classifier".to_string()),
            version: raw
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            architecture,
            model_type: raw
                .model_type
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL_TYPE.to_string()),
            num_classes,
            classes,
            confidence_threshold,
            input_size,
            input_shape,
            dropout_rate: raw.dropout_rate.unwrap_or(DEFAULT_DROPOUT_RATE),
            architecture_file,
            metrics: PerformanceMetrics {
                accuracy: raw.accuracy,
                precision: raw.precision,
                recall: raw.recall,
                f1_score: raw.f1_score,
            },
            training: TrainingInfo {
                training_date: raw.training_date,
                training_duration: raw.training_duration,
                dataset_size: raw.dataset_size,
            },
        })
    }

    pub fn descriptor(&self, weights: &Path, metadata_path: Option<&Path>) -> ArtifactDescriptor {
        ArtifactDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            file_path: weights.to_path_buf(),
            metadata_path: metadata_path.map(Path::to_path_buf),
            model_type: self.model_type.clone(),
            num_classes: self.num_classes,
            input_shape: self.input_shape.clone(),
            confidence_threshold: self.confidence_threshold,
            metrics: self.metrics.clone(),
            training: self.training.clone(),
            activate: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_metadata_uses_defaults() {
        let metadata = ModelMetadata::load(None, MetadataDefaults::default()).unwrap();

        assert_eq!(metadata.num_classes, 6);
        assert_eq!(metadata.classes.name(0), Some("good_quality"));
        assert_eq!(metadata.classes.name(5), Some("rotten"));
        assert_eq!(metadata.confidence_threshold, 0.7);
        assert_eq!(metadata.input_size, 320);
        assert_eq!(metadata.input_shape, vec![1, 3, 320, 320]);
        assert_eq!(metadata.architecture, "efficientnet_b4");
    }

    #[test]
    fn parses_training_metadata() {
        let raw: RawMetadata = serde_json::from_str(
            r#"{
                "model_name": "efficientnet_b0",
                "version": "2.1.0",
                "num_classes": 3,
                "confidence_threshold": 0.6,
                "input_shape": [1, 3, 224, 224],
                "idx_to_class": {"0": "ripe", "1": "unripe", "2": "rotten"},
                "architecture_file": "arch.pt",
                "accuracy": 0.93
            }"#,
        )
        .unwrap();

        let metadata =
            ModelMetadata::from_raw(raw, MetadataDefaults::default(), Some(Path::new("/m")))
                .unwrap();

        assert_eq!(metadata.version, "2.1.0");
        assert_eq!(metadata.num_classes, 3);
        assert_eq!(metadata.input_size, 224);
        assert_eq!(metadata.classes.label(1), "unripe");
        assert_eq!(metadata.classes.label(7), "class_7");
        assert_eq!(metadata.architecture_file, Some(PathBuf::from("/m/arch.pt")));
        assert_eq!(metadata.metrics.accuracy, Some(0.93));
    }

    #[test]
    fn rejects_non_numeric_class_keys() {
        let raw = RawMetadata {
            idx_to_class: Some(HashMap::from([("first".to_string(), "ripe".to_string())])),
            ..RawMetadata::default()
        };
        assert!(ModelMetadata::from_raw(raw, MetadataDefaults::default(), None).is_err());
    }

    #[test]
    fn rejects_duplicate_class_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plum_metadata.json");
        std::fs::write(
            &path,
            r#"{"num_classes": 3, "idx_to_class": {"0": "ripe", "1": "ripe", "2": "rotten"}}"#,
        )
        .unwrap();

        let err = ModelMetadata::load(Some(&path), MetadataDefaults::default()).unwrap_err();
        match err {
            LoadError::Metadata { message, .. } => assert!(message.contains("'ripe'")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn metadata_sits_next_to_weights() {
        assert_eq!(
            metadata_path_for(Path::new("/srv/models/plum_v2.pt")),
            PathBuf::from("/srv/models/plum_v2_metadata.json")
        );
    }
}
