use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::classifier::metadata::{DEFAULT_CONFIDENCE_THRESHOLD, DEFAULT_INPUT_SIZE};

const DEFAULT_CONFIG_PATH: &str = "config/classifier.yaml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid value for {key}: {value}")]
    InvalidOverride { key: String, value: String },
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PreprocessBackend {
    #[default]
    Ndarray,
    Scalar,
}

impl PreprocessBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            PreprocessBackend::Ndarray => "ndarray",
            PreprocessBackend::Scalar => "scalar",
        }
    }
}

impl std::str::FromStr for PreprocessBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ndarray" => Ok(PreprocessBackend::Ndarray),
            "scalar" => Ok(PreprocessBackend::Scalar),
            other => Err(format!("unknown preprocessing backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8081,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub model_dir: PathBuf,
    /// Registry file; `None` keeps the registry in memory only.
    pub registry_path: Option<PathBuf>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub preprocessing: PreprocessBackend,
    pub weight_extensions: Vec<String>,
    pub server: ServerConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("models"),
            registry_path: Some(PathBuf::from("models/registry.json")),
            input_size: DEFAULT_INPUT_SIZE,
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            preprocessing: PreprocessBackend::default(),
            weight_extensions: vec!["pt".to_string(), "pth".to_string()],
            server: ServerConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config_str = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, ConfigError> {
        let config: ServiceConfig = serde_yaml::from_str(config_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads the YAML file named by `PLUM_CONFIG` (or the default location when
    /// it exists), then applies environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let explicit = std::env::var("PLUM_CONFIG").ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::load(&path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                Self::load(Path::new(DEFAULT_CONFIG_PATH))?
            }
            None => {
                log::info!("No config file found, using defaults");
                Self::default()
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(dir) = lookup("PLUM_MODEL_DIR") {
            self.model_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("PLUM_REGISTRY_PATH") {
            self.registry_path = if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            };
        }
        if let Some(value) = lookup("PLUM_INPUT_SIZE") {
            self.input_size = parse_override("PLUM_INPUT_SIZE", &value)?;
        }
        if let Some(value) = lookup("PLUM_CONFIDENCE_THRESHOLD") {
            self.confidence_threshold = parse_override("PLUM_CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = lookup("PLUM_PREPROCESSING") {
            self.preprocessing = parse_override("PLUM_PREPROCESSING", &value)?;
        }
        if let Some(host) = lookup("HOST") {
            self.server.host = host;
        }
        if let Some(value) = lookup("PORT") {
            self.server.port = parse_override("PORT", &value)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.input_size == 0 {
            return Err(ConfigError::Invalid(
                "input_size must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.weight_extensions.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one weight file extension is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_override<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidOverride {
            key: key.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn yaml_fills_missing_fields_with_defaults() {
        let config = ServiceConfig::from_yaml(
            "model_dir: /srv/models\ninput_size: 224\npreprocessing: scalar\n",
        )
        .unwrap();

        assert_eq!(config.model_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.input_size, 224);
        assert_eq!(config.preprocessing, PreprocessBackend::Scalar);
        assert_eq!(config.confidence_threshold, DEFAULT_CONFIDENCE_THRESHOLD);
        assert_eq!(config.server.port, 8081);
    }

    #[test]
    fn overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("PLUM_MODEL_DIR", "/tmp/weights"),
            ("PLUM_CONFIDENCE_THRESHOLD", "0.55"),
            ("PLUM_REGISTRY_PATH", ""),
            ("PORT", "9000"),
        ]);
        let mut config = ServiceConfig::default();
        config
            .apply_overrides(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.model_dir, PathBuf::from("/tmp/weights"));
        assert_eq!(config.confidence_threshold, 0.55);
        assert!(config.registry_path.is_none());
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
    }

    #[test]
    fn rejects_bad_values() {
        let mut config = ServiceConfig::default();
        let err = config
            .apply_overrides(|key| (key == "PLUM_INPUT_SIZE").then(|| "big".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidOverride { .. }));

        assert!(ServiceConfig::from_yaml("confidence_threshold: 1.5\n").is_err());
        assert!(ServiceConfig::from_yaml("input_size: 0\n").is_err());
    }
}
