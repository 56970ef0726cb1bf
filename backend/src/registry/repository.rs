use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::registry::models::{ArtifactDescriptor, ModelArtifact};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Model artifact not found: {0}")]
    NotFound(Uuid),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Record store for model artifacts. Implementations keep at most one record
/// flagged active.
pub trait ModelRegistry: Send + Sync {
    fn get_active(&self) -> Result<Option<ModelArtifact>, RegistryError>;

    fn get(&self, id: Uuid) -> Result<Option<ModelArtifact>, RegistryError>;

    fn find_by_path(&self, path: &Path) -> Result<Option<ModelArtifact>, RegistryError>;

    fn list(&self) -> Result<Vec<ModelArtifact>, RegistryError>;

    /// Deactivates every other record and activates `id`.
    fn set_active(&self, id: Uuid) -> Result<ModelArtifact, RegistryError>;

    fn clear_active(&self) -> Result<(), RegistryError>;

    fn register(&self, descriptor: ArtifactDescriptor) -> Result<ModelArtifact, RegistryError>;

    fn set_production(&self, id: Uuid, production: bool) -> Result<ModelArtifact, RegistryError>;
}

/// Registry backed by a JSON file holding the full record list.
pub struct JsonModelRegistry {
    path: Option<PathBuf>,
    records: Mutex<Vec<ModelArtifact>>,
}

impl JsonModelRegistry {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let records = if path.exists() {
            let contents = fs::read_to_string(&path)?;
            if contents.trim().is_empty() {
                Vec::new()
            } else {
                serde_json::from_str::<Vec<ModelArtifact>>(&contents)?
            }
        } else {
            Vec::new()
        };
        log::info!(
            "Opened model registry at {} with {} record(s)",
            path.display(),
            records.len()
        );
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }

    fn records(&self) -> MutexGuard<'_, Vec<ModelArtifact>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, records: &[ModelArtifact]) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_vec_pretty(records)?)?;
        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    /// Applies `mutate` and persists. The in-memory list is only replaced once
    /// the write succeeded.
    fn update<T, F>(&self, mutate: F) -> Result<T, RegistryError>
    where
        F: FnOnce(&mut Vec<ModelArtifact>) -> Result<T, RegistryError>,
    {
        let mut records = self.records();
        let mut next = records.clone();
        let value = mutate(&mut next)?;
        self.persist(&next)?;
        *records = next;
        Ok(value)
    }
}

impl ModelRegistry for JsonModelRegistry {
    fn get_active(&self) -> Result<Option<ModelArtifact>, RegistryError> {
        Ok(self.records().iter().find(|a| a.is_active).cloned())
    }

    fn get(&self, id: Uuid) -> Result<Option<ModelArtifact>, RegistryError> {
        Ok(self.records().iter().find(|a| a.id == id).cloned())
    }

    fn find_by_path(&self, path: &Path) -> Result<Option<ModelArtifact>, RegistryError> {
        Ok(self.records().iter().find(|a| a.points_to(path)).cloned())
    }

    fn list(&self) -> Result<Vec<ModelArtifact>, RegistryError> {
        let mut records = self.records().clone();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    fn set_active(&self, id: Uuid) -> Result<ModelArtifact, RegistryError> {
        let artifact = self.update(|records| {
            if !records.iter().any(|a| a.id == id) {
                return Err(RegistryError::NotFound(id));
            }
            let mut activated = None;
            for record in records.iter_mut() {
                record.set_active(record.id == id);
                if record.id == id {
                    activated = Some(record.clone());
                }
            }
            activated.ok_or(RegistryError::NotFound(id))
        })?;
        log::info!("Activated model {} ({} {})", artifact.id, artifact.name, artifact.version);
        Ok(artifact)
    }

    fn clear_active(&self) -> Result<(), RegistryError> {
        self.update(|records| {
            for record in records.iter_mut() {
                record.set_active(false);
            }
            Ok(())
        })
    }

    fn register(&self, descriptor: ArtifactDescriptor) -> Result<ModelArtifact, RegistryError> {
        let artifact = ModelArtifact::from_descriptor(descriptor);
        let created = artifact.clone();
        self.update(move |records| {
            if artifact.is_active {
                for record in records.iter_mut() {
                    record.set_active(false);
                }
            }
            records.push(artifact);
            Ok(())
        })?;
        log::info!(
            "Registered model {} ({}) from {}",
            created.id,
            created.name,
            created.file_path.display()
        );
        Ok(created)
    }

    fn set_production(&self, id: Uuid, production: bool) -> Result<ModelArtifact, RegistryError> {
        self.update(|records| {
            let record = records
                .iter_mut()
                .find(|a| a.id == id)
                .ok_or(RegistryError::NotFound(id))?;
            record.set_production(production);
            Ok(record.clone())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn descriptor(name: &str) -> ArtifactDescriptor {
        ArtifactDescriptor::new(name, format!("/models/{name}.pt"))
    }

    #[test]
    fn activation_keeps_a_single_active_record() {
        let registry = JsonModelRegistry::in_memory();
        let first = registry.register(descriptor("first").activated()).unwrap();
        let second = registry.register(descriptor("second").activated()).unwrap();

        let active = registry.get_active().unwrap().unwrap();
        assert_eq!(active.id, second.id);

        registry.set_active(first.id).unwrap();
        let records = registry.list().unwrap();
        assert_eq!(records.iter().filter(|a| a.is_active).count(), 1);
        assert_eq!(registry.get_active().unwrap().unwrap().id, first.id);
    }

    #[test]
    fn unknown_id_leaves_activation_untouched() {
        let registry = JsonModelRegistry::in_memory();
        let current = registry.register(descriptor("current").activated()).unwrap();

        let err = registry.set_active(Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, RegistryError::NotFound(_)));
        assert_eq!(registry.get_active().unwrap().unwrap().id, current.id);
    }

    #[test]
    fn records_survive_reopening() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");

        let registry = JsonModelRegistry::open(&path).unwrap();
        let artifact = registry.register(descriptor("persisted").activated()).unwrap();
        registry.set_production(artifact.id, true).unwrap();
        drop(registry);

        let reopened = JsonModelRegistry::open(&path).unwrap();
        let active = reopened.get_active().unwrap().unwrap();
        assert_eq!(active.id, artifact.id);
        assert!(active.is_production);
        assert_eq!(
            reopened
                .find_by_path(Path::new("/models/persisted.pt"))
                .unwrap()
                .map(|a| a.id),
            Some(artifact.id)
        );
    }
}
