use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

use crate::batch::models::{BatchJob, ClassificationRecord, ImageRecord};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Image not found: {0}")]
    ImageNotFound(Uuid),
    #[error("Image {image_id} does not belong to user {owner_id}")]
    NotOwned { image_id: Uuid, owner_id: Uuid },
    #[error("Batch job not found: {0}")]
    JobNotFound(Uuid),
    #[error("Storage error: {0}")]
    Backend(String),
}

/// Source of images to classify and sink for their results.
pub trait ImageRepository: Send + Sync {
    /// Images the job should process, in upload order.
    fn resolve(&self, job: &BatchJob) -> Result<Vec<ImageRecord>, StoreError>;

    fn is_classified(&self, image_id: Uuid) -> Result<bool, StoreError>;

    fn save_classification(&self, record: ClassificationRecord) -> Result<(), StoreError>;
}

/// Bookkeeping for batch job state.
pub trait BatchJobStore: Send + Sync {
    fn save(&self, job: &BatchJob) -> Result<(), StoreError>;

    fn get(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError>;
}

#[derive(Default)]
struct MemoryState {
    images: Vec<ImageRecord>,
    results: Vec<ClassificationRecord>,
    classified: HashSet<Uuid>,
    jobs: HashMap<Uuid, BatchJob>,
}

/// In-process store implementing both collaborator traits.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_image(&self, image: ImageRecord) -> Uuid {
        let id = image.id;
        self.state().images.push(image);
        id
    }

    pub fn image(&self, id: Uuid) -> Option<ImageRecord> {
        self.state().images.iter().find(|i| i.id == id).cloned()
    }

    pub fn list_results(&self, owner_id: Uuid) -> Vec<ClassificationRecord> {
        self.state()
            .results
            .iter()
            .filter(|r| r.owner_id == owner_id)
            .cloned()
            .collect()
    }

    pub fn results_for_batch(&self, batch_id: Uuid) -> Vec<ClassificationRecord> {
        self.state()
            .results
            .iter()
            .filter(|r| r.batch_id == Some(batch_id))
            .cloned()
            .collect()
    }
}

impl ImageRepository for MemoryStore {
    fn resolve(&self, job: &BatchJob) -> Result<Vec<ImageRecord>, StoreError> {
        let state = self.state();
        match &job.image_ids {
            Some(ids) => ids
                .iter()
                .map(|id| {
                    let image = state
                        .images
                        .iter()
                        .find(|i| i.id == *id)
                        .ok_or(StoreError::ImageNotFound(*id))?;
                    if image.owner_id != job.owner_id {
                        return Err(StoreError::NotOwned {
                            image_id: *id,
                            owner_id: job.owner_id,
                        });
                    }
                    Ok(image.clone())
                })
                .collect(),
            None => Ok(state
                .images
                .iter()
                .filter(|i| i.owner_id == job.owner_id && !state.classified.contains(&i.id))
                .cloned()
                .collect()),
        }
    }

    fn is_classified(&self, image_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.state().classified.contains(&image_id))
    }

    fn save_classification(&self, record: ClassificationRecord) -> Result<(), StoreError> {
        let mut state = self.state();
        state.classified.insert(record.image_id);
        state.results.push(record);
        Ok(())
    }
}

impl BatchJobStore for MemoryStore {
    fn save(&self, job: &BatchJob) -> Result<(), StoreError> {
        self.state().jobs.insert(job.id, job.clone());
        Ok(())
    }

    fn get(&self, id: Uuid) -> Result<Option<BatchJob>, StoreError> {
        Ok(self.state().jobs.get(&id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn implicit_selection_skips_classified_images() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let first = store.add_image(ImageRecord::new(owner, vec![1u8]));
        let second = store.add_image(ImageRecord::new(owner, vec![2u8]));
        store.add_image(ImageRecord::new(Uuid::new_v4(), vec![3u8]));

        let image = store.image(first).unwrap();
        let record = ClassificationRecord {
            id: Uuid::new_v4(),
            image_id: first,
            batch_id: None,
            owner_id: owner,
            predicted_class: "unripe".to_string(),
            confidence: 0.9,
            is_valid_subject: true,
            probabilities: Default::default(),
            model_id: None,
            processing_time: 0.1,
            classified_at: image.uploaded_at,
        };
        store.save_classification(record).unwrap();

        let resolved = store.resolve(&BatchJob::new(owner)).unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, second);
    }

    #[test]
    fn explicit_selection_checks_ownership() {
        let store = MemoryStore::new();
        let owner = Uuid::new_v4();
        let foreign = store.add_image(ImageRecord::new(Uuid::new_v4(), vec![1u8]));

        let job = BatchJob::new(owner).with_images(vec![foreign]);
        assert!(matches!(
            store.resolve(&job),
            Err(StoreError::NotOwned { .. })
        ));

        let job = BatchJob::new(owner).with_images(vec![Uuid::new_v4()]);
        assert!(matches!(store.resolve(&job), Err(StoreError::ImageNotFound(_))));
    }
}
