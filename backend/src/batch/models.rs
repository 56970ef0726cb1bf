use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{BatchStatus, PredictionResult};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::classifier::ImageInput;

#[derive(Debug, thiserror::Error)]
#[error("Invalid batch status transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: BatchStatus,
    pub to: BatchStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub status: BatchStatus,
    /// Explicit selection; `None` means every unclassified image of the owner.
    pub image_ids: Option<Vec<Uuid>>,
    pub use_tta: bool,
    pub save_results: bool,
    pub total_count: usize,
    pub processed_count: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl BatchJob {
    pub fn new(owner_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            owner_id,
            status: BatchStatus::Pending,
            image_ids: None,
            use_tta: false,
            save_results: true,
            total_count: 0,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn with_images(mut self, image_ids: Vec<Uuid>) -> Self {
        self.image_ids = Some(image_ids);
        self
    }

    pub fn with_tta(mut self, use_tta: bool) -> Self {
        self.use_tta = use_tta;
        self
    }

    pub fn with_save_results(mut self, save_results: bool) -> Self {
        self.save_results = save_results;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Moves the job forward; status never goes back except through [`BatchJob::restart`].
    pub fn transition(&mut self, next: BatchStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        let now = Utc::now();
        match next {
            BatchStatus::Processing => self.started_at = Some(now),
            BatchStatus::Completed | BatchStatus::Failed => self.completed_at = Some(now),
            BatchStatus::Pending => {}
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        if self.status.can_transition_to(BatchStatus::Failed) {
            let _ = self.transition(BatchStatus::Failed);
        } else {
            self.touch();
        }
    }

    /// Resets a finished job so it can run again.
    pub fn restart(&mut self) -> Result<(), InvalidTransition> {
        if !self.status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: BatchStatus::Pending,
            });
        }
        self.status = BatchStatus::Pending;
        self.total_count = 0;
        self.processed_count = 0;
        self.success_count = 0;
        self.error_count = 0;
        self.started_at = None;
        self.completed_at = None;
        self.error = None;
        self.touch();
        Ok(())
    }

    pub fn progress_percentage(&self) -> u32 {
        if self.total_count == 0 {
            return 0;
        }
        (self.processed_count * 100 / self.total_count) as u32
    }
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub source: ImageInput,
    pub uploaded_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(owner_id: Uuid, source: impl Into<ImageInput>) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner_id,
            source: source.into(),
            uploaded_at: Utc::now(),
        }
    }
}

/// Persisted outcome of classifying one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassificationRecord {
    pub id: Uuid,
    pub image_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub owner_id: Uuid,
    pub predicted_class: String,
    pub confidence: f32,
    pub is_valid_subject: bool,
    pub probabilities: BTreeMap<String, f32>,
    pub model_id: Option<Uuid>,
    pub processing_time: f64,
    pub classified_at: DateTime<Utc>,
}

impl ClassificationRecord {
    pub fn from_prediction(
        image: &ImageRecord,
        batch_id: Option<Uuid>,
        result: &PredictionResult,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_id: image.id,
            batch_id,
            owner_id: image.owner_id,
            predicted_class: result.predicted_class.clone(),
            confidence: result.confidence,
            is_valid_subject: result.is_valid_subject,
            probabilities: result.probabilities.clone(),
            model_id: result.model_id,
            processing_time: result.processing_time,
            classified_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_moves_forward() {
        let mut job = BatchJob::new(Uuid::new_v4());
        job.transition(BatchStatus::Processing).unwrap();
        assert!(job.started_at.is_some());
        job.transition(BatchStatus::Completed).unwrap();
        assert!(job.completed_at.is_some());

        let err = job.transition(BatchStatus::Processing).unwrap_err();
        assert_eq!(err.from, BatchStatus::Completed);
        assert_eq!(job.status, BatchStatus::Completed);
    }

    #[test]
    fn restart_resets_a_finished_job() {
        let mut job = BatchJob::new(Uuid::new_v4());
        assert!(job.restart().is_err());

        job.transition(BatchStatus::Processing).unwrap();
        job.total_count = 4;
        job.processed_count = 2;
        job.fail("store offline");
        assert_eq!(job.status, BatchStatus::Failed);

        job.restart().unwrap();
        assert_eq!(job.status, BatchStatus::Pending);
        assert_eq!(job.processed_count, 0);
        assert!(job.error.is_none());
    }

    #[test]
    fn progress_handles_empty_batches() {
        let mut job = BatchJob::new(Uuid::new_v4());
        assert_eq!(job.progress_percentage(), 0);

        job.total_count = 3;
        job.processed_count = 2;
        assert_eq!(job.progress_percentage(), 66);
    }
}
