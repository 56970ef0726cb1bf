use shared::BatchStatus;
use std::sync::Arc;

use crate::batch::models::{BatchJob, ClassificationRecord, ImageRecord, InvalidTransition};
use crate::batch::store::{BatchJobStore, ImageRepository, StoreError};
use crate::classifier::{ClassifierError, ClassifierService};
use crate::notify::{classification_payload, notify_batch_progress, user_topic, Notifier};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error(transparent)]
    Transition(#[from] InvalidTransition),
    #[error("Failed to resolve batch images: {0}")]
    Resolve(#[source] StoreError),
    #[error("Failed to save batch state: {0}")]
    Bookkeeping(#[source] StoreError),
}

#[derive(Debug, thiserror::Error)]
enum ImageFailure {
    #[error(transparent)]
    Classifier(#[from] ClassifierError),
    #[error("{0}")]
    Prediction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

enum Outcome {
    Classified,
    Skipped,
}

/// Classifies every image of a batch job, keeping counts and subscribers up
/// to date after each image.
pub struct BatchRunner {
    classifier: Arc<ClassifierService>,
    images: Arc<dyn ImageRepository>,
    jobs: Arc<dyn BatchJobStore>,
    notifier: Arc<dyn Notifier>,
}

impl BatchRunner {
    pub fn new(
        classifier: Arc<ClassifierService>,
        images: Arc<dyn ImageRepository>,
        jobs: Arc<dyn BatchJobStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            classifier,
            images,
            jobs,
            notifier,
        }
    }

    /// Runs the job to completion. Returns `false` when the job ended up
    /// `failed`; per-image failures only show in the counts.
    pub fn run(&self, job: &mut BatchJob) -> bool {
        match self.execute(job) {
            Ok(()) => {
                log::info!(
                    "Batch {} completed: {} processed, {} succeeded, {} failed",
                    job.id,
                    job.processed_count,
                    job.success_count,
                    job.error_count
                );
                true
            }
            Err(e) => {
                log::error!("Batch {} failed: {}", job.id, e);
                job.fail(e.to_string());
                if let Err(save_err) = self.jobs.save(job) {
                    log::error!("Failed to record failure of batch {}: {}", job.id, save_err);
                }
                notify_batch_progress(self.notifier.as_ref(), job);
                false
            }
        }
    }

    fn checkpoint(&self, job: &BatchJob) -> Result<(), BatchError> {
        self.jobs.save(job).map_err(BatchError::Bookkeeping)?;
        notify_batch_progress(self.notifier.as_ref(), job);
        Ok(())
    }

    fn execute(&self, job: &mut BatchJob) -> Result<(), BatchError> {
        job.transition(BatchStatus::Processing)?;
        self.checkpoint(job)?;

        let images = self.images.resolve(job).map_err(BatchError::Resolve)?;
        job.total_count = images.len();
        job.touch();
        self.jobs.save(job).map_err(BatchError::Bookkeeping)?;
        log::info!("Batch {}: {} image(s) to classify", job.id, images.len());

        for image in &images {
            self.process_image(job, image);
            job.processed_count += 1;
            job.touch();
            self.checkpoint(job)?;
        }

        // the job only becomes completed once that state is stored
        let mut finished = job.clone();
        finished.transition(BatchStatus::Completed)?;
        self.jobs.save(&finished).map_err(BatchError::Bookkeeping)?;
        *job = finished;
        notify_batch_progress(self.notifier.as_ref(), job);
        Ok(())
    }

    fn process_image(&self, job: &mut BatchJob, image: &ImageRecord) {
        match self.classify_image(job, image) {
            Ok(Outcome::Classified) => job.success_count += 1,
            Ok(Outcome::Skipped) => {
                log::debug!("Batch {}: image {} already classified", job.id, image.id);
            }
            Err(e) => {
                log::warn!("Batch {}: image {} failed: {}", job.id, image.id, e);
                job.error_count += 1;
            }
        }
    }

    fn classify_image(&self, job: &BatchJob, image: &ImageRecord) -> Result<Outcome, ImageFailure> {
        if self.images.is_classified(image.id)? {
            return Ok(Outcome::Skipped);
        }

        let result = self
            .classifier
            .classify(image.source.clone(), job.use_tta)?;
        if let Some(error) = &result.error {
            return Err(ImageFailure::Prediction(error.clone()));
        }

        if job.save_results {
            self.images
                .save_classification(ClassificationRecord::from_prediction(image, Some(job.id), &result))?;
        }
        self.notifier
            .notify(&user_topic(job.owner_id), classification_payload(image, &result));
        Ok(Outcome::Classified)
    }
}
