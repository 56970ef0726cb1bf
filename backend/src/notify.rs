use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::batch::models::{BatchJob, ImageRecord};
use shared::PredictionResult;

/// Realtime fan-out channel. Delivery is best effort.
pub trait Notifier: Send + Sync {
    fn notify(&self, topic: &str, payload: Value);
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub topic: String,
    pub payload: Value,
}

/// Publishes notifications on a tokio broadcast channel.
pub struct BroadcastNotifier {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl Notifier for BroadcastNotifier {
    fn notify(&self, topic: &str, payload: Value) {
        let notification = Notification {
            topic: topic.to_string(),
            payload,
        };
        if self.tx.send(notification).is_err() {
            log::debug!("No subscribers for topic {}", topic);
        }
    }
}

pub fn user_topic(owner_id: Uuid) -> String {
    format!("classifications_{}", owner_id)
}

pub fn batch_topic(batch_id: Uuid) -> String {
    format!("batch_{}", batch_id)
}

pub fn batch_progress_payload(job: &BatchJob) -> Value {
    json!({
        "type": "batch_progress",
        "batch_id": job.id.to_string(),
        "total_images": job.total_count,
        "processed_images": job.processed_count,
        "success_count": job.success_count,
        "error_count": job.error_count,
        "progress_percentage": job.progress_percentage(),
        "status": job.status.to_string(),
        "timestamp": Utc::now().to_rfc3339(),
    })
}

pub fn classification_payload(image: &ImageRecord, result: &PredictionResult) -> Value {
    json!({
        "type": "classification_result",
        "image_id": image.id.to_string(),
        "predicted_class": result.predicted_class,
        "confidence": result.confidence,
        "probabilities": result.probabilities,
        "processing_time": result.processing_time,
        "error": result.error,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Sends the job's progress to its owner and to the batch's own topic.
pub fn notify_batch_progress(notifier: &dyn Notifier, job: &BatchJob) {
    let payload = batch_progress_payload(job);
    notifier.notify(&user_topic(job.owner_id), payload.clone());
    notifier.notify(&batch_topic(job.id), payload);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_reaches_both_topics() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        let job = BatchJob::new(Uuid::new_v4());

        notify_batch_progress(&notifier, &job);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(first.topic, user_topic(job.owner_id));
        assert_eq!(second.topic, batch_topic(job.id));
        assert_eq!(first.payload["progress_percentage"], 0);
        assert_eq!(first.payload["status"], "pending");
    }

    #[test]
    fn sending_without_subscribers_is_harmless() {
        BroadcastNotifier::default().notify("batch_x", json!({"type": "batch_progress"}));
    }
}
