use ndarray::{Array1, ArrayView1, Axis};
use shared::PredictionResult;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::classifier::backend::RawOutput;
use crate::classifier::error::InferenceError;
use crate::classifier::metadata::ModelMetadata;

pub const UNKNOWN_CLASS: &str = "unknown";
pub const ERROR_CLASS: &str = "error";

/// Per-class probabilities of one input plus the confidence head value, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Scores {
    pub probabilities: Array1<f32>,
    pub confidence: Option<f32>,
}

pub fn softmax(logits: ArrayView1<f32>) -> Array1<f32> {
    let max = logits.fold(f32::NEG_INFINITY, |acc, &v| acc.max(v));
    let exps = logits.mapv(|v| (v - max).exp());
    let sum = exps.sum();
    exps / sum
}

/// Index of the largest value; ties resolve to the lowest index.
pub fn argmax(values: ArrayView1<f32>) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .fold(None, |best: Option<(usize, f32)>, (i, &v)| match best {
            Some((_, b)) if b >= v => best,
            _ if v.is_nan() => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

impl Scores {
    /// Scores of the first sample in a forward-pass output.
    pub fn from_output(output: &RawOutput) -> Result<Self, InferenceError> {
        if output.logits.nrows() == 0 {
            return Err(InferenceError::Shape("empty batch".to_string()));
        }
        let probabilities = softmax(output.logits.index_axis(Axis(0), 0));
        let confidence = output
            .confidence
            .as_ref()
            .and_then(|values| values.get(0).copied());
        Ok(Self {
            probabilities,
            confidence,
        })
    }

    /// Arithmetic mean of probability vectors and head confidences.
    pub fn average(views: &[Scores]) -> Option<Scores> {
        let first = views.first()?;
        let count = views.len() as f32;

        let mut probabilities = Array1::<f32>::zeros(first.probabilities.len());
        for view in views {
            probabilities += &view.probabilities;
        }
        probabilities /= count;

        let confidence = views
            .iter()
            .map(|view| view.confidence)
            .sum::<Option<f32>>()
            .map(|total| total / count);

        Some(Scores {
            probabilities,
            confidence,
        })
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Turns averaged or single-shot scores into the result contract.
///
/// With a confidence head the reported confidence is `head * max_prob` and the
/// subject is valid when it clears the model's threshold. Without one the
/// confidence is the max probability and any named class is a valid subject.
pub fn build_result(
    scores: &Scores,
    metadata: &ModelMetadata,
    model_id: Option<Uuid>,
    tta_used: bool,
    processing_time: f64,
) -> Result<PredictionResult, InferenceError> {
    let idx = argmax(scores.probabilities.view())
        .ok_or_else(|| InferenceError::Shape("no class probabilities".to_string()))?;
    let max_prob = scores.probabilities[idx];

    let predicted_class = metadata
        .classes
        .name(idx)
        .unwrap_or(UNKNOWN_CLASS)
        .to_string();

    let (confidence, is_valid_subject) = match scores.confidence {
        Some(head) => {
            let confidence = head * max_prob;
            (confidence, confidence >= metadata.confidence_threshold)
        }
        None => (max_prob, predicted_class != UNKNOWN_CLASS),
    };

    let probabilities: BTreeMap<String, f32> = scores
        .probabilities
        .iter()
        .enumerate()
        .map(|(i, &p)| (metadata.classes.label(i), p))
        .collect();

    Ok(PredictionResult {
        predicted_class,
        class_index: Some(idx),
        confidence,
        is_valid_subject,
        probabilities,
        processing_time,
        tta_used,
        model_id,
        timestamp: now(),
        error: None,
    })
}

fn error_result(class: &str, message: String, tta_used: bool, processing_time: f64) -> PredictionResult {
    PredictionResult {
        predicted_class: class.to_string(),
        class_index: None,
        confidence: 0.0,
        is_valid_subject: false,
        probabilities: BTreeMap::new(),
        processing_time,
        tta_used,
        model_id: None,
        timestamp: now(),
        error: Some(message),
    }
}

/// Result returned when no model could be loaded.
pub fn unavailable(message: impl Into<String>, tta_used: bool) -> PredictionResult {
    error_result(UNKNOWN_CLASS, message.into(), tta_used, 0.0)
}

/// Result returned when the forward pass itself failed.
pub fn failed(
    message: impl Into<String>,
    model_id: Option<Uuid>,
    tta_used: bool,
    processing_time: f64,
) -> PredictionResult {
    PredictionResult {
        model_id,
        ..error_result(ERROR_CLASS, message.into(), tta_used, processing_time)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::metadata::{ClassMapping, MetadataDefaults};
    use ndarray::{arr1, arr2};

    fn metadata(classes: &[&str], num_classes: usize) -> ModelMetadata {
        let mut metadata = ModelMetadata::from_raw(
            Default::default(),
            MetadataDefaults::default(),
            None,
        )
        .unwrap();
        metadata.classes = ClassMapping::new(classes.iter().copied());
        metadata.num_classes = num_classes;
        metadata
    }

    fn scores(probabilities: &[f32]) -> Scores {
        Scores {
            probabilities: arr1(probabilities),
            confidence: None,
        }
    }

    #[test]
    fn softmax_is_a_distribution() {
        let probs = softmax(arr1(&[1000.0f32, 1001.0, 999.0]).view());
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        assert!(probs.iter().all(|&p| p >= 0.0));
        assert_eq!(argmax(probs.view()), Some(1));
    }

    #[test]
    fn argmax_prefers_lowest_index_on_ties() {
        assert_eq!(argmax(arr1(&[0.4f32, 0.4, 0.2]).view()), Some(0));
        assert_eq!(argmax(arr1::<f32>(&[]).view()), None);
    }

    #[test]
    fn averaging_differs_from_majority_vote() {
        // three views narrowly favour "ripe", two strongly favour "rotten"
        let views = vec![
            scores(&[0.55, 0.45]),
            scores(&[0.55, 0.45]),
            scores(&[0.55, 0.45]),
            scores(&[0.05, 0.95]),
            scores(&[0.05, 0.95]),
        ];
        let averaged = Scores::average(&views).unwrap();
        let result = build_result(&averaged, &metadata(&["ripe", "rotten"], 2), None, true, 0.0)
            .unwrap();

        assert_eq!(result.predicted_class, "rotten");
        assert!((result.probabilities["rotten"] - 0.65).abs() < 1e-5);
        assert!(result.tta_used);
    }

    #[test]
    fn head_confidences_are_averaged() {
        let views = vec![
            Scores {
                probabilities: arr1(&[1.0, 0.0]),
                confidence: Some(0.2),
            },
            Scores {
                probabilities: arr1(&[1.0, 0.0]),
                confidence: Some(0.6),
            },
        ];
        let averaged = Scores::average(&views).unwrap();
        assert!((averaged.confidence.unwrap() - 0.4).abs() < 1e-6);
    }

    #[test]
    fn confidence_head_gates_validity() {
        let meta = metadata(&["ripe", "rotten"], 2);
        let output = RawOutput::with_confidence(arr2(&[[3.0, 0.0]]), arr1(&[0.5]));
        let scores = Scores::from_output(&output).unwrap();

        let result = build_result(&scores, &meta, None, false, 0.0).unwrap();
        let max_prob = result.probabilities["ripe"];
        assert!((result.confidence - 0.5 * max_prob).abs() < 1e-6);
        assert!(!result.is_valid_subject);
    }

    #[test]
    fn unnamed_class_is_not_a_valid_subject() {
        let meta = metadata(&["ripe"], 2);
        let result = build_result(&scores(&[0.2, 0.8]), &meta, None, false, 0.0).unwrap();

        assert_eq!(result.predicted_class, UNKNOWN_CLASS);
        assert!(!result.is_valid_subject);
        assert!(result.probabilities.contains_key("class_1"));
        assert_eq!(result.confidence, 0.8);
    }

    #[test]
    fn error_results_carry_the_message() {
        let result = unavailable("no model", false);
        assert_eq!(result.predicted_class, "unknown");
        assert_eq!(result.confidence, 0.0);
        assert!(!result.is_valid_subject);
        assert_eq!(result.error.as_deref(), Some("no model"));

        let id = Uuid::new_v4();
        let result = failed("boom", Some(id), true, 0.25);
        assert_eq!(result.predicted_class, "error");
        assert_eq!(result.model_id, Some(id));
    }
}
