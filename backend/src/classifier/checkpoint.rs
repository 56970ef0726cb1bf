//! Decoding of the weight-file conventions produced by training scripts.
//!
//! Weight files that are not runnable TorchScript modules are read as a flat
//! list of named tensors. libtorch archives keep nested names dotted, so a
//! checkpoint comes back as `model_state_dict.fc.weight`. Python pickles are
//! only readable as a flat `name -> tensor` dict; nested ones have to be
//! flattened to dotted keys first. Shapes recognised:
//!
//! * a bare state dict (`fc.weight`, `fc.bias`, ...),
//! * a nested checkpoint, where the state dict sits under a container key such
//!   as `model_state_dict` next to bookkeeping entries (`epoch`,
//!   `optimizer_state_dict.*`),
//! * no tensors at all.
//!
//! Keys written through `DataParallel` or `torch.compile` carry a `module.` or
//! `_orig_mod.` prefix which is stripped before the weights are matched against
//! the architecture.

use serde::Serialize;

const CONTAINER_KEYS: [&str; 3] = ["model_state_dict", "state_dict", "model"];
const WRAPPER_PREFIXES: [&str; 2] = ["module.", "_orig_mod."];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointShape {
    StateDict,
    Nested { container: String },
    Empty,
}

fn container_of(keys: &[&str]) -> Option<&'static str> {
    CONTAINER_KEYS.into_iter().find(|container| {
        keys.iter().any(|key| {
            key.strip_prefix(container)
                .is_some_and(|rest| rest.starts_with('.'))
        })
    })
}

pub fn detect_shape<'a, I>(keys: I) -> CheckpointShape
where
    I: IntoIterator<Item = &'a str>,
{
    let keys: Vec<&str> = keys.into_iter().collect();
    if keys.is_empty() {
        return CheckpointShape::Empty;
    }
    match container_of(&keys) {
        Some(container) => CheckpointShape::Nested {
            container: container.to_string(),
        },
        None => CheckpointShape::StateDict,
    }
}

fn strip_wrappers(mut key: &str) -> &str {
    loop {
        match WRAPPER_PREFIXES
            .iter()
            .find_map(|prefix| key.strip_prefix(prefix))
        {
            Some(rest) => key = rest,
            None => return key,
        }
    }
}

/// Unwraps nested checkpoints and strips wrapper prefixes, returning the shape
/// that was found together with parameter entries ready to be matched by name.
pub fn normalize_entries<T>(entries: Vec<(String, T)>) -> (CheckpointShape, Vec<(String, T)>) {
    let shape = detect_shape(entries.iter().map(|(key, _)| key.as_str()));
    let normalized = match &shape {
        CheckpointShape::Empty => Vec::new(),
        CheckpointShape::StateDict => entries
            .into_iter()
            .map(|(key, value)| (strip_wrappers(&key).to_string(), value))
            .collect(),
        CheckpointShape::Nested { container } => {
            let prefix = format!("{}.", container);
            entries
                .into_iter()
                .filter_map(|(key, value)| {
                    key.strip_prefix(&prefix)
                        .map(|rest| (strip_wrappers(rest).to_string(), value))
                })
                .collect()
        }
    };
    (shape, normalized)
}
