use ndarray::{Array1, Array2, Array4};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use tch::{CModule, Device, IValue, Kind, TchError, Tensor};

use crate::classifier::backend::{ModelLoader, Network, OutputLayout, RawOutput};
use crate::classifier::checkpoint::{normalize_entries, CheckpointShape};
use crate::classifier::error::{InferenceError, LoadError};
use crate::classifier::metadata::ModelMetadata;

fn load_err(e: TchError) -> LoadError {
    LoadError::Backend(e.to_string())
}

fn inference_err(e: TchError) -> InferenceError {
    InferenceError::Backend(e.to_string())
}

/// Loads TorchScript modules through libtorch.
pub struct TorchModelLoader {
    device: Device,
}

impl TorchModelLoader {
    pub fn new() -> Self {
        Self {
            device: Device::cuda_if_available(),
        }
    }

    pub fn with_device(device: Device) -> Self {
        Self { device }
    }

    /// Weight file that is itself a TorchScript module with a runnable forward.
    fn load_runnable(
        &self,
        weights: &Path,
        input_size: u32,
    ) -> Result<(CModule, OutputLayout), LoadError> {
        let mut module = CModule::load_on_device(weights, self.device).map_err(load_err)?;
        module.set_eval();
        let layout = self.detect_layout(&module, input_size)?;
        log::info!("Loaded {} as a serialized TorchScript module", weights.display());
        Ok((module, layout))
    }

    /// Named tensors of a weight file: a libtorch archive first, then a
    /// pickled flat dict as written by `torch.save(state_dict)`.
    fn read_entries(&self, weights: &Path) -> Result<Vec<(String, Tensor)>, LoadError> {
        Tensor::load_multi_with_device(weights, self.device)
            .or_else(|_| Tensor::loadz_multi_with_device(weights, self.device))
            .map_err(load_err)
    }

    fn load_from_weights(
        &self,
        weights: &Path,
        metadata: &ModelMetadata,
    ) -> Result<CModule, LoadError> {
        let (shape, params) = normalize_entries(self.read_entries(weights)?);
        if shape == CheckpointShape::Empty {
            return Err(LoadError::Checkpoint(format!(
                "{} holds no tensors",
                weights.display()
            )));
        }
        log::info!("Checkpoint shape {:?} with {} entries", shape, params.len());
        let mut module = self.load_state_dict(metadata, params)?;
        module.set_eval();
        Ok(module)
    }

    fn load_state_dict(
        &self,
        metadata: &ModelMetadata,
        entries: Vec<(String, Tensor)>,
    ) -> Result<CModule, LoadError> {
        let architecture = metadata.architecture_file.as_ref().ok_or_else(|| {
            LoadError::Checkpoint(
                "weights are a state dict but metadata names no architecture_file".to_string(),
            )
        })?;
        let module = CModule::load_on_device(architecture, self.device).map_err(load_err)?;

        let mut weights: HashMap<String, Tensor> = entries.into_iter().collect();
        let parameters = module.named_parameters().map_err(load_err)?;
        let mut copied = 0usize;
        tch::no_grad(|| -> Result<(), LoadError> {
            for (name, mut parameter) in parameters {
                let Some(source) = weights.remove(&name) else {
                    log::warn!("No weights for parameter {}", name);
                    continue;
                };
                parameter
                    .f_copy_(&source.to_device(self.device))
                    .map_err(|e| LoadError::Checkpoint(format!("{}: {}", name, e)))?;
                copied += 1;
            }
            Ok(())
        })?;

        if copied == 0 {
            return Err(LoadError::Checkpoint(
                "no checkpoint entry matched the architecture's parameters".to_string(),
            ));
        }
        if !weights.is_empty() {
            log::warn!("{} checkpoint entries were not used", weights.len());
        }
        log::info!("Copied {} parameter tensors into {}", copied, architecture.display());
        Ok(module)
    }

    fn detect_layout(&self, module: &CModule, input_size: u32) -> Result<OutputLayout, LoadError> {
        let side = input_size as i64;
        let sample = Tensor::zeros([1, 3, side, side], (Kind::Float, self.device));
        let output = tch::no_grad(|| module.forward_is(&[IValue::Tensor(sample)])).map_err(load_err)?;
        layout_of(&output)
    }
}

fn layout_of(output: &IValue) -> Result<OutputLayout, LoadError> {
    match output {
        IValue::Tensor(_) => Ok(OutputLayout::Logits),
        IValue::Tuple(items) if items.len() >= 2 => Ok(OutputLayout::LogitsWithConfidence),
        other => Err(LoadError::Backend(format!(
            "unsupported model output: {:?}",
            other
        ))),
    }
}

impl Default for TorchModelLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelLoader for TorchModelLoader {
    fn device(&self) -> String {
        format!("{:?}", self.device)
    }

    fn load(&self, weights: &Path, metadata: &ModelMetadata) -> Result<Box<dyn Network>, LoadError> {
        if !weights.is_file() {
            return Err(LoadError::MissingWeights(weights.to_path_buf()));
        }

        let (module, layout) = match self.load_runnable(weights, metadata.input_size) {
            Ok(found) => found,
            Err(e) => {
                log::debug!("{} is not a runnable module ({}), reading weights", weights.display(), e);
                let module = self.load_from_weights(weights, metadata)?;
                let layout = self.detect_layout(&module, metadata.input_size)?;
                (module, layout)
            }
        };
        Ok(Box::new(TorchNetwork {
            module: Mutex::new(module),
            device: self.device,
            architecture: metadata.architecture.clone(),
            layout,
        }))
    }
}

pub struct TorchNetwork {
    module: Mutex<CModule>,
    device: Device,
    architecture: String,
    layout: OutputLayout,
}

fn to_vec(tensor: &Tensor) -> Result<(Vec<i64>, Vec<f32>), InferenceError> {
    let tensor = tensor.to_device(Device::Cpu).to_kind(Kind::Float).contiguous();
    let size = tensor.size();
    let values = Vec::<f32>::try_from(&tensor.view([-1])).map_err(inference_err)?;
    Ok((size, values))
}

fn to_logits(tensor: &Tensor) -> Result<Array2<f32>, InferenceError> {
    let (size, values) = to_vec(tensor)?;
    let &[rows, cols] = size.as_slice() else {
        return Err(InferenceError::Shape(format!("expected 2-d logits, got {:?}", size)));
    };
    Array2::from_shape_vec((rows as usize, cols as usize), values)
        .map_err(|e| InferenceError::Shape(e.to_string()))
}

impl Network for TorchNetwork {
    fn architecture(&self) -> &str {
        &self.architecture
    }

    fn layout(&self) -> OutputLayout {
        self.layout
    }

    fn forward(&self, input: &Array4<f32>) -> Result<RawOutput, InferenceError> {
        let (n, c, h, w) = input.dim();
        let data: Vec<f32> = input.iter().copied().collect();
        let tensor = Tensor::from_slice(&data)
            .view([n as i64, c as i64, h as i64, w as i64])
            .to_device(self.device);

        let module = self.module.lock().unwrap_or_else(PoisonError::into_inner);
        let output = tch::no_grad(|| module.forward_is(&[IValue::Tensor(tensor)]))
            .map_err(inference_err)?;

        match output {
            IValue::Tensor(logits) => Ok(RawOutput::logits(to_logits(&logits)?)),
            IValue::Tuple(items) => match &items[..] {
                [IValue::Tensor(logits), IValue::Tensor(confidence), ..] => {
                    let (_, values) = to_vec(confidence)?;
                    Ok(RawOutput::with_confidence(
                        to_logits(logits)?,
                        Array1::from_vec(values),
                    ))
                }
                _ => Err(InferenceError::Shape(
                    "tuple output does not start with two tensors".to_string(),
                )),
            },
            other => Err(InferenceError::Shape(format!(
                "unsupported model output: {:?}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::metadata::{MetadataDefaults, RawMetadata};
    use std::path::PathBuf;
    use tempfile::TempDir;

    const OPTIONS: (Kind, Device) = (Kind::Float, Device::Cpu);

    fn loader() -> TorchModelLoader {
        TorchModelLoader::with_device(Device::Cpu)
    }

    fn metadata(architecture_file: Option<&Path>) -> ModelMetadata {
        let raw = RawMetadata {
            num_classes: Some(3),
            input_size: Some(4),
            architecture_file: architecture_file.map(|p| p.to_string_lossy().into_owned()),
            ..RawMetadata::default()
        };
        ModelMetadata::from_raw(raw, MetadataDefaults::default(), None).unwrap()
    }

    /// Module holding a single zeroed `fc.weight` parameter.
    fn architecture(dir: &Path) -> PathBuf {
        let path = dir.join("arch.pt");
        Tensor::save_multi(&[("fc.weight", Tensor::zeros([3, 4], OPTIONS))], &path).unwrap();
        path
    }

    fn weight_sum(module: &CModule) -> f64 {
        let (_, weight) = module
            .named_parameters()
            .unwrap()
            .into_iter()
            .find(|(name, _)| name == "fc.weight")
            .unwrap();
        weight.sum(Kind::Float).double_value(&[])
    }

    #[test]
    fn bare_state_dict_is_copied_into_the_architecture() {
        let dir = TempDir::new().unwrap();
        let arch = architecture(dir.path());
        let weights = dir.path().join("plum.pt");
        Tensor::save_multi(&[("module.fc.weight", Tensor::ones([3, 4], OPTIONS))], &weights)
            .unwrap();

        let module = loader()
            .load_from_weights(&weights, &metadata(Some(&arch)))
            .unwrap();
        assert_eq!(weight_sum(&module), 12.0);
    }

    #[test]
    fn nested_checkpoint_is_unwrapped_before_copying() {
        let dir = TempDir::new().unwrap();
        let arch = architecture(dir.path());
        let weights = dir.path().join("checkpoint.pt");
        Tensor::save_multi(
            &[
                ("epoch", Tensor::from(12.0f32)),
                ("model_state_dict.fc.weight", Tensor::full([3, 4], 2.0, OPTIONS)),
                ("optimizer_state_dict.fc.weight", Tensor::ones([3, 4], OPTIONS)),
            ],
            &weights,
        )
        .unwrap();

        let module = loader()
            .load_from_weights(&weights, &metadata(Some(&arch)))
            .unwrap();
        assert_eq!(weight_sum(&module), 24.0);
    }

    #[test]
    fn state_dict_needs_a_matching_architecture() {
        let dir = TempDir::new().unwrap();
        let arch = architecture(dir.path());
        let weights = dir.path().join("plum.pt");
        Tensor::save_multi(&[("head.bias", Tensor::ones([3], OPTIONS))], &weights).unwrap();

        let err = loader()
            .load_from_weights(&weights, &metadata(None))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Checkpoint(_)));

        let err = loader()
            .load_from_weights(&weights, &metadata(Some(&arch)))
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::Checkpoint(_)));
    }

    #[test]
    fn serialized_module_loads_with_logits_layout() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("scripted.pt");
        let mut forward = |inputs: &[Tensor]| vec![inputs[0].flatten(1, -1).narrow(1, 0, 3)];
        let module = CModule::create_by_tracing(
            "PlumNet",
            "forward",
            &[Tensor::zeros([1, 3, 4, 4], OPTIONS)],
            &mut forward,
        )
        .unwrap();
        module.save(&path).unwrap();

        let network = loader().load(&path, &metadata(None)).unwrap();
        assert_eq!(network.layout(), OutputLayout::Logits);

        let output = network.forward(&Array4::ones((1, 3, 4, 4))).unwrap();
        assert_eq!(output.logits.dim(), (1, 3));
        assert!(output.confidence.is_none());
    }

    #[test]
    fn tuple_output_means_a_confidence_head() {
        let output = IValue::Tuple(vec![
            IValue::Tensor(Tensor::zeros([1, 3], OPTIONS)),
            IValue::Tensor(Tensor::ones([1], OPTIONS)),
        ]);
        assert_eq!(layout_of(&output).unwrap(), OutputLayout::LogitsWithConfidence);
        assert_eq!(
            layout_of(&IValue::Tensor(Tensor::zeros([1, 3], OPTIONS))).unwrap(),
            OutputLayout::Logits
        );
        assert!(layout_of(&IValue::Int(3)).is_err());
    }
}
