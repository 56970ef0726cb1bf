use chrono::{DateTime, Utc};
use image::RgbImage;
use serde::Serialize;
use shared::PredictionResult;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Instant;
use uuid::Uuid;

use crate::classifier::backend::{ModelLoader, Network, OutputLayout};
use crate::classifier::error::{ClassifierError, InferenceError, LoadError};
use crate::classifier::metadata::{metadata_path_for, ClassMapping, MetadataDefaults, ModelMetadata};
use crate::classifier::prediction::{self, Scores};
use crate::classifier::preprocess::{build_preprocessor, ImageInput, Preprocessor, TtaView};
use crate::config::ServiceConfig;
use crate::registry::{ModelArtifact, ModelRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    LoadFailed,
}

/// Running prediction counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStats {
    pub total_predictions: u64,
    pub failed_predictions: u64,
    pub avg_confidence: f64,
    /// Seconds.
    pub avg_processing_time: f64,
}

impl UsageStats {
    fn record_success(&mut self, confidence: f32, processing_time: f64) {
        self.total_predictions += 1;
        let n = (self.total_predictions - self.failed_predictions) as f64;
        self.avg_confidence += (confidence as f64 - self.avg_confidence) / n;
        self.avg_processing_time += (processing_time - self.avg_processing_time) / n;
    }

    fn record_failure(&mut self) {
        self.total_predictions += 1;
        self.failed_predictions += 1;
    }
}

/// A network together with everything needed to serve it. Never mutated once
/// built; swapping models replaces the whole value.
pub struct LoadedModel {
    pub artifact: ModelArtifact,
    pub metadata: ModelMetadata,
    pub weights_path: PathBuf,
    pub metadata_path: PathBuf,
    pub loaded_at: DateTime<Utc>,
    network: Box<dyn Network>,
    preprocessor: Box<dyn Preprocessor>,
}

impl LoadedModel {
    pub fn layout(&self) -> OutputLayout {
        self.network.layout()
    }

    fn forward(&self, image: &RgbImage) -> Result<Scores, InferenceError> {
        let input = self.preprocessor.tensor(image);
        let output = self.network.forward(&input)?;
        output.check(self.network.layout(), self.metadata.num_classes)?;
        Scores::from_output(&output)
    }

    pub fn predict_single(&self, image: &RgbImage) -> Result<Scores, InferenceError> {
        self.forward(image)
    }

    /// One forward pass per view, probabilities averaged before argmax.
    pub fn predict_with_tta(&self, image: &RgbImage) -> Result<Scores, InferenceError> {
        let views = TtaView::ALL
            .iter()
            .map(|view| self.forward(&view.apply(image)))
            .collect::<Result<Vec<_>, _>>()?;
        Scores::average(&views)
            .ok_or_else(|| InferenceError::Shape("no augmented views".to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub state: LoadState,
    pub device: String,
    pub model_id: Option<Uuid>,
    pub name: Option<String>,
    pub version: Option<String>,
    pub architecture: Option<String>,
    pub model_type: Option<String>,
    pub model_path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub num_classes: Option<usize>,
    pub classes: Option<ClassMapping>,
    pub input_size: u32,
    pub confidence_threshold: f32,
    pub output_layout: Option<OutputLayout>,
    pub preprocessing: String,
    pub is_production: Option<bool>,
    pub loaded_at: Option<DateTime<Utc>>,
    pub load_count: usize,
    pub usage: UsageStats,
    pub error: Option<String>,
}

enum WeightSource {
    Registered(ModelArtifact),
    Discovered(PathBuf),
}

struct Slot {
    state: LoadState,
    model: Option<Arc<LoadedModel>>,
    last_error: Option<String>,
}

/// Process-wide owner of the loaded classifier.
///
/// Readers take a snapshot `Arc<LoadedModel>` under a short read lock, so a
/// prediction always runs against one model from start to finish. Load, reload
/// and switch are serialized by `lifecycle` and build the replacement before it
/// is swapped in.
pub struct ClassifierService {
    config: ServiceConfig,
    registry: Arc<dyn ModelRegistry>,
    loader: Arc<dyn ModelLoader>,
    slot: RwLock<Slot>,
    lifecycle: Mutex<()>,
    load_count: AtomicUsize,
    usage: Mutex<UsageStats>,
}

impl ClassifierService {
    pub fn new(
        config: ServiceConfig,
        registry: Arc<dyn ModelRegistry>,
        loader: Arc<dyn ModelLoader>,
    ) -> Self {
        Self {
            config,
            registry,
            loader,
            slot: RwLock::new(Slot {
                state: LoadState::Unloaded,
                model: None,
                last_error: None,
            }),
            lifecycle: Mutex::new(()),
            load_count: AtomicUsize::new(0),
            usage: Mutex::new(UsageStats::default()),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn ModelRegistry> {
        &self.registry
    }

    pub fn state(&self) -> LoadState {
        self.read_slot().state
    }

    /// Number of successful model loads since startup.
    pub fn load_count(&self) -> usize {
        self.load_count.load(Ordering::SeqCst)
    }

    pub fn usage(&self) -> UsageStats {
        self.usage_guard().clone()
    }

    pub fn current(&self) -> Option<Arc<LoadedModel>> {
        self.read_slot().model.clone()
    }

    fn read_slot(&self) -> std::sync::RwLockReadGuard<'_, Slot> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slot(&self) -> std::sync::RwLockWriteGuard<'_, Slot> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn usage_guard(&self) -> MutexGuard<'_, UsageStats> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads the active (or first discovered) model unless one is loaded.
    /// Returns whether a model is available afterwards.
    pub fn lazy_load(&self) -> bool {
        if self.current().is_some() {
            return true;
        }
        let _guard = self.lifecycle();
        if self.current().is_some() {
            return true;
        }
        self.load_locked()
    }

    /// Drops the current model and loads the active one again.
    pub fn reload(&self) -> bool {
        let _guard = self.lifecycle();
        {
            let mut slot = self.write_slot();
            slot.model = None;
            slot.state = LoadState::Unloaded;
        }
        log::info!("Reloading classifier model");
        self.load_locked()
    }

    fn load_locked(&self) -> bool {
        self.write_slot().state = LoadState::Loading;

        let loaded = self
            .resolve_source()
            .and_then(|source| self.build(source));
        match loaded {
            Ok(model) => {
                self.install(model);
                true
            }
            Err(e) => {
                log::error!("Failed to load classifier model: {}", e);
                let mut slot = self.write_slot();
                slot.state = LoadState::LoadFailed;
                slot.last_error = Some(e.to_string());
                false
            }
        }
    }

    fn resolve_source(&self) -> Result<WeightSource, LoadError> {
        if let Some(artifact) = self.registry.get_active()? {
            if !artifact.file_exists() {
                return Err(LoadError::MissingWeights(artifact.file_path));
            }
            return Ok(WeightSource::Registered(artifact));
        }

        let weights = self
            .discover_weights()?
            .ok_or_else(|| LoadError::NoArtifact(self.config.model_dir.clone()))?;
        log::info!("No active model registered, discovered {}", weights.display());
        Ok(WeightSource::Discovered(weights))
    }

    /// First weight file in the model directory, in lexicographic order.
    fn discover_weights(&self) -> Result<Option<PathBuf>, LoadError> {
        let dir = &self.config.model_dir;
        if !dir.is_dir() {
            log::warn!("Model directory {} does not exist", dir.display());
            return Ok(None);
        }
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && self.is_weight_file(path))
            .collect();
        candidates.sort();
        Ok(candidates.into_iter().next())
    }

    fn is_weight_file(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                self.config
                    .weight_extensions
                    .iter()
                    .any(|allowed| allowed.eq_ignore_ascii_case(ext))
            })
    }

    fn metadata_defaults(&self) -> MetadataDefaults {
        MetadataDefaults {
            input_size: self.config.input_size,
            confidence_threshold: self.config.confidence_threshold,
        }
    }

    fn build(&self, source: WeightSource) -> Result<LoadedModel, LoadError> {
        let (registered, weights) = match source {
            WeightSource::Registered(artifact) => {
                let weights = artifact.file_path.clone();
                (Some(artifact), weights)
            }
            WeightSource::Discovered(weights) => (self.registry.find_by_path(&weights)?, weights),
        };
        if !weights.is_file() {
            return Err(LoadError::MissingWeights(weights));
        }

        let metadata_path = registered
            .as_ref()
            .and_then(|a| a.metadata_path.clone())
            .unwrap_or_else(|| metadata_path_for(&weights));
        let metadata = ModelMetadata::load(Some(&metadata_path), self.metadata_defaults())?;

        log::info!(
            "Loading {} ({} classes) from {} on {}",
            metadata.architecture,
            metadata.num_classes,
            weights.display(),
            self.loader.device()
        );
        let network = self.loader.load(&weights, &metadata)?;
        let preprocessor = build_preprocessor(self.config.preprocessing, metadata.input_size);

        let artifact = match registered {
            Some(artifact) if artifact.is_active => artifact,
            Some(artifact) => self.registry.set_active(artifact.id)?,
            None => {
                let recorded_metadata = metadata_path.is_file().then_some(metadata_path.as_path());
                self.registry
                    .register(metadata.descriptor(&weights, recorded_metadata))?
            }
        };

        Ok(LoadedModel {
            artifact,
            metadata,
            weights_path: weights,
            metadata_path,
            loaded_at: Utc::now(),
            network,
            preprocessor,
        })
    }

    fn install(&self, model: LoadedModel) {
        log::info!(
            "Model {} {} ({}) ready, output layout {:?}, preprocessing {}",
            model.artifact.name,
            model.artifact.version,
            model.artifact.id,
            model.layout(),
            model.preprocessor.name()
        );
        let mut slot = self.write_slot();
        slot.model = Some(Arc::new(model));
        slot.state = LoadState::Loaded;
        slot.last_error = None;
        self.load_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Activates and loads artifact `id`. On any failure the previous model
    /// and activation stay in place.
    pub fn switch_model(&self, id: Uuid) -> bool {
        match self.try_switch_model(id) {
            Ok(model) => {
                log::info!("Switched to model {} ({})", model.artifact.id, model.artifact.version);
                true
            }
            Err(e) => {
                log::error!("Failed to switch to model {}: {}", id, e);
                false
            }
        }
    }

    pub fn try_switch_model(&self, id: Uuid) -> Result<Arc<LoadedModel>, ClassifierError> {
        let _guard = self.lifecycle();

        let artifact = self
            .registry
            .get(id)?
            .ok_or(ClassifierError::NotFound(id))?;
        if !artifact.file_exists() {
            return Err(ClassifierError::MissingFile(artifact.file_path));
        }

        let previous = self.registry.get_active()?;
        let activated = self.registry.set_active(id)?;
        match self.build(WeightSource::Registered(activated)) {
            Ok(model) => {
                self.install(model);
                self.current()
                    .ok_or_else(|| ClassifierError::Unavailable("model slot empty after switch".to_string()))
            }
            Err(e) => {
                let restored = match &previous {
                    Some(previous) => self.registry.set_active(previous.id).map(|_| ()),
                    None => self.registry.clear_active(),
                };
                if let Err(restore_err) = restored {
                    log::error!("Failed to restore previous activation: {}", restore_err);
                }
                Err(e.into())
            }
        }
    }

    fn ensure_loaded(&self) -> Result<Arc<LoadedModel>, ClassifierError> {
        if let Some(model) = self.current() {
            return Ok(model);
        }
        if self.lazy_load() {
            if let Some(model) = self.current() {
                return Ok(model);
            }
        }
        let message = self
            .read_slot()
            .last_error
            .clone()
            .unwrap_or_else(|| "model is not loaded".to_string());
        Err(ClassifierError::Unavailable(message))
    }

    fn predict(
        &self,
        model: &LoadedModel,
        image: &RgbImage,
        use_tta: bool,
        started: Instant,
    ) -> Result<PredictionResult, ClassifierError> {
        let scores = if use_tta {
            model.predict_with_tta(image)?
        } else {
            model.predict_single(image)?
        };
        let elapsed = started.elapsed().as_secs_f64();
        let result = prediction::build_result(
            &scores,
            &model.metadata,
            Some(model.artifact.id),
            use_tta,
            elapsed,
        )?;
        self.usage_guard()
            .record_success(result.confidence, result.processing_time);
        Ok(result)
    }

    pub fn predict_single(&self, image: &RgbImage) -> Result<PredictionResult, ClassifierError> {
        let model = self.ensure_loaded()?;
        self.predict(&model, image, false, Instant::now())
    }

    pub fn predict_with_tta(&self, image: &RgbImage) -> Result<PredictionResult, ClassifierError> {
        let model = self.ensure_loaded()?;
        self.predict(&model, image, true, Instant::now())
    }

    /// Classifies one image. Model unavailability and inference failures come
    /// back as results with `error` set; only unreadable input is an `Err`.
    pub fn classify(
        &self,
        image: impl Into<ImageInput>,
        use_tta: bool,
    ) -> Result<PredictionResult, ClassifierError> {
        let input = image.into();
        let model = match self.ensure_loaded() {
            Ok(model) => model,
            Err(e) => {
                log::warn!("Classification requested without a model: {}", e);
                return Ok(prediction::unavailable(e.to_string(), use_tta));
            }
        };

        let started = Instant::now();
        let image = match input.decode() {
            Ok(image) => image,
            Err(e) => {
                self.usage_guard().record_failure();
                return Err(e);
            }
        };

        match self.predict(&model, &image, use_tta, started) {
            Ok(result) => {
                log::debug!(
                    "Classified as {} ({:.3}) in {:.3}s",
                    result.predicted_class,
                    result.confidence,
                    result.processing_time
                );
                Ok(result)
            }
            Err(e) => {
                log::error!("Inference failed on model {}: {}", model.artifact.id, e);
                self.usage_guard().record_failure();
                Ok(prediction::failed(
                    e.to_string(),
                    Some(model.artifact.id),
                    use_tta,
                    started.elapsed().as_secs_f64(),
                ))
            }
        }
    }

    /// Classifies each image independently; one bad image does not affect the rest.
    pub fn classify_many<I, T>(
        &self,
        images: I,
        use_tta: bool,
    ) -> Vec<Result<PredictionResult, ClassifierError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<ImageInput>,
    {
        images
            .into_iter()
            .map(|image| self.classify(image, use_tta))
            .collect()
    }

    pub fn model_info(&self) -> ModelInfo {
        let available = self.lazy_load();
        let (state, model, last_error) = {
            let slot = self.read_slot();
            (slot.state, slot.model.clone(), slot.last_error.clone())
        };

        let mut info = ModelInfo {
            state,
            device: self.loader.device(),
            model_id: None,
            name: None,
            version: None,
            architecture: None,
            model_type: None,
            model_path: None,
            metadata_path: None,
            num_classes: None,
            classes: None,
            input_size: self.config.input_size,
            confidence_threshold: self.config.confidence_threshold,
            output_layout: None,
            preprocessing: self.config.preprocessing.as_str().to_string(),
            is_production: None,
            loaded_at: None,
            load_count: self.load_count(),
            usage: self.usage(),
            error: None,
        };

        match model {
            Some(model) => {
                info.model_id = Some(model.artifact.id);
                info.name = Some(model.artifact.name.clone());
                info.version = Some(model.artifact.version.clone());
                info.architecture = Some(model.network.architecture().to_string());
                info.model_type = Some(model.metadata.model_type.clone());
                info.model_path = Some(model.weights_path.clone());
                info.metadata_path = Some(model.metadata_path.clone());
                info.num_classes = Some(model.metadata.num_classes);
                info.classes = Some(model.metadata.classes.clone());
                info.input_size = model.preprocessor.input_size();
                info.confidence_threshold = model.metadata.confidence_threshold;
                info.output_layout = Some(model.layout());
                info.preprocessing = model.preprocessor.name().to_string();
                info.is_production = Some(model.artifact.is_production);
                info.loaded_at = Some(model.loaded_at);
            }
            None => {
                info.error = Some(
                    last_error
                        .filter(|_| !available)
                        .unwrap_or_else(|| "model is not loaded".to_string()),
                );
            }
        }
        info
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_averages_only_successful_predictions() {
        let mut usage = UsageStats::default();
        usage.record_success(0.8, 0.2);
        usage.record_failure();
        usage.record_success(0.4, 0.4);

        assert_eq!(usage.total_predictions, 3);
        assert_eq!(usage.failed_predictions, 1);
        assert!((usage.avg_confidence - 0.6).abs() < 1e-6);
        assert!((usage.avg_processing_time - 0.3).abs() < 1e-9);
    }
}
