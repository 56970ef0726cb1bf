pub mod backend;
pub mod checkpoint;
pub mod error;
pub mod metadata;
pub mod prediction;
pub mod preprocess;
pub mod service;
#[cfg(feature = "torch")]
pub mod torch;

pub use backend::{ModelLoader, Network, OutputLayout, RawOutput};
pub use error::{ClassifierError, InferenceError, LoadError};
pub use metadata::{ClassMapping, ModelMetadata};
pub use preprocess::{ImageInput, Preprocessor, TtaView};
pub use service::{ClassifierService, LoadState, LoadedModel, ModelInfo, UsageStats};
