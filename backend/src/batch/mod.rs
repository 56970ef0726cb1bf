pub mod models;
pub mod runner;
pub mod store;

pub use models::{BatchJob, ClassificationRecord, ImageRecord, InvalidTransition};
pub use runner::{BatchError, BatchRunner};
pub use store::{BatchJobStore, ImageRepository, MemoryStore, StoreError};
