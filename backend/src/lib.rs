pub mod batch;
pub mod classifier;
pub mod config;
pub mod notify;
pub mod registry;
pub mod routes;
