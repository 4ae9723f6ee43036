//! Infrastructure layer: job stores, bus backends, admission, workers, config.

pub mod admission;
pub mod backends;
pub mod config;
pub mod event_bus;
pub mod jobs;
pub mod workers;


pub use admission::{AdmissionError, AdmissionGuard};
pub use backends::{BackendError, Backends};
pub use config::{AppConfig, ConfigError};
