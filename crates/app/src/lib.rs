pub mod config;
pub mod tracker;

pub use config::{ConfigError, Settings, BUILTIN_CATALOG, DATA_DIR_ENV};
pub use tracker::{Expiring, ImportSummary, Tracker, TrackerError};
