//! Sandbox validation: manifest mutation, stage driver, test summaries.

pub mod engine;
pub mod manifest;
pub mod summary;

pub use engine::{
    stage, NoopObserver, StageObserver, ValidationConfig, ValidationEngine, ValidationRequest,
};
pub use manifest::{ManifestError, ManifestResult};
pub use summary::parse_test_summary;
