//! Service Module
//!
//! Business logic layer for the orchestrator.
//! Services orchestrate between repositories and contain domain logic.

pub mod log;
pub mod pipeline;
pub mod run;
pub mod runtime;

// Re-export for convenience
pub use log as log_service;
pub use pipeline as pipeline_service;
pub use run as run_service;
pub use runtime as runtime_service;
