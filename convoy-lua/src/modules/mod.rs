//! Modules available to pipeline definition scripts
//!
//! Definition scripts are evaluated, never executed against real systems, so
//! every module here is pure: it shapes tables and nothing else.

pub mod pipeline;

pub use pipeline::PipelineModule;
