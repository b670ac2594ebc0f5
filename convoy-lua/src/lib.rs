//! Convoy Lua Definitions
//!
//! Pipelines are written as Lua scripts evaluated in a restricted sandbox.
//! This crate provides:
//! - The sandbox and the module trait/registry for definition modules
//! - The `pipeline` module (define, stage, build, migrate, deploy)
//! - The parser from a script to a validated `PipelineDefinition`
//! - Stub generation for editor support

pub mod module;
pub mod modules;
pub mod parser;
pub mod sandbox;

pub use module::{ConvoyModule, ModuleRegistry};
pub use modules::PipelineModule;
pub use parser::parse_pipeline_definition;
pub use sandbox::{create_sandbox, create_sandbox_with};
