//! Core domain types
//!
//! This module contains the core domain structures used across Convoy crates.
//! Topology types (pipeline, stage, action, artifact) are plain values built once
//! and then handed to the runner for execution. Run types carry the status trail
//! the orchestrator persists.

pub mod action;
pub mod artifact;
pub mod environment;
pub mod failure;
pub mod log;
pub mod pipeline;
pub mod run;
pub mod runtime;
