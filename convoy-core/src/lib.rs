//! Convoy Core
//!
//! Core types and abstractions for the Convoy deployment orchestrator.
//!
//! This crate contains:
//! - Domain types: Pipeline topology (stages, actions, artifacts), environments,
//!   service runtime parameters and the run status trail
//! - DTOs: Data transfer objects for communication with the orchestrator API

pub mod domain;
pub mod dto;
