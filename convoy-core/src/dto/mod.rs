//! Data Transfer Objects for the orchestrator API
//!
//! Request and response bodies exchanged between the orchestrator, the client
//! library and the CLI. Responses that are plain domain records (runs, log
//! entries, runtime snapshots) are sent as-is.

pub mod pipeline;
pub mod run;
pub mod service;
