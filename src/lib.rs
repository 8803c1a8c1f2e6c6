/// ciwatch - A telemetry sidecar for CI jobs
///
/// This library samples system resource usage for the lifetime of a CI job,
/// supervises an external process tracer, and reports both to a remote
/// collector when the job ends.
pub mod cli;
pub mod collector;
pub mod config;
pub mod core;
pub mod daemon;
pub mod identity;
pub mod orchestrator;
pub mod reporter;
pub mod state;
pub mod task_manager;
pub mod tracer;

// Re-export core types for convenience
pub use core::*;
