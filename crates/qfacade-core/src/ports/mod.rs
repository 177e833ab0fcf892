//! Port definitions (trait abstractions) for external systems.
//!
//! Ports define the interfaces that the core domain expects from infrastructure.
//! They contain no implementation details and use only domain types.
//!
//! # Design Rules
//!
//! - No `reqwest` or `tokio::process` types in any signature
//! - Probes report outcomes; they never change process state themselves
//! - Log sinks are synchronous and must not block the output reader

pub mod health_probe;
pub mod log_sink;
pub mod tokenizer;

pub use health_probe::{HealthProbe, ProbeContext, ProbeOutcome};
pub use log_sink::{NoopLogSink, OutputStream, ProcessLogSink};
pub use tokenizer::TokenizerPort;
