//! Runtime adapters for qfacade.
//!
//! Process supervision, output correlation, request admission, the tokenizer
//! sidecar client and the composition root that wires them to the core.

pub mod correlator;
pub mod health;
pub mod orchestrator;
pub mod pidfile;
pub mod process;
pub mod readiness;
pub mod serializer;
pub mod service;
pub mod supervisor;
pub mod tokenizer_client;

#[cfg(test)]
mod testing;

pub use correlator::{CorrelationWindow, CorrelatorConfig, Exchange, LineChannel, StreamCorrelator};
pub use health::{HttpHealthProbe, OutputPatternProbe, check_http_health};
pub use orchestrator::ChatCompletionOrchestrator;
pub use process::{
    LaunchSpec, MODEL_PROCESS, OutputEvent, OutputLine, ProcessLogBuffer, ProcessLogEntry,
    TOKENIZER_PROCESS,
};
pub use readiness::ReadinessGate;
pub use serializer::{RequestSerializer, Ticket, TimeoutHook};
pub use service::{FacadeService, ServiceError};
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
pub use tokenizer_client::TokenizerSidecarClient;
