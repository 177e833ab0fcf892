//! Core domain for qfacade.
//!
//! Conversation and health types, the lifecycle state machine, restart
//! backoff, the chat template encoder, the error taxonomy, settings and the
//! port traits. Nothing in this crate spawns processes or opens sockets.

pub mod backoff;
pub mod domain;
pub mod error;
pub mod ports;
pub mod settings;
pub mod template;

pub use backoff::{BackoffTracker, RestartDecision, RestartPolicy};
pub use domain::{
    Completion, CompletionOptions, ConversationTurn, HealthSnapshot, HealthState, LifecycleEvent,
    ProcessHealth, ResolvedOptions, TransitionError, TurnRole,
};
pub use error::{ErrorKind, FacadeError, ProcessError, TimeoutPhase};
pub use ports::{
    HealthProbe, NoopLogSink, OutputStream, ProbeContext, ProbeOutcome, ProcessLogSink,
    TokenizerPort,
};
pub use settings::{
    DEFAULT_TERMINAL_MARKER, DEFAULT_TOKENIZER_PORT, GenerationDefaults, LoggingSettings,
    ModelSettings, QueueSettings, Settings, SettingsError, SupervisorSettings, TemplateSource,
    TokenizerSettings, validate_settings,
};
pub use template::{ChatTemplate, EncodingError, TemplateWarning};
