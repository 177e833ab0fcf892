//! Child process plumbing: spawning, output capture and shutdown.

pub mod command;
pub mod logs;
pub mod shutdown;
pub mod stream;

pub use command::{LaunchSpec, MODEL_PROCESS, TOKENIZER_PROCESS, spawn};
pub use logs::{ProcessLogBuffer, ProcessLogEntry};
pub use shutdown::shutdown_child;
pub use stream::{OutputEvent, OutputLine, StreamReader};
