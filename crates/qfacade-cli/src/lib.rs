//! Development CLI for qfacade.
//!
//! Boots the tokenizer sidecar and the model runner through
//! [`qfacade_runtime::FacadeService`] and offers one-shot, interactive and
//! health commands on top of it.

pub mod bootstrap;
pub mod commands;
pub mod error;
pub mod handlers;
pub mod parser;

pub use commands::Commands;
pub use error::CliError;
pub use parser::Cli;
