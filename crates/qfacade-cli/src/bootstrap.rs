//! Settings loading and logging setup.
//!
//! Load order: defaults, the JSON settings file, then `QFACADE_*` environment
//! overrides. The result is validated before anything is spawned.

use std::path::Path;

use qfacade_core::{Settings, SettingsError, validate_settings};
use tracing_subscriber::EnvFilter;

use crate::error::CliError;

pub const ENV_MODEL_PROGRAM: &str = "QFACADE_MODEL_PROGRAM";
pub const ENV_TOKENIZER_PORT: &str = "QFACADE_TOKENIZER_PORT";
pub const ENV_TERMINAL_MARKER: &str = "QFACADE_TERMINAL_MARKER";
pub const ENV_LOG_LEVEL: &str = "QFACADE_LOG_LEVEL";

/// Load, override from the process environment and validate.
pub fn load_settings(path: Option<&Path>) -> Result<Settings, CliError> {
    load_settings_with(path, |key| std::env::var(key).ok())
}

/// Like [`load_settings`], reading overrides through `lookup`.
pub fn load_settings_with(
    path: Option<&Path>,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Settings, CliError> {
    let mut settings = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path).map_err(|e| {
                CliError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            Settings::from_json(&json)?
        }
        None => Settings::default(),
    };

    apply_env_overrides(&mut settings, lookup)?;
    validate_settings(&settings)?;
    Ok(settings)
}

/// Apply the `QFACADE_*` overrides that are set.
pub fn apply_env_overrides(
    settings: &mut Settings,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<(), SettingsError> {
    if let Some(program) = lookup(ENV_MODEL_PROGRAM) {
        settings.model.program = program;
    }
    if let Some(port) = lookup(ENV_TOKENIZER_PORT) {
        settings.tokenizer.port = port
            .trim()
            .parse()
            .map_err(|_| SettingsError::Parse(format!("{ENV_TOKENIZER_PORT}={port} is not a port")))?;
    }
    if let Some(marker) = lookup(ENV_TERMINAL_MARKER) {
        settings.model.terminal_marker = marker;
    }
    if let Some(level) = lookup(ENV_LOG_LEVEL) {
        settings.logging.level = level;
    }
    Ok(())
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured level; `--verbose` forces `debug`.
/// Logs go to stderr so stdout carries only answers and JSON.
pub fn init_logging(level: &str, verbose: bool) {
    let fallback = if verbose { "debug" } else { level };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
