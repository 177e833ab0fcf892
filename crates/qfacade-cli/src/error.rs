//! CLI error type and exit code mapping.

use qfacade_core::{FacadeError, ProcessError, SettingsError};
use qfacade_runtime::ServiceError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    /// Settings could not be read, parsed or validated.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    /// A supervised process failed to start or stop.
    #[error("Process error: {0}")]
    Process(String),

    /// A completion request was refused or failed.
    #[error("Request failed: {0}")]
    Request(#[from] FacadeError),
}

impl CliError {
    /// Exit codes follow sysexits.h where one fits.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 78,  // EX_CONFIG
            Self::Io(_) => 74,      // EX_IOERR
            Self::Process(_) => 71, // EX_OSERR
            Self::Request(FacadeError::NotReady { .. } | FacadeError::RestartExhausted { .. }) => {
                69 // EX_UNAVAILABLE
            }
            Self::Request(FacadeError::RequestTimeout { .. }) => 75, // EX_TEMPFAIL
            Self::Request(_) => 1,
        }
    }
}

impl From<SettingsError> for CliError {
    fn from(err: SettingsError) -> Self {
        Self::Config(err.to_string())
    }
}

impl From<ProcessError> for CliError {
    fn from(err: ProcessError) -> Self {
        Self::Process(err.to_string())
    }
}

impl From<ServiceError> for CliError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Settings(e) => e.into(),
            ServiceError::Process(e) => e.into(),
            ServiceError::Facade(e) => Self::Request(e),
            ServiceError::HttpClient(e) => Self::Process(e.to_string()),
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
