//! How supervised children are launched.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;

use qfacade_core::{ModelSettings, ProcessError, TokenizerSettings};
use tokio::process::{Child, Command};
use tracing::debug;

/// Process name of the model runner.
pub const MODEL_PROCESS: &str = "model";

/// Process name of the tokenizer sidecar.
pub const TOKENIZER_PROCESS: &str = "tokenizer";

/// How to start one supervised process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Name used in logs, health and errors.
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Line written to stdin to ask the process to exit.
    pub quit_command: Option<String>,
    pub pid_file: Option<PathBuf>,
}

impl LaunchSpec {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            env: BTreeMap::new(),
            quit_command: None,
            pid_file: None,
        }
    }

    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_quit_command(mut self, command: impl Into<String>) -> Self {
        self.quit_command = Some(command.into());
        self
    }

    #[must_use]
    pub fn with_pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Launch spec for the model runner.
    pub fn for_model(settings: &ModelSettings) -> Self {
        Self {
            name: MODEL_PROCESS.to_string(),
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.as_ref().map(PathBuf::from),
            env: settings.env.clone(),
            quit_command: settings.quit_command.clone(),
            pid_file: settings.pid_file.as_ref().map(PathBuf::from),
        }
    }

    /// Launch spec for the tokenizer sidecar.
    ///
    /// The listen address is also exported as `TOKENIZER_HOST` and
    /// `TOKENIZER_PORT` for scripts that read it from the environment.
    pub fn for_tokenizer(settings: &TokenizerSettings) -> Self {
        let mut env = BTreeMap::new();
        env.insert("TOKENIZER_HOST".to_string(), settings.host.clone());
        env.insert("TOKENIZER_PORT".to_string(), settings.port.to_string());
        Self {
            name: TOKENIZER_PROCESS.to_string(),
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: None,
            env,
            quit_command: None,
            pid_file: settings.pid_file.as_ref().map(PathBuf::from),
        }
    }
}

/// Spawn the process described by `spec` with all three pipes captured.
///
/// On Unix the child leads its own process group so termination can reach
/// everything it spawned.
pub fn spawn(spec: &LaunchSpec) -> Result<Child, ProcessError> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    debug!(process = %spec.name, program = %spec.program, args = ?spec.args, "Spawning process");

    cmd.spawn()
        .map_err(|e| ProcessError::StartFailed(format!("{} ({}): {e}", spec.name, spec.program)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenizer_spec_exports_address() {
        let settings = TokenizerSettings::default();
        let spec = LaunchSpec::for_tokenizer(&settings);
        assert_eq!(spec.name, "tokenizer");
        assert_eq!(spec.env.get("TOKENIZER_PORT").map(String::as_str), Some("12345"));
        assert!(spec.quit_command.is_none());
    }

    #[test]
    fn test_model_spec_carries_quit_command() {
        let spec = LaunchSpec::for_model(&ModelSettings::default());
        assert_eq!(spec.name, "model");
        assert_eq!(spec.quit_command.as_deref(), Some("q"));
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let spec = LaunchSpec::new("ghost", "/definitely/not/a/program");
        let err = spawn(&spec).unwrap_err();
        assert!(matches!(err, ProcessError::StartFailed(msg) if msg.contains("ghost")));
    }
}
