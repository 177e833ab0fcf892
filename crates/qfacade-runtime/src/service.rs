//! Composition root: both supervisors, the gate and the orchestrator.
//!
//! Startup order is tokenizer first, then the model runner; shutdown is the
//! reverse. Each supervisor owns its child; the service only holds handles.

use std::sync::Arc;

use qfacade_core::{
    Completion, CompletionOptions, ConversationTurn, FacadeError, HealthSnapshot, ProcessError,
    Settings, SettingsError, validate_settings,
};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::correlator::{CorrelatorConfig, LineChannel, StreamCorrelator};
use crate::health::{HttpHealthProbe, OutputPatternProbe};
use crate::orchestrator::ChatCompletionOrchestrator;
use crate::process::{LaunchSpec, MODEL_PROCESS, ProcessLogBuffer, TOKENIZER_PROCESS};
use crate::readiness::ReadinessGate;
use crate::serializer::{RequestSerializer, Ticket, TimeoutHook};
use crate::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::tokenizer_client::TokenizerSidecarClient;

/// Failure to bring the service up.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Invalid settings: {0}")]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Facade(#[from] FacadeError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

pub struct FacadeService {
    settings: Settings,
    tokenizer: Arc<ProcessSupervisor>,
    model: Arc<ProcessSupervisor>,
    tokenizer_client: Arc<TokenizerSidecarClient>,
    orchestrator: ChatCompletionOrchestrator,
}

impl FacadeService {
    /// Start both processes and wait until each is ready.
    ///
    /// If the model runner does not come up, the tokenizer is stopped again.
    pub async fn start(settings: Settings) -> Result<Self, ServiceError> {
        validate_settings(&settings)?;
        let grace = settings.supervisor.stop_grace();

        let tokenizer = Arc::new(tokenizer_supervisor(&settings)?);
        info!(url = %settings.tokenizer.base_url(), "Starting tokenizer sidecar");
        tokenizer.start().await?;
        if let Err(e) = tokenizer
            .wait_ready(settings.tokenizer.startup_timeout())
            .await
        {
            error!(error = %e, "Tokenizer sidecar did not become ready");
            stop_quietly(&tokenizer, grace).await;
            return Err(e.into());
        }

        let model = Arc::new(model_supervisor(&settings));
        info!(program = %settings.model.program, "Starting model runner");
        let started = match model.start().await {
            Ok(()) => model
                .wait_ready(settings.model.startup_timeout())
                .await
                .map_err(ServiceError::from),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = started {
            error!(error = %e, "Model runner did not become ready");
            stop_quietly(&model, grace).await;
            stop_quietly(&tokenizer, grace).await;
            return Err(e);
        }

        let gate = ReadinessGate::new()
            .with_process(TOKENIZER_PROCESS, tokenizer.health_receiver())
            .with_process(MODEL_PROCESS, model.health_receiver());
        let tokenizer_gate =
            ReadinessGate::new().with_process(TOKENIZER_PROCESS, tokenizer.health_receiver());
        let tokenizer_client = Arc::new(TokenizerSidecarClient::from_settings(
            &settings.tokenizer,
            tokenizer_gate,
        )?);

        let verify: TimeoutHook = {
            let model = Arc::clone(&model);
            Arc::new(move |ticket: &Ticket| {
                warn!(request_id = %ticket.id, "Request deadline passed, verifying model runner");
                model.request_verification(model.health().epoch);
            })
        };
        let serializer =
            Arc::new(RequestSerializer::from_settings(&settings.queue).with_timeout_hook(verify));

        let channel: Arc<dyn LineChannel> = model.clone();
        let correlator = Arc::new(StreamCorrelator::new(
            channel,
            CorrelatorConfig::from_settings(&settings.model),
        ));

        let orchestrator = ChatCompletionOrchestrator::new(
            gate,
            tokenizer_client.clone(),
            serializer,
            correlator,
        )
        .with_template_source(
            settings.tokenizer.template_source,
            settings.tokenizer.template.clone(),
        )
        .with_generation_defaults(settings.generation)
        .with_model_name(settings.model.name.clone());

        info!(model = %settings.model.name, "Service ready");
        Ok(Self {
            settings,
            tokenizer,
            model,
            tokenizer_client,
            orchestrator,
        })
    }

    pub async fn complete(
        &self,
        messages: &[ConversationTurn],
        options: CompletionOptions,
    ) -> Result<Completion, FacadeError> {
        self.orchestrator.complete(messages, options).await
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        self.orchestrator.health_snapshot()
    }

    pub const fn orchestrator(&self) -> &ChatCompletionOrchestrator {
        &self.orchestrator
    }

    pub const fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn model(&self) -> &ProcessSupervisor {
        &self.model
    }

    pub fn tokenizer(&self) -> &ProcessSupervisor {
        &self.tokenizer
    }

    pub fn tokenizer_client(&self) -> &TokenizerSidecarClient {
        &self.tokenizer_client
    }

    /// Restart the tokenizer sidecar, and the model runner too when it is not
    /// ready.
    ///
    /// A healthy model runner is left alone; reloading it is expensive. Each
    /// restarted process must come back within its startup timeout.
    pub async fn reload(&self) -> Result<HealthSnapshot, ServiceError> {
        info!("Reload requested");

        let tokenizer = self.tokenizer.health();
        self.tokenizer.restart().await?;
        self.tokenizer
            .wait_ready_since(tokenizer.epoch, self.settings.tokenizer.startup_timeout())
            .await?;

        let model = self.model.health();
        if model.is_ready() {
            debug!(epoch = model.epoch, "Model runner is ready, keeping it");
        } else {
            warn!(state = %model.state, fatal = model.fatal, "Model runner not ready, restarting it");
            self.model.restart().await?;
            self.model
                .wait_ready_since(model.epoch, self.settings.model.startup_timeout())
                .await?;
        }

        info!("Reload complete");
        Ok(self.health_snapshot())
    }

    /// Stop the model runner, then the tokenizer.
    pub async fn shutdown(&self) -> Result<(), ProcessError> {
        let grace = self.settings.supervisor.stop_grace();
        info!("Shutting down");
        let model = self.model.stop(grace).await;
        let tokenizer = self.tokenizer.stop(grace).await;
        model.and(tokenizer)
    }
}

fn tokenizer_supervisor(settings: &Settings) -> Result<ProcessSupervisor, reqwest::Error> {
    let probe = HttpHealthProbe::new(
        format!("{}/health", settings.tokenizer.base_url()),
        settings.tokenizer.http_timeout(),
    )?;
    let config = SupervisorConfig::from_settings(
        &settings.supervisor,
        settings.tokenizer.startup_timeout(),
    );
    Ok(ProcessSupervisor::new(
        LaunchSpec::for_tokenizer(&settings.tokenizer),
        config,
        Arc::new(probe),
        Arc::new(ProcessLogBuffer::new()),
    ))
}

fn model_supervisor(settings: &Settings) -> ProcessSupervisor {
    let model = &settings.model;
    let logs = Arc::new(ProcessLogBuffer::new());

    let mut patterns = model.ready_patterns.clone();
    patterns.push(model.terminal_marker.clone());
    let probe = OutputPatternProbe::new(Arc::clone(&logs), patterns);

    let config = SupervisorConfig::from_settings(&settings.supervisor, model.startup_timeout())
        .with_terminal_marker(model.terminal_marker.clone())
        .with_restart_on_response_timeout(model.restart_on_response_timeout);

    ProcessSupervisor::new(LaunchSpec::for_model(model), config, Arc::new(probe), logs)
}

async fn stop_quietly(supervisor: &ProcessSupervisor, grace: std::time::Duration) {
    if let Err(e) = supervisor.stop(grace).await {
        warn!(process = %supervisor.name(), error = %e, "Failed to stop process");
    }
}
