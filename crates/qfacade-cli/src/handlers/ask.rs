use qfacade_core::{CompletionOptions, ConversationTurn, Settings};
use qfacade_runtime::FacadeService;

use super::{opening_turns, usage_line};
use crate::error::CliError;

/// Boot, answer one question, shut down.
pub async fn execute(
    settings: Settings,
    message: &[String],
    system: Option<String>,
) -> Result<(), CliError> {
    let mut turns = opening_turns(system);
    turns.push(ConversationTurn::user(message.join(" ")));

    let service = FacadeService::start(settings).await?;
    let result = service.complete(&turns, CompletionOptions::default()).await;
    let stopped = service.shutdown().await;

    let completion = result?;
    println!("{}", completion.text);
    eprintln!("{}", usage_line(&completion));
    stopped?;
    Ok(())
}
