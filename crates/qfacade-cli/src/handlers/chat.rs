//! Interactive conversation over stdin.
//!
//! Every line is a user turn; the reply is appended to the history so the next
//! prompt carries the whole conversation. `/reset` clears the history (keeping
//! the system prompt), `/health` prints the snapshot, `/reload` restarts the
//! tokenizer (and the model runner if it is down), `/quit` or EOF exits.

use std::io::Write;

use qfacade_core::{CompletionOptions, ConversationTurn, HealthSnapshot, Settings};
use qfacade_runtime::FacadeService;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use super::{opening_turns, usage_line};
use crate::error::CliError;

pub async fn execute(settings: Settings, system: Option<String>) -> Result<(), CliError> {
    let opening = opening_turns(system);
    let mut history = opening.clone();

    let service = FacadeService::start(settings).await?;
    eprintln!("Ready. Type a message, /reset, /health, /reload or /quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let outcome = loop {
        prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(CliError::from(e)),
        };

        match line.trim() {
            "" => {}
            "/quit" | "/exit" => break Ok(()),
            "/reset" => {
                history.clone_from(&opening);
                eprintln!("History cleared.");
            }
            "/health" => print_snapshot(&service.health_snapshot()),
            "/reload" => match service.reload().await {
                Ok(snapshot) => print_snapshot(&snapshot),
                Err(e) => eprintln!("Reload failed: {e}"),
            },
            text => {
                history.push(ConversationTurn::user(text));
                match service.complete(&history, CompletionOptions::default()).await {
                    Ok(completion) => {
                        println!("{}", completion.text);
                        eprintln!("{}", usage_line(&completion));
                        history.push(ConversationTurn::assistant(completion.text));
                    }
                    Err(e) => {
                        // The failed turn is not part of the conversation.
                        history.pop();
                        eprintln!("Error: {e}");
                    }
                }
            }
        }
    };

    service.shutdown().await?;
    outcome
}

fn print_snapshot(snapshot: &HealthSnapshot) {
    match serde_json::to_string_pretty(snapshot) {
        Ok(json) => println!("{json}"),
        Err(e) => warn!(error = %e, "Failed to render health snapshot"),
    }
}

fn prompt() {
    eprint!("> ");
    let _ = std::io::stderr().flush();
}
