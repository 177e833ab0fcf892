use std::time::Duration;

use qfacade_core::Settings;
use qfacade_runtime::FacadeService;

use crate::error::CliError;

/// Boot, optionally wait, print the snapshot as JSON, shut down.
pub async fn execute(settings: Settings, wait_secs: u64) -> Result<(), CliError> {
    let service = FacadeService::start(settings).await?;
    if wait_secs > 0 {
        tokio::time::sleep(Duration::from_secs(wait_secs)).await;
    }

    let snapshot = service.health_snapshot();
    let rendered = serde_json::to_string_pretty(&snapshot)
        .map_err(|e| CliError::Io(format!("cannot render health snapshot: {e}")));
    service.shutdown().await?;

    println!("{}", rendered?);
    Ok(())
}
