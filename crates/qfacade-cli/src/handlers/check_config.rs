use qfacade_core::Settings;

use crate::error::CliError;

/// Print the effective settings; loading already validated them.
pub fn execute(settings: &Settings) -> Result<(), CliError> {
    let json = serde_json::to_string_pretty(settings)
        .map_err(|e| CliError::Config(format!("cannot render settings: {e}")))?;
    println!("{json}");
    eprintln!("Settings are valid.");
    Ok(())
}
