//! CLI entry point.

use clap::Parser;

use qfacade_cli::{Cli, CliError, Commands, bootstrap, handlers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables before settings read their overrides
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let settings = match bootstrap::load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => exit(&e),
    };
    bootstrap::init_logging(&settings.logging.level, cli.verbose);

    let result = match cli.command {
        Commands::Ask { message, system } => handlers::ask::execute(settings, &message, system).await,
        Commands::Chat { system } => handlers::chat::execute(settings, system).await,
        Commands::Health { wait } => handlers::health::execute(settings, wait).await,
        Commands::CheckConfig => handlers::check_config::execute(&settings),
    };

    if let Err(e) = result {
        exit(&e);
    }
    Ok(())
}

fn exit(error: &CliError) -> ! {
    eprintln!("Error: {error}");
    std::process::exit(error.exit_code());
}
