use clap::Subcommand;

#[derive(Subcommand)]
pub enum Commands {
    /// Ask a single question and print the answer
    Ask {
        /// The question to ask
        #[arg(required = true, num_args = 1..)]
        message: Vec<String>,
        /// System prompt sent before the question
        #[arg(long)]
        system: Option<String>,
    },
    /// Interactive conversation over stdin (EOF or /quit to exit)
    Chat {
        /// System prompt that opens the conversation
        #[arg(long)]
        system: Option<String>,
    },
    /// Boot both processes and print the health snapshot as JSON
    Health {
        /// Seconds to wait after startup before sampling
        #[arg(long, default_value_t = 0)]
        wait: u64,
    },
    /// Load and validate settings, then print them as JSON
    CheckConfig,
}
