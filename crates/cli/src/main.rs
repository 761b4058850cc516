//! Dialoguard CLI — the main entry point.
//!
//! Commands:
//! - `serve`    — Start the HTTP gateway
//! - `chat`     — Send one message through the full turn pipeline
//! - `topics`   — Show the topics parsed from a configuration document
//! - `scan`     — Run the pre-flight keyword scan on a text
//! - `validate` — Check a response payload against the envelope schema
//! - `doctor`   — Diagnose configuration and storage

use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "dialoguard",
    about = "Dialoguard — structured, safety-aware delivery for conversational assistants",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (defaults to ~/.dialoguard/config.toml)
    #[arg(short, long, global = true, env = "DIALOGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Send a single message and print the committed reply
    Chat {
        /// The message to send
        message: String,

        /// Stream the reply as it arrives
        #[arg(short, long)]
        stream: bool,

        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<String>,

        /// User the conversation belongs to
        #[arg(long, default_value = "cli")]
        user: String,

        /// Conversation language (overrides the config)
        #[arg(long)]
        language: Option<String>,
    },

    /// Parse a configuration document and list its trackable topics
    Topics {
        /// Document to parse
        file: PathBuf,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Scan a text against the configured safety keywords
    Scan {
        /// Text to scan
        text: String,
    },

    /// Validate a response payload file against the envelope schema
    Validate {
        /// File holding the upstream reply
        file: PathBuf,
    },

    /// Diagnose configuration and storage
    Doctor,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_path = cli.config.as_deref();

    match cli.command {
        Commands::Serve { port } => commands::serve::run(config_path, port).await?,
        Commands::Chat {
            message,
            stream,
            conversation,
            user,
            language,
        } => {
            let options = commands::chat::ChatOptions {
                stream,
                conversation,
                user,
                language,
            };
            commands::chat::run(config_path, message, options).await?
        }
        Commands::Topics { file, json } => commands::topics::run(&file, json)?,
        Commands::Scan { text } => commands::scan::run(config_path, &text)?,
        Commands::Validate { file } => commands::validate::run(&file)?,
        Commands::Doctor => commands::doctor::run(config_path).await?,
    }

    Ok(())
}
