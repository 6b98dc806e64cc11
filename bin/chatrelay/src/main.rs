mod commands;

use chatrelay_core::ChatMode;
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Relay chat completions through a browser-driven chat web app", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the OpenAI-compatible HTTP gateway (long-running daemon)
    Gateway {
        /// Port to listen on (overrides config gateway.port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Host to bind to (overrides config gateway.host)
        #[arg(long)]
        host: Option<String>,
    },

    /// Send one message and print the reply
    Send {
        /// Message text
        #[arg(short, long)]
        message: String,

        /// Chat mode: project | temporary (defaults to automation.defaultMode)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<ChatMode>,

        /// Print the reply incrementally as it renders
        #[arg(long)]
        stream: bool,
    },

    /// Check whether the browser session can be brought up
    Status,

    /// Delete conversations left behind in the chat app
    Cleanup {
        /// Chat mode: project | temporary (defaults to automation.defaultMode)
        #[arg(long, value_parser = parse_mode)]
        mode: Option<ChatMode>,

        /// Project conversations to delete, newest first
        #[arg(long)]
        count: Option<usize>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective configuration (file plus environment)
    Show,
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

fn parse_mode(s: &str) -> Result<ChatMode, String> {
    ChatMode::parse(s).ok_or_else(|| format!("unknown chat mode '{}' (expected project or temporary)", s))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing; RUST_LOG wins over the verbosity flag
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Gateway { port, host } => {
            commands::gateway::run(host, port).await?;
        }
        Commands::Send { message, mode, stream } => {
            commands::send::run(&message, mode, stream).await?;
        }
        Commands::Status => {
            commands::status::run().await?;
        }
        Commands::Cleanup { mode, count } => {
            commands::cleanup::run(mode, count).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => {
                commands::config_cmd::show().await?;
            }
            ConfigCommands::Init { force } => {
                commands::config_cmd::init(force).await?;
            }
        },
    }

    Ok(())
}
