//! Tutorlamp server binary

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use tutorlamp::config::Config;

#[derive(Parser)]
#[command(name = "tutorlamp", version, about = "Real-time voice tutoring backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the conversation server
    Serve {
        /// Listen address override
        #[arg(long)]
        host: Option<String>,
        /// Listen port override
        #[arg(long)]
        port: Option<u16>,
        /// Path to a config file (defaults to the standard location)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // INFO level by default; RUST_LOG overrides
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { host, port, config } => {
            let mut config = match config {
                Some(path) => Config::load_from(&path)?,
                None => Config::load()?,
            };
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            tutorlamp::server::start(config).await
        }
    }
}
