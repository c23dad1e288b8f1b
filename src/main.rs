//! cukemerlin - cucumber wire protocol step server for event-broker testing
//!
//! Runs a step server that a cucumber runner drives over the wire protocol,
//! and a couple of client-side helpers for inspecting it.

use std::sync::Arc;

use clap::Parser;
use commands::Commands;
use cukemerlin::broker::TextEventCodec;
use cukemerlin::common::{config::Config, logging, Result};
use cukemerlin::server::{self, ServerContext};
use cukemerlin::{cli, commands, steps};

#[derive(Parser)]
#[command(name = "cukemerlin", about = "Cucumber step server for event-broker tests")]
#[command(version, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Serve {
            bind_address,
            bind_port,
            config,
            log,
            log_file,
        } => {
            let log_file = log_file.or_else(|| log.then(logging::default_log_path).flatten());
            if let Some(path) = logging::init(log_file.as_deref()) {
                tracing::info!("Logging to {}", path.display());
            }
            serve(config, bind_address, bind_port).await
        }
        command => {
            logging::init(None);
            cli::dispatch(command).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn serve(
    config_path: Option<std::path::PathBuf>,
    bind_address: Option<String>,
    bind_port: Option<u16>,
) -> Result<()> {
    let mut config = Config::load(config_path.as_deref())?;
    if let Some(address) = bind_address {
        config.server.bind_address = address;
    }
    if let Some(port) = bind_port {
        config.server.bind_port = port;
    }

    let context = ServerContext::new(
        steps::builtin()?,
        Arc::new(TextEventCodec),
        config.timeouts.clone(),
    );
    server::run(config, context).await
}
