//! Step server - accepts test runner connections and runs their scenarios
//!
//! Every runner connection is served by one task that owns its scenario
//! session outright. Links opened by step handlers report back to that task
//! over a channel, so no handler state is shared between tasks.

mod handler;
mod server;
mod session;

use std::sync::Arc;

pub use handler::{handle_command, handle_frame, verdict_reply, Dispatch};
pub use server::Server;
pub use session::{ScenarioSession, SessionFactory};

use crate::broker::EventCodec;
use crate::common::config::{Config, Timeouts};
use crate::common::Result;
use crate::steps::StepRegistry;

/// Process-wide state shared read-only by every connection
pub struct ServerContext {
    pub registry: StepRegistry,
    pub codec: Arc<dyn EventCodec>,
    pub timeouts: Timeouts,
}

impl ServerContext {
    pub fn new(registry: StepRegistry, codec: Arc<dyn EventCodec>, timeouts: Timeouts) -> Self {
        Self {
            registry,
            codec,
            timeouts,
        }
    }
}

/// Run the server until a termination signal arrives
pub async fn run(config: Config, context: ServerContext) -> Result<()> {
    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        steps = context.registry.len(),
        "Starting step server"
    );

    let server = Server::bind(&config, context).await?;
    server.serve(shutdown_signal()).await
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint, mut sighup) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(term), Ok(int), Ok(hup)) => (term, int, hup),
        _ => {
            tracing::warn!("Failed to install signal handlers, falling back to Ctrl+C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
        _ = sighup.recv() => tracing::info!("Received SIGHUP, shutting down gracefully"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Received Ctrl+C, shutting down gracefully");
}
