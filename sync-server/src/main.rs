//! LoopSync - Sync Server
//!
//! Hands out the shared loop clock and relays presence over websockets,
//! with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode

mod config;
mod dashboard;
mod metrics;
mod network;
mod ws;

use std::sync::Arc;

use loopsync_core::{LoopClock, SyncEngine};
use parking_lot::RwLock;

#[tokio::main]
async fn main() -> Result<(), network::BoxError> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    let config = config::ServerConfig::from_env()?;

    // The loop epoch is fixed here for the life of the process
    let clock = LoopClock::starting_now(config.loop_duration);
    let engine = Arc::new(SyncEngine::new(clock, config.engine_config()));

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        // Run with TUI dashboard
        dashboard::run(config, engine, metrics).await
    } else {
        // Run with plain logging
        network::run_with_logging(config, engine, metrics).await
    }
}
