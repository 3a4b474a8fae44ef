//! Bamel Controller
//!
//! Drives bare-metal machines through their power lifecycle and keeps each
//! pool's ready capacity at the level its `BamelAutoscaler` asks for.
//!
//! `BareMetalNode` objects are reconciled one at a time through a per-node
//! state machine (off, powering-on, ready, draining, error). Pools are
//! reconciled by the autoscaler, which only ever edits a node's desired
//! power state and lets the state machine do the rest.

mod backoff;
mod config;
mod controller;
mod credentials;
mod error;
mod metrics;
mod pool_index;
mod reconciler;
mod runtime;
mod scheduler;
mod server;
mod store;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::Config;
use crate::error::ControllerError;
use controller::Controller;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Redfish and the API client both use rustls; pin the provider once.
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        debug!("rustls crypto provider already installed");
    }

    info!("Starting Bamel controller");

    let config = Config::from_env()?;
    info!("Configuration:");
    info!("  Credentials namespace: {}", config.credentials_namespace);
    info!("  Workers: {} node, {} pool", config.node_workers, config.pool_workers);
    info!("  Drain timeout: {:?} ({:?})", config.drain_timeout, config.drain_timeout_policy);
    info!("  Auto recover: {}", config.auto_recover);
    info!("  Probe address: {}", config.probe_addr);

    let controller = Controller::new(config).await?;
    controller.run().await
}
