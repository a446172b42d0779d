//! Graceful shutdown: waits on SIGINT/SIGTERM (or, on non-Unix targets, Ctrl-C only) and
//! drains the session registry before returning, matching the lifecycle the Listener and
//! every Session task honor via their shared [`CancellationToken`]s.

use std::sync::Arc;

use log::info;
use tokio_util::sync::CancellationToken;

use crate::relay::tcprelay::registry::SessionRegistry;

/// Waits for a shutdown signal, then cancels `listener_shutdown` (stop accepting new
/// connections) and drains `registry` (let every live Session finish tearing down)
/// before returning.
pub async fn wait_for_shutdown(listener_shutdown: CancellationToken, registry: Arc<SessionRegistry>) {
    wait_for_signal().await;
    info!("shutdown requested, draining {} active session(s)", registry.len());
    listener_shutdown.cancel();
    registry.shutdown().await;
    info!("shutdown complete");
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = sigint.recv() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("received Ctrl-C");
}
