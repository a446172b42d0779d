//! The local-side Listener: binds the SOCKS5-facing socket, accepts connections, and
//! spawns one Session task per accepted connection (§4.1). The accept loop never
//! terminates on a per-connection error — only a fatal listener-level error or a
//! shutdown request ends it.

mod session;

use std::io;
use std::sync::Arc;

use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::SharedContext;

use super::registry::SessionRegistry;

/// Runs the accept loop until `shutdown` fires. Every accepted connection is registered
/// with `registry` before its Session task starts, and deregistered when that task ends,
/// so `registry.shutdown()` can always account for every live connection.
pub async fn run(ctx: SharedContext, registry: Arc<SessionRegistry>, shutdown: CancellationToken) -> io::Result<()> {
    let bind_addr = (ctx.config().local_addr, ctx.config().local_port);
    let listener = TcpListener::bind(bind_addr).await?;
    info!("listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("listener shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!("accept failed: {err}");
                        continue;
                    }
                };

                if let Err(err) = stream.set_nodelay(true) {
                    warn!("failed to set TCP_NODELAY for {peer}: {err}");
                }

                let handle = registry.register();
                let session_id = handle.id;
                let ctx = ctx.clone();
                let registry = registry.clone();
                let session_shutdown = handle.shutdown;

                tokio::spawn(async move {
                    session::run_session(ctx, stream, peer, session_shutdown).await;
                    registry.deregister(session_id);
                });
            }
        }
    }
}
