use crate::error::PoolError;
use crate::session::{self, SessionContext};
use pool_common::ConnectionId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Decrements the live-socket counter when a connection task ends,
/// however it ends.
struct ConnGuard {
    active: Arc<AtomicUsize>,
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Accept loop for miner connections.
///
/// Each accepted socket gets its own task. The connection limit counts
/// every accepted socket, including ones still inside the LOGIN window.
/// Address bans are checked before any bytes are read off the socket; a
/// banned address is cut without ever reaching the packet codec.
///
/// # Errors
///
/// Returns an error if the listener's local address cannot be read.
pub async fn run(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), PoolError> {
    let local_addr = listener.local_addr()?;
    info!("listening for miners on {}", local_addr);

    let active = Arc::new(AtomicUsize::new(0));
    let mut next_id: ConnectionId = 0;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if active.load(Ordering::Relaxed) >= ctx.config.max_conns {
                        warn!("max connections reached, rejecting {}", peer);
                        drop(stream);
                        continue;
                    }
                    active.fetch_add(1, Ordering::Relaxed);
                    let guard = ConnGuard {
                        active: active.clone(),
                    };

                    next_id += 1;
                    let id = next_id;
                    let ctx = Arc::clone(&ctx);
                    tokio::spawn(async move {
                        let _guard = guard;
                        match ctx.bans.is_address_banned(peer.ip()).await {
                            Ok(false) => {}
                            Ok(true) => {
                                info!(addr = %peer, "rejecting banned address");
                                return;
                            }
                            Err(e) => {
                                // without a verdict the connection is not allowed in
                                error!(error = %e, addr = %peer, "ban lookup failed, closing connection");
                                return;
                            }
                        }
                        if let Err(e) = session::handle_session(stream, id, peer, ctx).await {
                            debug!(session = id, addr = %peer, "session closed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    error!("failed to accept connection: {}", e);
                }
            },
            _ = shutdown.changed() => {
                info!("accept loop stopping");
                return Ok(());
            }
        }
    }
}
