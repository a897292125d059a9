#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use poold::banlist::BanList;
use poold::config::{Args, PoolConfig};
use poold::manager;
use poold::registry::SessionRegistry;
use poold::session::SessionContext;
use poold::store::{self, StoreHandle};
use poold::wallet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let config: PoolConfig = args.into();
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let store = StoreHandle::open(&config.db_path)
        .map_err(|e| anyhow::anyhow!("failed to open store at {:?}: {e}", config.db_path))?;
    store::bootstrap(&store, &config).await?;
    info!("store ready at {:?}", config.db_path);

    let registry = Arc::new(SessionRegistry::new());
    let bans = Arc::new(BanList::new(
        store.clone(),
        Duration::from_secs(config.ban_cache_ttl),
    ));

    let (wallet_handle, wallet_events) = wallet::spawn(&config);
    let manager = manager::spawn(
        registry.clone(),
        store.clone(),
        wallet_handle.clone(),
        wallet_events,
    );

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(SessionContext {
        config: config.clone(),
        manager: manager.clone(),
        registry: registry.clone(),
        store,
        bans,
        wallet: wallet_handle,
    });

    tokio::select! {
        result = poold::run(listener, ctx, shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        () = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Cooperative shutdown: stop accepting, broadcast stop to every
    // session, then give them a bounded window to drain.
    let _ = shutdown_tx.send(true);
    manager.stop().await;

    let deadline = Instant::now() + Duration::from_secs(config.shutdown_deadline);
    while !registry.is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    if registry.is_empty() {
        info!("all sessions drained, exiting");
    } else {
        warn!(
            remaining = registry.len(),
            "shutdown deadline reached, closing anyway"
        );
    }

    Ok(())
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
        _ = quit.recv() => {}
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
