//! Pool manager.
//!
//! An actor task that owns the authoritative pool state: current chain
//! height, the cached block template, and the generation counter that
//! invalidates in-flight block requests. It consumes wallet-link events,
//! arbitrates template requests from miner sessions, broadcasts height
//! changes across the session registry, and records accepted blocks.
//!
//! External readers never touch the actor for snapshots: height and
//! generation are mirrored into atomics on every change.

use crate::error::PoolError;
use crate::registry::{SessionNotify, SessionRegistry};
use crate::store::{unix_now, BlockRecord, StoreHandle};
use crate::wallet::{WalletEvent, WalletHandle};
use pool_common::block::BlockTemplate;
use pool_common::ConnectionId;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

type TemplateReply = oneshot::Sender<Result<(Arc<BlockTemplate>, u64), PoolError>>;

enum ManagerCommand {
    SetCurrentHeight(u32),
    SetBlock(BlockTemplate),
    RequestBlock {
        session_id: ConnectionId,
        reply: TemplateReply,
    },
    Stop {
        done: oneshot::Sender<()>,
    },
}

/// Generation mirror value before any template has been accepted.
const NO_TEMPLATE: u64 = u64::MAX;

/// Cloneable handle for talking to the pool manager task.
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<ManagerCommand>,
    height: Arc<AtomicU32>,
    generation: Arc<AtomicU64>,
    template_generation: Arc<AtomicU64>,
}

impl ManagerHandle {
    /// Snapshot of the current chain height.
    #[must_use]
    pub fn current_height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Snapshot of the current template generation.
    #[must_use]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Snapshot of whether a template for the current generation is
    /// cached and would be served without an upstream round trip.
    #[must_use]
    pub fn has_current_template(&self) -> bool {
        self.template_generation.load(Ordering::Acquire) == self.generation.load(Ordering::Acquire)
    }

    /// Feeds a height update into the manager (monotone; lower heights
    /// only trigger a rebroadcast).
    pub async fn set_current_height(&self, height: u32) {
        let _ = self.tx.send(ManagerCommand::SetCurrentHeight(height)).await;
    }

    /// Offers a template as the new current template.
    pub async fn set_block(&self, template: BlockTemplate) {
        let _ = self.tx.send(ManagerCommand::SetBlock(template)).await;
    }

    /// Requests the current template for a session; the reply arrives on
    /// the returned channel so the session keeps draining its socket.
    pub async fn request_block(
        &self,
        session_id: ConnectionId,
    ) -> oneshot::Receiver<Result<(Arc<BlockTemplate>, u64), PoolError>> {
        let (tx, rx) = oneshot::channel();
        // if the manager is gone the sender drops and rx resolves to a
        // receive error; callers map that to shutdown
        let _ = self
            .tx
            .send(ManagerCommand::RequestBlock {
                session_id,
                reply: tx,
            })
            .await;
        rx
    }

    /// Resolves a template request in place.
    ///
    /// # Errors
    ///
    /// [`PoolError::StaleGeneration`] when the request was cancelled by a
    /// newer height; [`PoolError::Shutdown`] when the pool is stopping.
    pub async fn get_block_for_session(
        &self,
        session_id: ConnectionId,
    ) -> Result<(Arc<BlockTemplate>, u64), PoolError> {
        self.request_block(session_id)
            .await
            .await
            .map_err(|_| PoolError::Shutdown)?
    }

    /// Broadcasts stop to every session and stops the wallet link.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(ManagerCommand::Stop { done: tx }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

struct PoolManager {
    registry: Arc<SessionRegistry>,
    store: StoreHandle,
    wallet: WalletHandle,
    template: Option<Arc<BlockTemplate>>,
    /// Generation the cached template was fetched under; the template is
    /// fresh only while this matches the live generation counter.
    /// Mirrored for external freshness snapshots.
    template_generation: Arc<AtomicU64>,
    height: Arc<AtomicU32>,
    generation: Arc<AtomicU64>,
    cmd_rx: mpsc::Receiver<ManagerCommand>,
    events: mpsc::Receiver<WalletEvent>,
}

/// Spawns the pool manager task.
pub fn spawn(
    registry: Arc<SessionRegistry>,
    store: StoreHandle,
    wallet: WalletHandle,
    events: mpsc::Receiver<WalletEvent>,
) -> ManagerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let height = Arc::new(AtomicU32::new(0));
    let generation = Arc::new(AtomicU64::new(0));
    let template_generation = Arc::new(AtomicU64::new(NO_TEMPLATE));
    let manager = PoolManager {
        registry,
        store,
        wallet,
        template: None,
        template_generation: template_generation.clone(),
        height: height.clone(),
        generation: generation.clone(),
        cmd_rx,
        events,
    };
    tokio::spawn(manager.run());
    ManagerHandle {
        tx: cmd_tx,
        height,
        generation,
        template_generation,
    }
}

impl PoolManager {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    None => {
                        debug!("wallet event stream closed");
                        return;
                    }
                    Some(WalletEvent::Height(height)) => self.on_height(height),
                    Some(WalletEvent::Template(template)) => self.on_template(template),
                    Some(WalletEvent::SubmitOutcome { accepted, height, hash }) => {
                        self.on_submit_outcome(accepted, height, hash);
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return,
                    Some(ManagerCommand::SetCurrentHeight(height)) => self.on_height(height),
                    Some(ManagerCommand::SetBlock(template)) => self.on_template(template),
                    Some(ManagerCommand::RequestBlock { session_id, reply }) => {
                        self.on_request_block(session_id, reply);
                    }
                    Some(ManagerCommand::Stop { done }) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        return;
                    }
                },
            }
        }
    }

    fn on_height(&mut self, height: u32) {
        let current = self.height.load(Ordering::Acquire);
        if height > current {
            self.height.store(height, Ordering::Release);
            let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
            debug!(height, generation, "advanced to new height");
        }

        // Broadcast even when the height did not advance: miners that
        // missed the previous announcement resync from the repeat.
        let mut skipped = 0usize;
        for (id, handle) in self.registry.handles() {
            if handle.tx.try_send(SessionNotify::Height(height)).is_err() {
                debug!(session = id, "notify buffer full, skipping height broadcast");
                skipped += 1;
            }
        }
        if skipped > 0 {
            warn!(skipped, height, "height broadcast skipped saturated sessions");
        }
    }

    fn on_template(&mut self, template: BlockTemplate) {
        let height = self.height.load(Ordering::Acquire);
        if template.height != height {
            warn!(
                template_height = template.height,
                current_height = height,
                "Block obsolete, skipping"
            );
            return;
        }
        let generation = self.generation.load(Ordering::Acquire);
        self.template_generation.store(generation, Ordering::Release);
        info!(height = template.height, generation, "current template updated");
        self.template = Some(Arc::new(template));
    }

    fn on_request_block(&mut self, session_id: ConnectionId, reply: TemplateReply) {
        let generation = self.generation.load(Ordering::Acquire);
        let height = self.height.load(Ordering::Acquire);
        if let Some(template) = &self.template {
            if self.template_generation.load(Ordering::Acquire) == generation
                && template.height == height
            {
                let _ = reply.send(Ok((template.clone(), generation)));
                return;
            }
        }

        // Template is stale or absent: queue the request on the wallet
        // link's miner FIFO. Resolved off-actor so the manager keeps
        // draining events while the wallet works.
        debug!(session = session_id, "forwarding block request to wallet");
        let wallet = self.wallet.clone();
        let height = self.height.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            let result = match wallet.get_block().await {
                Ok(template) if template.height == height.load(Ordering::Acquire) => {
                    Ok((Arc::new(template), generation.load(Ordering::Acquire)))
                }
                Ok(_) => Err(PoolError::StaleGeneration),
                Err(e) => Err(e),
            };
            let _ = reply.send(result);
        });
    }

    fn on_submit_outcome(&self, accepted: bool, height: u32, hash: [u8; 32]) {
        if !accepted {
            return;
        }
        let store = self.store.clone();
        tokio::spawn(async move {
            let record = async {
                let round = store.get_latest_round().await?.round;
                store
                    .add_block(BlockRecord {
                        hash: hex::encode(hash),
                        height,
                        round,
                        found_ts: unix_now(),
                        accepted: true,
                    })
                    .await
            };
            if let Err(e) = record.await {
                error!(error = %e, height, "failed to record accepted block");
            }
        });
    }

    async fn shutdown(&mut self) {
        info!("stopping pool manager");
        for (id, handle) in self.registry.handles() {
            if handle.tx.try_send(SessionNotify::Stop).is_err() {
                debug!(session = id, "notify buffer full during stop broadcast");
            }
        }
        self.wallet.stop().await;
    }
}
