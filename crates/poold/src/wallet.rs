//! Upstream wallet link.
//!
//! A single actor task owns the TCP connection to the wallet daemon:
//! it performs the SET_CHANNEL handshake, polls the chain height, fans
//! incoming heights and templates out to the pool manager, multiplexes
//! GET_BLOCK requests, and carries block submissions upstream. The link
//! lives for the process lifetime and reconnects forever on failure.
//!
//! Block-request arbitration: each upstream GET_BLOCK has exactly one
//! logical consumer — the pool manager's refresh (priority) or the head
//! of the miner-request FIFO. A new chain height cancels every queued
//! miner request with a stale-generation signal; the callers re-request.

use crate::config::PoolConfig;
use crate::error::PoolError;
use futures_util::{SinkExt, StreamExt};
use pool_common::block::BlockTemplate;
use pool_common::packet::PROOF_LEN;
use pool_common::share;
use pool_common::{MiningMode, Packet, PacketCodec};
use std::collections::VecDeque;
use std::net::SocketAddr;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, timeout, Duration, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

/// Events flowing from the wallet link into the pool manager.
#[derive(Debug)]
pub enum WalletEvent {
    /// The wallet announced a chain height (repeated heights included).
    Height(u32),
    /// A template fetched for the pool manager's refresh.
    Template(BlockTemplate),
    /// The wallet answered the oldest outstanding block submission.
    SubmitOutcome {
        /// Whether the network accepted the block.
        accepted: bool,
        /// Height the submission targeted.
        height: u32,
        /// Proof-of-work digest of the submitted block.
        hash: [u8; 32],
    },
}

type BlockReply = oneshot::Sender<Result<BlockTemplate, PoolError>>;

enum WalletCommand {
    GetBlock { reply: BlockReply },
    SubmitBlock { proof: [u8; PROOF_LEN], nonce: u64 },
    Stop,
}

/// Cloneable handle for talking to the wallet link task.
#[derive(Clone)]
pub struct WalletHandle {
    tx: mpsc::Sender<WalletCommand>,
}

impl WalletHandle {
    /// Requests a block template on behalf of a miner.
    ///
    /// # Errors
    ///
    /// [`PoolError::StaleGeneration`] when a newer chain height cancelled
    /// the request; the caller re-requests. [`PoolError::Shutdown`] when
    /// the link is gone.
    pub async fn get_block(&self) -> Result<BlockTemplate, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalletCommand::GetBlock { reply: tx })
            .await
            .map_err(|_| PoolError::Shutdown)?;
        rx.await.map_err(|_| PoolError::StaleGeneration)?
    }

    /// Submits a solved block upstream. The ACCEPT/REJECT answer arrives
    /// asynchronously as a [`WalletEvent::SubmitOutcome`].
    ///
    /// # Errors
    ///
    /// [`PoolError::Shutdown`] when the link is gone.
    pub async fn submit_block(&self, proof: [u8; PROOF_LEN], nonce: u64) -> Result<(), PoolError> {
        self.tx
            .send(WalletCommand::SubmitBlock { proof, nonce })
            .await
            .map_err(|_| PoolError::Shutdown)
    }

    /// Stops the link task.
    pub async fn stop(&self) {
        let _ = self.tx.send(WalletCommand::Stop).await;
    }
}

struct PendingSubmission {
    height: u32,
    hash: [u8; 32],
}

enum LinkExit {
    Stopped,
    Disconnected,
}

struct WalletLink {
    addr: SocketAddr,
    mode: MiningMode,
    retry: Duration,
    poll: Duration,
    cmd_rx: mpsc::Receiver<WalletCommand>,
    event_tx: mpsc::Sender<WalletEvent>,
    current_height: u32,
    /// The next BLOCK_DATA belongs to the pool manager, not the FIFO.
    pm_fetch: bool,
    pending_requests: VecDeque<BlockReply>,
    pending_submissions: VecDeque<PendingSubmission>,
}

/// Spawns the wallet link task.
///
/// Returns the command handle and the event stream the pool manager
/// consumes.
pub fn spawn(config: &PoolConfig) -> (WalletHandle, mpsc::Receiver<WalletEvent>) {
    let (cmd_tx, cmd_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(64);
    let link = WalletLink {
        addr: config.wallet_addr,
        mode: config.mining_mode,
        retry: Duration::from_secs(config.connection_retry_interval),
        poll: Duration::from_secs(config.get_height_interval),
        cmd_rx,
        event_tx,
        current_height: 0,
        pm_fetch: false,
        pending_requests: VecDeque::new(),
        pending_submissions: VecDeque::new(),
    };
    tokio::spawn(link.run());
    (WalletHandle { tx: cmd_tx }, event_rx)
}

impl WalletLink {
    async fn run(mut self) {
        let mut failures: u32 = 0;
        loop {
            match timeout(self.retry, TcpStream::connect(self.addr)).await {
                Ok(Ok(stream)) => {
                    info!(addr = %self.addr, "connection to wallet established");
                    failures = 0;
                    if let LinkExit::Stopped = self.connected(stream).await {
                        self.cancel_inflight();
                        return;
                    }
                }
                Ok(Err(e)) => debug!(error = %e, "wallet connect failed"),
                Err(_) => debug!("wallet connect timed out"),
            }

            self.cancel_inflight();
            failures += 1;
            if failures % 3 == 0 {
                warn!(
                    attempt = failures,
                    "wallet unreachable, retrying in {} seconds",
                    self.retry.as_secs()
                );
            } else {
                info!("connection retry in {} seconds", self.retry.as_secs());
            }
            if self.idle_wait().await {
                return;
            }
        }
    }

    async fn connected(&mut self, stream: TcpStream) -> LinkExit {
        let mut framed = Framed::new(stream, PacketCodec::new());
        if let Err(e) = framed.send(Packet::SetChannel(self.mode.channel())).await {
            warn!(error = %e, "wallet handshake failed");
            return LinkExit::Disconnected;
        }

        let mut poll = interval(self.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                packet = framed.next() => match packet {
                    None => {
                        info!("wallet closed the connection");
                        return LinkExit::Disconnected;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "wallet framing error");
                        return LinkExit::Disconnected;
                    }
                    Some(Ok(packet)) => {
                        if let Err(e) = self.handle_packet(packet, &mut framed).await {
                            warn!(error = %e, "wallet link error");
                            return LinkExit::Disconnected;
                        }
                    }
                },
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(WalletCommand::Stop) => return LinkExit::Stopped,
                    Some(WalletCommand::GetBlock { reply }) => {
                        if framed.send(Packet::GetBlock).await.is_err() {
                            let _ = reply.send(Err(PoolError::StaleGeneration));
                            return LinkExit::Disconnected;
                        }
                        self.pending_requests.push_back(reply);
                    }
                    Some(WalletCommand::SubmitBlock { proof, nonce }) => {
                        info!(height = self.current_height, "submitting block");
                        let hash = share::hash_proof(&proof, nonce);
                        if framed.send(Packet::SubmitBlock { proof, nonce }).await.is_err() {
                            return LinkExit::Disconnected;
                        }
                        self.pending_submissions.push_back(PendingSubmission {
                            height: self.current_height,
                            hash,
                        });
                    }
                },
                _ = poll.tick() => {
                    if framed.send(Packet::GetHeight).await.is_err() {
                        return LinkExit::Disconnected;
                    }
                },
            }
        }
    }

    async fn handle_packet(
        &mut self,
        packet: Packet,
        framed: &mut Framed<TcpStream, PacketCodec>,
    ) -> Result<(), PoolError> {
        match packet {
            Packet::Ping => framed.send(Packet::Ping).await?,
            Packet::BlockHeight(height) => {
                if height > self.current_height {
                    self.current_height = height;
                    info!(height, "network reports new block");
                    self.send_event(WalletEvent::Height(height)).await;
                    framed.send(Packet::GetBlock).await?;
                    self.pm_fetch = true;
                    self.cancel_requests();
                } else {
                    // rebroadcast so miners that missed an announcement resync
                    self.send_event(WalletEvent::Height(height)).await;
                }
            }
            Packet::BlockData(data) => {
                let template = BlockTemplate::parse(&data)
                    .map_err(|_| PoolError::Protocol("malformed template from wallet"))?;
                if template.height != self.current_height {
                    warn!(height = template.height, "Block obsolete, skipping");
                } else if self.pm_fetch {
                    self.pm_fetch = false;
                    self.send_event(WalletEvent::Template(template)).await;
                } else if let Some(reply) = self.pending_requests.pop_front() {
                    let _ = reply.send(Ok(template));
                } else {
                    debug!("unsolicited template from wallet, dropping");
                }
            }
            Packet::Accept => {
                if let Some(sub) = self.pending_submissions.pop_front() {
                    info!(height = sub.height, "block accepted by the network");
                    self.send_event(WalletEvent::SubmitOutcome {
                        accepted: true,
                        height: sub.height,
                        hash: sub.hash,
                    })
                    .await;
                } else {
                    debug!("ACCEPT with no pending submission");
                }
            }
            Packet::Reject => {
                if let Some(sub) = self.pending_submissions.pop_front() {
                    warn!(height = sub.height, "block rejected by the network");
                    self.send_event(WalletEvent::SubmitOutcome {
                        accepted: false,
                        height: sub.height,
                        hash: sub.hash,
                    })
                    .await;
                    // refresh our template, unless a fetch is already in flight
                    if !self.pm_fetch && self.pending_requests.is_empty() {
                        framed.send(Packet::GetBlock).await?;
                        self.pm_fetch = true;
                    }
                } else {
                    debug!("REJECT with no pending submission");
                }
            }
            other => {
                debug!(header = other.header(), "unexpected packet from wallet");
                return Err(PoolError::Protocol("unexpected packet from wallet"));
            }
        }
        Ok(())
    }

    /// Consumes commands while the link is down so callers never stall:
    /// block requests are cancelled, submissions are dropped.
    /// Returns `true` when a stop was requested.
    async fn idle_wait(&mut self) -> bool {
        let deadline = sleep(self.retry);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                () = &mut deadline => return false,
                cmd = self.cmd_rx.recv() => match cmd {
                    None | Some(WalletCommand::Stop) => return true,
                    Some(WalletCommand::GetBlock { reply }) => {
                        let _ = reply.send(Err(PoolError::StaleGeneration));
                    }
                    Some(WalletCommand::SubmitBlock { .. }) => {
                        warn!("dropping block submission, wallet unreachable");
                    }
                },
            }
        }
    }

    fn cancel_requests(&mut self) {
        for reply in self.pending_requests.drain(..) {
            let _ = reply.send(Err(PoolError::StaleGeneration));
        }
    }

    fn cancel_inflight(&mut self) {
        self.cancel_requests();
        self.pending_submissions.clear();
        self.pm_fetch = false;
    }

    async fn send_event(&self, event: WalletEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("pool manager went away, dropping wallet event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_common::Target;
    use tokio::net::TcpListener;

    fn test_config(wallet_addr: SocketAddr) -> PoolConfig {
        PoolConfig {
            wallet_addr,
            listen: "127.0.0.1:0".parse().unwrap(),
            db_path: ":memory:".into(),
            mining_mode: MiningMode::Hash,
            fee: 1,
            difficulty_divider: 4,
            connection_retry_interval: 1,
            get_height_interval: 1,
            login_timeout: 10,
            ban_ttl: 3600,
            ban_cache_ttl: 30,
            max_conns: 100,
            shutdown_deadline: 5,
        }
    }

    async fn recv_packet(framed: &mut Framed<TcpStream, PacketCodec>) -> Packet {
        timeout(Duration::from_secs(5), framed.next())
            .await
            .expect("timeout waiting for packet")
            .expect("wallet side closed")
            .expect("framing error")
    }

    #[tokio::test]
    async fn handshake_selects_the_hash_channel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_handle, _events) = spawn(&test_config(addr));

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new());
        assert_eq!(recv_packet(&mut framed).await, Packet::SetChannel(2));
    }

    #[tokio::test]
    async fn ping_is_answered_and_height_polls_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (_handle, _events) = spawn(&test_config(addr));

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new());
        assert_eq!(recv_packet(&mut framed).await, Packet::SetChannel(2));

        framed.send(Packet::Ping).await.unwrap();
        let mut saw_ping = false;
        let mut saw_poll = false;
        for _ in 0..4 {
            match recv_packet(&mut framed).await {
                Packet::Ping => saw_ping = true,
                Packet::GetHeight => saw_poll = true,
                other => panic!("unexpected packet {other:?}"),
            }
            if saw_ping && saw_poll {
                break;
            }
        }
        assert!(saw_ping && saw_poll);
    }

    #[tokio::test]
    async fn new_height_triggers_manager_fetch_and_cancels_miner_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (handle, mut events) = spawn(&test_config(addr));

        let (stream, _) = listener.accept().await.unwrap();
        let mut framed = Framed::new(stream, PacketCodec::new());
        assert_eq!(recv_packet(&mut framed).await, Packet::SetChannel(2));

        // a miner request goes out first and queues on the FIFO
        let pending = tokio::spawn({
            let handle = handle.clone();
            async move { handle.get_block().await }
        });
        loop {
            if let Packet::GetBlock = recv_packet(&mut framed).await {
                break;
            }
        }

        // a new height claims the next template for the pool manager
        framed.send(Packet::BlockHeight(100)).await.unwrap();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(WalletEvent::Height(100)) => break,
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
        assert!(matches!(
            pending.await.unwrap(),
            Err(PoolError::StaleGeneration)
        ));

        let template = BlockTemplate {
            height: 100,
            prev_hash: [1; 32],
            proof: [2; PROOF_LEN],
            network_target: Target::pow2(230),
        };
        framed
            .send(Packet::BlockData(template.serialize()))
            .await
            .unwrap();
        loop {
            match timeout(Duration::from_secs(5), events.recv()).await.unwrap() {
                Some(WalletEvent::Template(t)) => {
                    assert_eq!(t, template);
                    break;
                }
                Some(_) => {}
                None => panic!("event stream closed"),
            }
        }
    }
}
