//! Per-connection miner session.
//!
//! Each accepted miner connection gets one task driving a framed packet
//! stream through the session state machine: LOGIN under a deadline,
//! then a mining loop interleaving miner packets, manager notifications,
//! the pending template reply, and an idle watchdog. Shares are
//! validated against the session's subscribed template; repeated invalid
//! submissions ban the (user, address) pair through the store.

use crate::banlist::BanList;
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::manager::ManagerHandle;
use crate::registry::{SessionHandle, SessionNotify, SessionRegistry};
use crate::store::{unix_now, PaymentData, StoreHandle};
use crate::strikes::StrikeCounter;
use crate::wallet::WalletHandle;
use futures_util::{SinkExt, StreamExt};
use pool_common::block::BlockTemplate;
use pool_common::packet::PROOF_LEN;
use pool_common::share::{self, ShareOutcome};
use pool_common::{ConnectionId, Packet, PacketCodec};
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep, timeout, Duration, Instant, Sleep};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

/// How long a banned login lingers before the socket closes.
const BAN_LINGER: Duration = Duration::from_millis(500);

/// Pause before re-requesting a template after a stale-generation cancel.
const REREQUEST_DELAY: Duration = Duration::from_millis(500);

/// Depth of the per-session notification buffer. A session that cannot
/// drain this many broadcasts is skipped, not waited on.
const NOTIFY_DEPTH: usize = 16;

/// Everything a session task needs from the rest of the pool.
pub struct SessionContext {
    /// Runtime configuration.
    pub config: PoolConfig,
    /// Pool manager handle for template requests and snapshots.
    pub manager: ManagerHandle,
    /// Registry this session registers itself in.
    pub registry: Arc<SessionRegistry>,
    /// Persistence commands.
    pub store: StoreHandle,
    /// Ban lookups.
    pub bans: Arc<BanList>,
    /// Wallet link for forwarding block candidates.
    pub wallet: WalletHandle,
}

type MinerStream = Framed<TcpStream, PacketCodec>;
type TemplateRx = oneshot::Receiver<Result<(Arc<BlockTemplate>, u64), PoolError>>;

/// Derives the non-colliding nonce seed for a connection.
///
/// Odd-constant multiplication permutes the id space, so distinct
/// connection ids always map to distinct seeds spread over the full
/// nonce range.
#[must_use]
pub fn nonce_seed(id: ConnectionId) -> u64 {
    id.wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Drives one miner connection from accept to close.
///
/// # Errors
///
/// Returns the error that terminated the session; the caller logs it.
pub async fn handle_session(
    stream: TcpStream,
    id: ConnectionId,
    peer: SocketAddr,
    ctx: Arc<SessionContext>,
) -> Result<(), PoolError> {
    let mut framed = Framed::new(stream, PacketCodec::new());
    let ip = peer.ip();

    let user = login(&mut framed, id, ip, &ctx).await?;
    info!(session = id, account = %user, addr = %ip, "miner logged in");

    // register before acknowledging so the first height broadcast after
    // the ack cannot miss this session
    let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_DEPTH);
    ctx.registry.insert(
        id,
        SessionHandle {
            tx: notify_tx,
            remote_ip: ip,
            connected_at: std::time::Instant::now(),
        },
    );
    if let Err(e) = framed.send(Packet::LoginSuccess).await {
        ctx.registry.remove(id);
        release_connection(&ctx.store, &user).await;
        return Err(e.into());
    }

    let result = mining_loop(&mut framed, id, ip, &user, &ctx, notify_rx).await;

    ctx.registry.remove(id);
    release_connection(&ctx.store, &user).await;
    result
}

/// LOGIN phase: the first packet must be LOGIN, the pair must not be
/// banned, and the account must exist (created on first login).
async fn login(
    framed: &mut MinerStream,
    id: ConnectionId,
    ip: IpAddr,
    ctx: &SessionContext,
) -> Result<String, PoolError> {
    let deadline = Duration::from_secs(ctx.config.login_timeout);
    let first = match timeout(deadline, framed.next()).await {
        Err(_) => return Err(PoolError::LoginTimeout),
        Ok(None) => return Err(PoolError::Protocol("connection closed before login")),
        Ok(Some(Err(e))) => return Err(e.into()),
        Ok(Some(Ok(packet))) => packet,
    };

    let Packet::Login(user) = first else {
        let _ = framed.send(Packet::LoginFail).await;
        return Err(PoolError::Protocol("first packet must be LOGIN"));
    };

    if ctx.bans.is_user_banned(&user, ip).await? {
        info!(session = id, account = %user, addr = %ip, "rejecting banned login");
        let _ = framed.send(Packet::LoginFail).await;
        sleep(BAN_LINGER).await;
        return Err(PoolError::Banned);
    }

    if !ctx.store.account_exists(&user).await? {
        if ctx.store.create_account(&user).await? {
            info!(account = %user, "created account on first login");
        }
    }
    let mut account = ctx.store.get_account(&user).await?;
    if !account.address.is_empty() {
        account.connections += 1;
        let _ = ctx.store.update_account(account).await;
    }

    Ok(user)
}

async fn release_connection(store: &StoreHandle, user: &str) {
    match store.get_account(user).await {
        Ok(mut account) if !account.address.is_empty() => {
            account.connections = (account.connections - 1).max(0);
            if let Err(e) = store.update_account(account).await {
                debug!(account = %user, error = %e, "failed to release connection count");
            }
        }
        Ok(_) => {}
        Err(e) => debug!(account = %user, error = %e, "failed to load account on close"),
    }
}

#[allow(clippy::too_many_lines)]
async fn mining_loop(
    framed: &mut MinerStream,
    id: ConnectionId,
    ip: IpAddr,
    user: &str,
    ctx: &SessionContext,
    mut notify_rx: mpsc::Receiver<SessionNotify>,
) -> Result<(), PoolError> {
    let seed = nonce_seed(id);
    let mut subscribed: Option<(Arc<BlockTemplate>, u64)> = None;
    let mut pending: Option<TemplateRx> = None;
    let mut retry: Option<Pin<Box<Sleep>>> = None;
    let mut strikes = StrikeCounter::new();

    let idle_timeout = Duration::from_secs(ctx.config.idle_timeout());
    let mut idle_tick = interval(Duration::from_secs(ctx.config.get_height_interval));
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            packet = framed.next() => {
                last_activity = Instant::now();
                match packet {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(Packet::GetBlock)) => {
                        if pending.is_some() || retry.is_some() {
                            debug!(session = id, "duplicate GET_BLOCK ignored");
                        } else {
                            pending = Some(ctx.manager.request_block(id).await);
                        }
                    }
                    Some(Ok(Packet::SubmitShare { proof, nonce })) => {
                        submit_share(
                            framed, id, ip, user, ctx, &subscribed, &mut strikes, proof, nonce,
                        )
                        .await?;
                    }
                    Some(Ok(Packet::Ping)) => framed.send(Packet::Ping).await?,
                    Some(Ok(other)) => {
                        warn!(session = id, header = other.header(), "unexpected packet from miner");
                        return Err(PoolError::Protocol("unexpected packet from miner"));
                    }
                }
            }

            reply = async { pending.as_mut().expect("pending checked by guard").await },
                if pending.is_some() =>
            {
                pending = None;
                match reply {
                    Err(_) => return Err(PoolError::Shutdown),
                    Ok(Ok((template, generation))) => {
                        // freshness check at delivery time: the height may
                        // have moved while the reply was in flight
                        if generation == ctx.manager.current_generation()
                            && template.height == ctx.manager.current_height()
                        {
                            framed
                                .send(Packet::BlockData(template.serialize_for_miner(seed)))
                                .await?;
                            last_activity = Instant::now();
                            subscribed = Some((template, generation));
                        } else {
                            debug!(session = id, "template went stale in flight, re-requesting");
                            retry = Some(Box::pin(sleep(REREQUEST_DELAY)));
                        }
                    }
                    Ok(Err(PoolError::StaleGeneration)) => {
                        debug!(session = id, "block request cancelled, re-requesting");
                        retry = Some(Box::pin(sleep(REREQUEST_DELAY)));
                    }
                    Ok(Err(e)) => return Err(e),
                }
            }

            () = async { retry.as_mut().expect("retry checked by guard").as_mut().await },
                if retry.is_some() =>
            {
                retry = None;
                pending = Some(ctx.manager.request_block(id).await);
            }

            note = notify_rx.recv() => match note {
                Some(SessionNotify::Height(height)) => {
                    framed.send(Packet::BlockHeight(height)).await?;
                    last_activity = Instant::now();
                }
                Some(SessionNotify::Stop) | None => {
                    debug!(session = id, "session stopping");
                    return Ok(());
                }
            },

            _ = idle_tick.tick() => {
                if last_activity.elapsed() >= idle_timeout {
                    info!(session = id, addr = %ip, "idle timeout, dropping miner");
                    return Ok(());
                }
            }
        }
    }
}

/// Validates one SUBMIT_SHARE in order: subscribed template is current,
/// hash meets the share target, hash meets the network target.
#[allow(clippy::too_many_arguments)]
async fn submit_share(
    framed: &mut MinerStream,
    id: ConnectionId,
    ip: IpAddr,
    user: &str,
    ctx: &SessionContext,
    subscribed: &Option<(Arc<BlockTemplate>, u64)>,
    strikes: &mut StrikeCounter,
    proof: [u8; PROOF_LEN],
    nonce: u64,
) -> Result<(), PoolError> {
    let Some((template, generation)) = subscribed else {
        debug!(session = id, "share without a subscribed template");
        framed.send(Packet::Reject).await?;
        return Ok(());
    };
    if *generation != ctx.manager.current_generation() {
        debug!(session = id, "share against a stale template");
        framed.send(Packet::Reject).await?;
        return Ok(());
    }
    if proof != template.proof {
        debug!(session = id, "share proof does not match the template");
        framed.send(Packet::Reject).await?;
        return Ok(());
    }

    let share_target = template
        .network_target
        .saturating_mul(ctx.config.difficulty_divider);
    match share::evaluate(&proof, nonce, share_target, template.network_target) {
        ShareOutcome::Invalid => {
            warn!(session = id, account = %user, "invalid share");
            framed.send(Packet::Reject).await?;
            if strikes.record() {
                warn!(account = %user, addr = %ip, "too many invalid shares, banning");
                let expires = unix_now() + i64::try_from(ctx.config.ban_ttl).unwrap_or(i64::MAX);
                ctx.store.add_user_ban(user, &ip.to_string(), expires).await?;
                ctx.bans.invalidate();
                return Err(PoolError::Banned);
            }
        }
        ShareOutcome::Share => {
            strikes.reset();
            framed.send(Packet::Accept).await?;
            record_share(ctx, user).await;
        }
        ShareOutcome::BlockCandidate => {
            strikes.reset();
            info!(account = %user, height = template.height, "block candidate found");
            ctx.wallet.submit_block(proof, nonce).await?;
            framed.send(Packet::Block).await?;
            record_share(ctx, user).await;
        }
    }
    Ok(())
}

/// Share accounting: bump the account's share counter and insert the
/// payment row for the open round. Failures are logged, not fatal; the
/// miner keeps mining.
async fn record_share(ctx: &SessionContext, user: &str) {
    let result = async {
        let round = ctx.store.get_latest_round().await?.round;
        let mut account = ctx.store.get_account(user).await?;
        if account.address.is_empty() {
            account.address = user.to_owned();
        }
        account.shares += 1;
        ctx.store.update_account(account).await?;
        ctx.store
            .add_payment(PaymentData {
                account: user.to_owned(),
                amount: 0.0,
                shares: 1.0,
                tx_hash: String::new(),
                round,
            })
            .await
    };
    if let Err(e) = result.await {
        error!(account = %user, error = %e, "share accounting failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_seeds_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for id in 0..10_000u64 {
            assert!(seen.insert(nonce_seed(id)));
        }
    }

    #[test]
    fn nonce_seeds_spread_over_the_range() {
        // consecutive ids land far apart, giving each session headroom
        let gap = nonce_seed(1).abs_diff(nonce_seed(2));
        assert!(gap > u64::MAX / 1_000_000);
    }
}
