use futures_util::{SinkExt, StreamExt};
use pool_common::block::{BlockTemplate, NONCE_SEED_LEN, TEMPLATE_LEN};
use pool_common::packet::PROOF_LEN;
use pool_common::{MiningMode, Packet, PacketCodec, Target};
use poold::banlist::BanList;
use poold::config::PoolConfig;
use poold::manager::{self, ManagerHandle};
use poold::registry::SessionRegistry;
use poold::session::SessionContext;
use poold::store::{self, StoreHandle};
use poold::wallet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::{timeout, timeout_at};
use tokio_util::codec::Framed;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(wallet_addr: SocketAddr, listen: SocketAddr) -> PoolConfig {
    PoolConfig {
        wallet_addr,
        listen,
        db_path: ":memory:".into(),
        mining_mode: MiningMode::Hash,
        fee: 1,
        difficulty_divider: 4,
        connection_retry_interval: 1,
        get_height_interval: 1,
        login_timeout: 10,
        ban_ttl: 600,
        ban_cache_ttl: 30,
        max_conns: 100,
        shutdown_deadline: 5,
    }
}

/// A deterministic template for the given height.
pub fn template(height: u32, network_target: Target) -> BlockTemplate {
    #[allow(clippy::cast_possible_truncation)]
    let tag = height as u8;
    BlockTemplate {
        height,
        prev_hash: [tag; 32],
        proof: [tag ^ 0x5A; PROOF_LEN],
        network_target,
    }
}

/// Splits a miner-side BLOCK_DATA payload into template and nonce seed.
pub fn parse_miner_template(payload: &[u8]) -> (BlockTemplate, u64) {
    assert_eq!(payload.len(), TEMPLATE_LEN + NONCE_SEED_LEN, "miner template size");
    let template = BlockTemplate::parse(&payload[..TEMPLATE_LEN]).expect("template parse");
    let seed = u64::from_be_bytes(payload[TEMPLATE_LEN..].try_into().unwrap());
    (template, seed)
}

/// The wallet side of the upstream link, driven by the test script.
pub struct FakeWallet {
    listener: TcpListener,
    framed: Option<Framed<TcpStream, PacketCodec>>,
}

impl FakeWallet {
    pub async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self {
            listener,
            framed: None,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.listener.local_addr().unwrap()
    }

    /// Waits for the pool to (re)connect and consumes the SET_CHANNEL
    /// handshake.
    pub async fn accept(&mut self) {
        let (stream, _) = timeout(RECV_TIMEOUT, self.listener.accept())
            .await
            .expect("timeout waiting for pool to connect")
            .unwrap();
        self.framed = Some(Framed::new(stream, PacketCodec::new()));
        match self.recv_raw().await {
            Packet::SetChannel(_) => {}
            other => panic!("expected SET_CHANNEL handshake, got {other:?}"),
        }
    }

    /// Drops the upstream connection, forcing the pool to reconnect.
    pub fn kill(&mut self) {
        self.framed = None;
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed
            .as_mut()
            .expect("wallet not connected")
            .send(packet)
            .await
            .unwrap();
    }

    /// Receives the next packet, GET_HEIGHT polls included.
    pub async fn recv_raw(&mut self) -> Packet {
        let framed = self.framed.as_mut().expect("wallet not connected");
        timeout(RECV_TIMEOUT, framed.next())
            .await
            .expect("timeout waiting for packet from pool")
            .expect("pool closed the wallet link")
            .expect("framing error on wallet link")
    }

    /// Receives the next packet that is not a GET_HEIGHT poll.
    pub async fn recv(&mut self) -> Packet {
        loop {
            match self.recv_raw().await {
                Packet::GetHeight => {}
                other => return other,
            }
        }
    }

    pub async fn expect_get_block(&mut self) {
        match self.recv().await {
            Packet::GetBlock => {}
            other => panic!("expected GET_BLOCK, got {other:?}"),
        }
    }

    pub async fn expect_submit_block(&mut self) -> ([u8; PROOF_LEN], u64) {
        match self.recv().await {
            Packet::SubmitBlock { proof, nonce } => (proof, nonce),
            other => panic!("expected SUBMIT_BLOCK, got {other:?}"),
        }
    }

    /// Answers every GET_BLOCK with the given template for the whole
    /// `span`. Used when the exact number of in-flight fetches is
    /// timing-dependent.
    pub async fn serve_template(&mut self, t: &BlockTemplate, span: Duration) {
        let end = tokio::time::Instant::now() + span;
        let framed = self.framed.as_mut().expect("wallet not connected");
        loop {
            match timeout_at(end, framed.next()).await {
                Err(_) => return,
                Ok(None) => return,
                Ok(Some(packet)) => match packet.expect("framing error on wallet link") {
                    Packet::GetBlock => {
                        framed.send(Packet::BlockData(t.serialize())).await.unwrap();
                    }
                    Packet::GetHeight | Packet::Ping => {}
                    other => panic!("unexpected packet while serving templates: {other:?}"),
                },
            }
        }
    }
}

/// A miner client speaking the pool protocol.
pub struct TestMiner {
    framed: Framed<TcpStream, PacketCodec>,
}

impl TestMiner {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(stream, PacketCodec::new()),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        self.framed.send(packet).await.unwrap();
    }

    /// Receives the next packet; panics on close or timeout.
    pub async fn recv(&mut self) -> Packet {
        self.try_recv()
            .await
            .expect("pool closed the miner connection")
    }

    /// Receives the next packet, or `None` once the pool closes the
    /// connection.
    pub async fn try_recv(&mut self) -> Option<Packet> {
        match timeout(RECV_TIMEOUT, self.framed.next()).await {
            Err(_) => panic!("timeout waiting for packet from pool"),
            Ok(None) => None,
            Ok(Some(packet)) => Some(packet.expect("framing error on miner link")),
        }
    }

    /// True once the pool closes the connection (ignoring any packets
    /// still in flight).
    pub async fn closed(&mut self) -> bool {
        loop {
            match timeout(RECV_TIMEOUT, self.framed.next()).await {
                Err(_) => return false,
                Ok(None) => return true,
                Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    pub async fn login(&mut self, user: &str) -> Packet {
        self.send(Packet::Login(user.into())).await;
        loop {
            match self.recv().await {
                // height broadcasts may interleave with the login answer
                Packet::BlockHeight(_) => {}
                other => return other,
            }
        }
    }

    /// Requests a template and waits for its delivery, skipping height
    /// broadcasts.
    pub async fn get_block(&mut self) -> (BlockTemplate, u64) {
        self.send(Packet::GetBlock).await;
        loop {
            match self.recv().await {
                Packet::BlockData(payload) => return parse_miner_template(&payload),
                Packet::BlockHeight(_) => {}
                other => panic!("expected BLOCK_DATA, got {other:?}"),
            }
        }
    }
}

/// A pool instance wired to an in-memory store, under test control.
pub struct TestPool {
    pub addr: SocketAddr,
    pub manager: ManagerHandle,
    pub store: StoreHandle,
    pub bans: Arc<BanList>,
    pub registry: Arc<SessionRegistry>,
    shutdown: watch::Sender<bool>,
}

impl TestPool {
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.manager.stop().await;
    }
}

pub async fn start_pool(wallet_addr: SocketAddr) -> TestPool {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = test_config(wallet_addr, addr);

    let store = StoreHandle::open_in_memory().unwrap();
    store::bootstrap(&store, &config).await.unwrap();

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

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let ctx = Arc::new(SessionContext {
        config: config.clone(),
        manager: manager.clone(),
        registry: registry.clone(),
        store: store.clone(),
        bans: bans.clone(),
        wallet: wallet_handle,
    });

    tokio::spawn(async move {
        if let Err(e) = poold::run(listener, ctx, shutdown_rx).await {
            eprintln!("server error in test: {e}");
        }
    });

    TestPool {
        addr,
        manager,
        store,
        bans,
        registry,
        shutdown: shutdown_tx,
    }
}

/// Polls `condition` until it holds or the timeout expires.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let result = timeout(RECV_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}

/// Polls an async `condition` until it holds or the timeout expires.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = timeout(RECV_TIMEOUT, async {
        while !condition().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for: {what}");
}
