//! Persistence command bus.
//!
//! All SQL runs on one dedicated executor thread that owns the
//! `rusqlite` connection; the rest of the process talks to it through a
//! cloneable [`StoreHandle`] over a bounded channel. A full queue
//! suspends the submitting task, which is the backpressure boundary
//! between the reactor and the store.

mod command;
mod schema;
mod types;

pub use command::{Command, Reply};
pub use types::{Account, BlockRecord, PaymentData, Round, StoreConfig};

use crate::config::PoolConfig;
use rand::Rng;
use rusqlite::Connection;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Depth of the command queue feeding the executor thread.
const QUEUE_DEPTH: usize = 64;

/// Attempts per command before a transient failure is surfaced.
const MAX_ATTEMPTS: u32 = 5;

/// First retry delay for a transient failure; doubles per attempt.
const RETRY_INITIAL: Duration = Duration::from_millis(10);

/// Ceiling on the per-attempt retry delay.
const RETRY_MAX: Duration = Duration::from_millis(500);

/// Errors surfaced by store commands.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Command parameters failed validation before execution.
    #[error("invalid command parameters: {0}")]
    Params(&'static str),
    /// The database reported an error (after transient retries).
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    /// The executor thread is gone; the process is shutting down.
    #[error("store executor is gone")]
    Closed,
}

struct Job {
    command: Command,
    reply: oneshot::Sender<Result<Reply, StoreError>>,
}

/// Cloneable handle submitting commands to the store executor.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<Job>,
}

/// Seconds since the unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0) as i64
}

fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if matches!(
            e.code,
            rusqlite::ErrorCode::DatabaseBusy
                | rusqlite::ErrorCode::DatabaseLocked
                | rusqlite::ErrorCode::SystemIoFailure
        )
    )
}

fn run_executor(conn: Connection, mut rx: mpsc::Receiver<Job>) {
    while let Some(job) = rx.blocking_recv() {
        let result = execute_with_retry(&conn, &job.command);
        if job.reply.send(result).is_err() {
            debug!("store caller went away before its reply");
        }
    }
    info!("store executor stopped");
}

fn execute_with_retry(conn: &Connection, command: &Command) -> Result<Reply, StoreError> {
    command.validate()?;

    let mut delay = RETRY_INITIAL;
    let mut attempt = 1;
    loop {
        match command.execute(conn) {
            Ok(reply) => return Ok(reply),
            Err(e) if is_transient(&e) && attempt < MAX_ATTEMPTS => {
                let jittered = delay.mul_f64(rand::thread_rng().gen_range(0.75..=1.25));
                warn!(attempt, error = %e, "transient store error, retrying in {jittered:?}");
                std::thread::sleep(jittered);
                delay = (delay * 2).min(RETRY_MAX);
                attempt += 1;
            }
            Err(e) => return Err(StoreError::Sqlite(e)),
        }
    }
}

fn spawn_with_connection(conn: Connection) -> StoreHandle {
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    std::thread::Builder::new()
        .name("store".into())
        .spawn(move || run_executor(conn, rx))
        .expect("failed to spawn store executor thread");
    StoreHandle { tx }
}

impl StoreHandle {
    /// Opens the database file and starts the executor thread.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the file cannot be opened.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(spawn_with_connection(conn))
    }

    /// Starts an executor over an ephemeral in-memory database.
    ///
    /// Used by tests and tooling; data is lost when the handle drops.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(spawn_with_connection(conn))
    }

    async fn call(&self, command: Command) -> Result<Reply, StoreError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Job { command, reply })
            .await
            .map_err(|_| StoreError::Closed)?;
        rx.await.map_err(|_| StoreError::Closed)?
    }

    async fn flag(&self, command: Command) -> Result<bool, StoreError> {
        match self.call(command).await? {
            Reply::Flag(b) | Reply::Done(b) => Ok(b),
            _ => unreachable!("command reply shape is fixed per variant"),
        }
    }

    /// Creates the schema. Idempotent.
    pub async fn create_schema(&self) -> Result<bool, StoreError> {
        self.flag(Command::CreateSchema).await
    }

    /// Is this (user, address) pair banned right now?
    pub async fn is_user_and_address_banned(
        &self,
        user: &str,
        address: &str,
    ) -> Result<bool, StoreError> {
        self.flag(Command::IsUserAndAddressBanned {
            user: user.to_owned(),
            address: address.to_owned(),
        })
        .await
    }

    /// Is this address banned right now (API ban)?
    pub async fn is_address_banned(&self, address: &str) -> Result<bool, StoreError> {
        self.flag(Command::IsAddressBanned {
            address: address.to_owned(),
        })
        .await
    }

    /// Does an account exist for this address?
    pub async fn account_exists(&self, address: &str) -> Result<bool, StoreError> {
        self.flag(Command::AccountExists {
            address: address.to_owned(),
        })
        .await
    }

    /// Fetches an account; an empty `address` field means not found.
    pub async fn get_account(&self, address: &str) -> Result<Account, StoreError> {
        match self
            .call(Command::GetAccount {
                address: address.to_owned(),
            })
            .await?
        {
            Reply::Account(account) => Ok(account),
            _ => unreachable!("command reply shape is fixed per variant"),
        }
    }

    /// Creates an account row; false when it already exists.
    pub async fn create_account(&self, address: &str) -> Result<bool, StoreError> {
        self.flag(Command::CreateAccount {
            address: address.to_owned(),
        })
        .await
    }

    /// Overwrites the mutable fields of an account row.
    pub async fn update_account(&self, account: Account) -> Result<bool, StoreError> {
        self.flag(Command::UpdateAccount(account)).await
    }

    /// Inserts a payment row.
    pub async fn add_payment(&self, payment: PaymentData) -> Result<bool, StoreError> {
        self.flag(Command::AddPayment(payment)).await
    }

    /// Fetches the most recently found blocks.
    pub async fn get_latest_blocks(&self) -> Result<Vec<BlockRecord>, StoreError> {
        match self.call(Command::GetLatestBlocks).await? {
            Reply::Blocks(blocks) => Ok(blocks),
            _ => unreachable!("command reply shape is fixed per variant"),
        }
    }

    /// Inserts a found block and bumps its round's block counter.
    pub async fn add_block(&self, block: BlockRecord) -> Result<bool, StoreError> {
        self.flag(Command::AddBlock(block)).await
    }

    /// Fetches the newest round; `round == 0` means none exists.
    pub async fn get_latest_round(&self) -> Result<Round, StoreError> {
        match self.call(Command::GetLatestRound).await? {
            Reply::Round(round) => Ok(round),
            _ => unreachable!("command reply shape is fixed per variant"),
        }
    }

    /// Closes any open round and opens the next one.
    pub async fn create_round(&self) -> Result<bool, StoreError> {
        self.flag(Command::CreateRound).await
    }

    /// Fetches the pool configuration row; empty `version` means none.
    pub async fn get_config(&self) -> Result<StoreConfig, StoreError> {
        match self.call(Command::GetConfig).await? {
            Reply::Config(config) => Ok(config),
            _ => unreachable!("command reply shape is fixed per variant"),
        }
    }

    /// Inserts the configuration row; false when one already exists.
    pub async fn create_config(
        &self,
        mining_mode: &str,
        fee: i64,
        difficulty_divider: i64,
    ) -> Result<bool, StoreError> {
        self.flag(Command::CreateConfig {
            mining_mode: mining_mode.to_owned(),
            fee,
            difficulty_divider,
        })
        .await
    }

    /// Overwrites the configuration row.
    pub async fn update_config(
        &self,
        mining_mode: &str,
        fee: i64,
        difficulty_divider: i64,
    ) -> Result<bool, StoreError> {
        self.flag(Command::UpdateConfig {
            mining_mode: mining_mode.to_owned(),
            fee,
            difficulty_divider,
        })
        .await
    }

    /// Bans a (user, address) pair until the given unix timestamp.
    pub async fn add_user_ban(
        &self,
        user: &str,
        address: &str,
        expires: i64,
    ) -> Result<bool, StoreError> {
        self.flag(Command::AddUserBan {
            user: user.to_owned(),
            address: address.to_owned(),
            expires,
        })
        .await
    }

    /// Bans an address outright until the given unix timestamp.
    pub async fn add_api_ban(&self, address: &str, expires: i64) -> Result<bool, StoreError> {
        self.flag(Command::AddApiBan {
            address: address.to_owned(),
            expires,
        })
        .await
    }
}

/// Prepares a fresh or existing database for serving: schema, the
/// configuration row, and an open accounting round.
///
/// # Errors
///
/// Returns [`StoreError`] if any of the bootstrap commands fail.
pub async fn bootstrap(store: &StoreHandle, config: &PoolConfig) -> Result<(), StoreError> {
    store.create_schema().await?;

    let persisted = store.get_config().await?;
    if persisted.version.is_empty() {
        store
            .create_config(
                &config.mining_mode.to_string(),
                i64::from(config.fee),
                i64::from(config.difficulty_divider),
            )
            .await?;
        info!(
            mode = %config.mining_mode,
            fee = config.fee,
            divider = config.difficulty_divider,
            "created pool configuration"
        );
    } else if persisted.mining_mode != config.mining_mode.to_string() {
        warn!(
            persisted = %persisted.mining_mode,
            configured = %config.mining_mode,
            "mining mode differs from persisted configuration"
        );
    }

    if store.get_latest_round().await?.round == 0 {
        store.create_round().await?;
        info!("opened first accounting round");
    }
    Ok(())
}
