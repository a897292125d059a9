//! Named store commands and their typed results.
//!
//! Commands are a closed tagged enum, results another; the executor
//! pattern-matches on the variant. Each command maps to one prepared
//! statement (cached on the connection) except schema creation, which
//! runs as a batch.

use super::types::{Account, BlockRecord, PaymentData, Round, StoreConfig};
use super::{unix_now, StoreError};
use crate::store::schema::CREATE_SCHEMA;
use rusqlite::{params, Connection, OptionalExtension};

/// A persistence command with its parameters.
#[derive(Debug, Clone)]
pub enum Command {
    /// Create every table; idempotent.
    CreateSchema,
    /// Is this (user, address) pair banned right now?
    IsUserAndAddressBanned {
        /// Account name used at login.
        user: String,
        /// Remote address of the connection.
        address: String,
    },
    /// Is this address banned right now (API ban)?
    IsAddressBanned {
        /// Remote address of the connection.
        address: String,
    },
    /// Does an account row exist for this address?
    AccountExists {
        /// Payout address.
        address: String,
    },
    /// Fetch an account row; empty address in the result means not found.
    GetAccount {
        /// Payout address.
        address: String,
    },
    /// Create an empty account row; false when it already exists.
    CreateAccount {
        /// Payout address.
        address: String,
    },
    /// Overwrite the mutable fields of an account row.
    UpdateAccount(Account),
    /// Insert a payment row.
    AddPayment(PaymentData),
    /// Fetch the most recently found blocks.
    GetLatestBlocks,
    /// Insert a found block and bump its round's block counter.
    AddBlock(BlockRecord),
    /// Fetch the newest round; round 0 in the result means none exists.
    GetLatestRound,
    /// Close any open round and open the next one.
    CreateRound,
    /// Fetch the pool configuration row; empty version means none exists.
    GetConfig,
    /// Insert the pool configuration row; false when one already exists.
    CreateConfig {
        /// Mining mode string.
        mining_mode: String,
        /// Pool fee in percent.
        fee: i64,
        /// Share-target divider.
        difficulty_divider: i64,
    },
    /// Overwrite the pool configuration row.
    UpdateConfig {
        /// Mining mode string.
        mining_mode: String,
        /// Pool fee in percent.
        fee: i64,
        /// Share-target divider.
        difficulty_divider: i64,
    },
    /// Ban a (user, address) pair until the given unix timestamp.
    AddUserBan {
        /// Account name to ban.
        user: String,
        /// Remote address to ban.
        address: String,
        /// Unix timestamp the ban expires.
        expires: i64,
    },
    /// Ban an address outright until the given unix timestamp.
    AddApiBan {
        /// Remote address to ban.
        address: String,
        /// Unix timestamp the ban expires.
        expires: i64,
    },
}

/// Typed result rows for [`Command`]s.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Write commands: whether the write took effect.
    Done(bool),
    /// Boolean lookups.
    Flag(bool),
    /// Account lookup result.
    Account(Account),
    /// Latest-blocks lookup result.
    Blocks(Vec<BlockRecord>),
    /// Latest-round lookup result.
    Round(Round),
    /// Configuration lookup result.
    Config(StoreConfig),
}

fn require(condition: bool, what: &'static str) -> Result<(), StoreError> {
    if condition {
        Ok(())
    } else {
        Err(StoreError::Params(what))
    }
}

impl Command {
    /// Validates command parameters before touching the connection.
    pub fn validate(&self) -> Result<(), StoreError> {
        match self {
            Self::IsUserAndAddressBanned { user, address } | Self::AddUserBan { user, address, .. } => {
                require(!user.is_empty(), "user must not be empty")?;
                require(!address.is_empty(), "address must not be empty")
            }
            Self::IsAddressBanned { address }
            | Self::AccountExists { address }
            | Self::GetAccount { address }
            | Self::CreateAccount { address }
            | Self::AddApiBan { address, .. } => {
                require(!address.is_empty(), "address must not be empty")
            }
            Self::UpdateAccount(account) => {
                require(!account.address.is_empty(), "address must not be empty")
            }
            Self::AddPayment(payment) => {
                require(!payment.account.is_empty(), "account must not be empty")?;
                require(payment.round > 0, "round must be positive")
            }
            Self::AddBlock(block) => {
                require(!block.hash.is_empty(), "block hash must not be empty")?;
                require(block.round > 0, "round must be positive")
            }
            Self::CreateConfig { mining_mode, .. } | Self::UpdateConfig { mining_mode, .. } => {
                require(!mining_mode.is_empty(), "mining_mode must not be empty")
            }
            Self::CreateSchema
            | Self::GetLatestBlocks
            | Self::GetLatestRound
            | Self::CreateRound
            | Self::GetConfig => Ok(()),
        }
    }

    /// Runs the command against the connection.
    pub fn execute(&self, conn: &Connection) -> Result<Reply, rusqlite::Error> {
        match self {
            Self::CreateSchema => {
                conn.execute_batch(CREATE_SCHEMA)?;
                Ok(Reply::Done(true))
            }
            Self::IsUserAndAddressBanned { user, address } => {
                let mut stmt = conn.prepare_cached(
                    "SELECT 1 FROM banned_user_connection \
                     WHERE user = ?1 AND address = ?2 AND expires > ?3",
                )?;
                let found = stmt
                    .query_row(params![user, address, unix_now()], |_| Ok(()))
                    .optional()?
                    .is_some();
                Ok(Reply::Flag(found))
            }
            Self::IsAddressBanned { address } => {
                let mut stmt = conn.prepare_cached(
                    "SELECT 1 FROM banned_api WHERE address = ?1 AND expires > ?2",
                )?;
                let found = stmt
                    .query_row(params![address, unix_now()], |_| Ok(()))
                    .optional()?
                    .is_some();
                Ok(Reply::Flag(found))
            }
            Self::AccountExists { address } => {
                let mut stmt =
                    conn.prepare_cached("SELECT 1 FROM account WHERE address = ?1")?;
                let found = stmt
                    .query_row(params![address], |_| Ok(()))
                    .optional()?
                    .is_some();
                Ok(Reply::Flag(found))
            }
            Self::GetAccount { address } => {
                let mut stmt = conn.prepare_cached(
                    "SELECT address, balance, hashrate, shares, connections \
                     FROM account WHERE address = ?1",
                )?;
                let account = stmt
                    .query_row(params![address], |row| {
                        Ok(Account {
                            address: row.get(0)?,
                            balance: row.get(1)?,
                            hashrate: row.get(2)?,
                            shares: row.get(3)?,
                            connections: row.get(4)?,
                        })
                    })
                    .optional()?
                    .unwrap_or_default();
                Ok(Reply::Account(account))
            }
            Self::CreateAccount { address } => {
                let mut stmt =
                    conn.prepare_cached("INSERT OR IGNORE INTO account (address) VALUES (?1)")?;
                let changed = stmt.execute(params![address])?;
                Ok(Reply::Done(changed == 1))
            }
            Self::UpdateAccount(account) => {
                let mut stmt = conn.prepare_cached(
                    "UPDATE account \
                     SET balance = ?2, hashrate = ?3, shares = ?4, connections = ?5 \
                     WHERE address = ?1",
                )?;
                let changed = stmt.execute(params![
                    account.address,
                    account.balance,
                    account.hashrate,
                    account.shares,
                    account.connections,
                ])?;
                Ok(Reply::Done(changed == 1))
            }
            Self::AddPayment(payment) => {
                let mut stmt = conn.prepare_cached(
                    "INSERT INTO payment (account, amount, shares, tx_hash, round) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                stmt.execute(params![
                    payment.account,
                    payment.amount,
                    payment.shares,
                    payment.tx_hash,
                    payment.round,
                ])?;
                Ok(Reply::Done(true))
            }
            Self::GetLatestBlocks => {
                let mut stmt = conn.prepare_cached(
                    "SELECT hash, height, round, found_ts, accepted \
                     FROM block ORDER BY found_ts DESC, height DESC LIMIT 10",
                )?;
                let blocks = stmt
                    .query_map([], |row| {
                        Ok(BlockRecord {
                            hash: row.get(0)?,
                            height: row.get(1)?,
                            round: row.get(2)?,
                            found_ts: row.get(3)?,
                            accepted: row.get(4)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Reply::Blocks(blocks))
            }
            Self::AddBlock(block) => {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO block (hash, height, round, found_ts, accepted) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                stmt.execute(params![
                    block.hash,
                    block.height,
                    block.round,
                    block.found_ts,
                    block.accepted,
                ])?;
                let mut bump =
                    conn.prepare_cached("UPDATE round SET blocks = blocks + 1 WHERE round = ?1")?;
                bump.execute(params![block.round])?;
                Ok(Reply::Done(true))
            }
            Self::GetLatestRound => {
                let mut stmt = conn.prepare_cached(
                    "SELECT round, start_ts, end_ts, blocks \
                     FROM round ORDER BY round DESC LIMIT 1",
                )?;
                let round = stmt
                    .query_row([], |row| {
                        Ok(Round {
                            round: row.get(0)?,
                            start_ts: row.get(1)?,
                            end_ts: row.get(2)?,
                            blocks: row.get(3)?,
                        })
                    })
                    .optional()?
                    .unwrap_or_default();
                Ok(Reply::Round(round))
            }
            Self::CreateRound => {
                let now = unix_now();
                let mut close =
                    conn.prepare_cached("UPDATE round SET end_ts = ?1 WHERE end_ts IS NULL")?;
                close.execute(params![now])?;
                let mut open = conn.prepare_cached(
                    "INSERT INTO round (round, start_ts, blocks) \
                     VALUES ((SELECT COALESCE(MAX(round), 0) + 1 FROM round), ?1, 0)",
                )?;
                open.execute(params![now])?;
                Ok(Reply::Done(true))
            }
            Self::GetConfig => {
                let mut stmt = conn.prepare_cached(
                    "SELECT version, mining_mode, fee, difficulty_divider \
                     FROM config WHERE id = 1",
                )?;
                let config = stmt
                    .query_row([], |row| {
                        Ok(StoreConfig {
                            version: row.get(0)?,
                            mining_mode: row.get(1)?,
                            fee: row.get(2)?,
                            difficulty_divider: row.get(3)?,
                        })
                    })
                    .optional()?
                    .unwrap_or_default();
                Ok(Reply::Config(config))
            }
            Self::CreateConfig {
                mining_mode,
                fee,
                difficulty_divider,
            } => {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR IGNORE INTO config (id, version, mining_mode, fee, difficulty_divider) \
                     VALUES (1, ?1, ?2, ?3, ?4)",
                )?;
                let changed = stmt.execute(params![
                    env!("CARGO_PKG_VERSION"),
                    mining_mode,
                    fee,
                    difficulty_divider,
                ])?;
                Ok(Reply::Done(changed == 1))
            }
            Self::UpdateConfig {
                mining_mode,
                fee,
                difficulty_divider,
            } => {
                let mut stmt = conn.prepare_cached(
                    "UPDATE config \
                     SET version = ?1, mining_mode = ?2, fee = ?3, difficulty_divider = ?4 \
                     WHERE id = 1",
                )?;
                let changed = stmt.execute(params![
                    env!("CARGO_PKG_VERSION"),
                    mining_mode,
                    fee,
                    difficulty_divider,
                ])?;
                Ok(Reply::Done(changed == 1))
            }
            Self::AddUserBan {
                user,
                address,
                expires,
            } => {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO banned_user_connection (user, address, expires) \
                     VALUES (?1, ?2, ?3)",
                )?;
                stmt.execute(params![user, address, expires])?;
                Ok(Reply::Done(true))
            }
            Self::AddApiBan { address, expires } => {
                let mut stmt = conn.prepare_cached(
                    "INSERT OR REPLACE INTO banned_api (address, expires) VALUES (?1, ?2)",
                )?;
                stmt.execute(params![address, expires])?;
                Ok(Reply::Done(true))
            }
        }
    }
}
