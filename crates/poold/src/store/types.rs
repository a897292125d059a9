//! Row shapes returned by store commands.

/// A miner account row.
///
/// A lookup for an unknown address returns the default value with an
/// empty `address`; callers test emptiness, not row counts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    /// Payout address, primary key.
    pub address: String,
    /// Unpaid balance.
    pub balance: f64,
    /// Last estimated hashrate.
    pub hashrate: f64,
    /// Accepted shares in the current round.
    pub shares: i64,
    /// Live connections for this account.
    pub connections: i64,
}

/// Parameters for inserting a payment row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentData {
    /// Account the payment belongs to.
    pub account: String,
    /// Paid amount.
    pub amount: f64,
    /// Shares covered by this payment.
    pub shares: f64,
    /// On-chain transaction hash, empty until the payment is sent.
    pub tx_hash: String,
    /// Round the payment settles.
    pub round: i64,
}

/// A found-block row.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockRecord {
    /// Block hash, primary key.
    pub hash: String,
    /// Chain height of the block.
    pub height: u32,
    /// Round during which the block was found.
    pub round: i64,
    /// Unix timestamp of the find.
    pub found_ts: i64,
    /// Whether the network accepted the submission.
    pub accepted: bool,
}

/// An accounting-round row.
///
/// The empty lookup value has `round == 0`; real rounds start at 1.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Round {
    /// Round number, primary key.
    pub round: i64,
    /// Unix timestamp the round opened.
    pub start_ts: i64,
    /// Unix timestamp the round closed; `None` while open.
    pub end_ts: Option<i64>,
    /// Blocks found during the round.
    pub blocks: i64,
}

/// The persisted pool configuration row.
///
/// The empty lookup value has an empty `version`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreConfig {
    /// Pool software version that wrote the row.
    pub version: String,
    /// Mining mode string (PRIME or HASH).
    pub mining_mode: String,
    /// Pool fee in percent.
    pub fee: i64,
    /// Share-target divider.
    pub difficulty_divider: i64,
}
