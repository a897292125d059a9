//! Relational schema for the embedded store.

/// Creates every table the pool persists into. Idempotent.
pub const CREATE_SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS account (
    address     TEXT PRIMARY KEY,
    balance     REAL NOT NULL DEFAULT 0,
    hashrate    REAL NOT NULL DEFAULT 0,
    shares      INTEGER NOT NULL DEFAULT 0,
    connections INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS payment (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    account  TEXT NOT NULL REFERENCES account(address),
    amount   REAL NOT NULL,
    shares   REAL NOT NULL,
    tx_hash  TEXT NOT NULL DEFAULT '',
    round    INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS round (
    round    INTEGER PRIMARY KEY,
    start_ts INTEGER NOT NULL,
    end_ts   INTEGER,
    blocks   INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS block (
    hash     TEXT PRIMARY KEY,
    height   INTEGER NOT NULL,
    round    INTEGER NOT NULL REFERENCES round(round),
    found_ts INTEGER NOT NULL,
    accepted INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS banned_user_connection (
    user    TEXT NOT NULL,
    address TEXT NOT NULL,
    expires INTEGER NOT NULL,
    PRIMARY KEY (user, address)
);
CREATE TABLE IF NOT EXISTS banned_api (
    address TEXT PRIMARY KEY,
    expires INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS config (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    version            TEXT NOT NULL,
    mining_mode        TEXT NOT NULL,
    fee                INTEGER NOT NULL,
    difficulty_divider INTEGER NOT NULL
);
";
