use clap::Parser;
use pool_common::MiningMode;
use std::net::SocketAddr;
use std::path::PathBuf;

/// CLI arguments for the pool coordinator.
#[derive(Parser, Debug, Clone)]
#[command(name = "poold")]
#[command(about = "Mining-pool coordinator")]
#[command(version)]
pub struct Args {
    /// Socket address of the wallet daemon.
    #[arg(long, default_value = "127.0.0.1:9325", env = "POOLD_WALLET_ADDR")]
    pub wallet_addr: SocketAddr,
    /// Socket address to accept miner connections on.
    #[arg(long, default_value = "0.0.0.0:9988", env = "POOLD_LISTEN")]
    pub listen: SocketAddr,
    /// Path to the embedded store database file.
    #[arg(long, default_value = "poold.db", env = "POOLD_DB")]
    pub db_path: PathBuf,
    /// Mining channel to request from the wallet (PRIME or HASH).
    #[arg(long, default_value = "HASH", env = "POOLD_MINING_MODE")]
    pub mining_mode: MiningMode,
    /// Pool fee in percent, persisted into the store config.
    #[arg(long, default_value = "1", env = "POOLD_FEE")]
    pub fee: u32,
    /// Share-target divider: share_target = network_target * divider.
    #[arg(long, default_value = "4", env = "POOLD_DIFFICULTY_DIVIDER")]
    pub difficulty_divider: u32,
    /// Seconds between wallet reconnect attempts.
    #[arg(long, default_value = "5", env = "POOLD_RETRY_INTERVAL")]
    pub connection_retry_interval: u64,
    /// Seconds between GET_HEIGHT polls to the wallet.
    #[arg(long, default_value = "2", env = "POOLD_HEIGHT_INTERVAL")]
    pub get_height_interval: u64,
    /// Seconds a miner has to complete LOGIN.
    #[arg(long, default_value = "10", env = "POOLD_LOGIN_TIMEOUT")]
    pub login_timeout: u64,
    /// Seconds a session ban stays in effect.
    #[arg(long, default_value = "3600", env = "POOLD_BAN_TTL")]
    pub ban_ttl: u64,
    /// Seconds a ban-cache entry stays fresh.
    #[arg(long, default_value = "30", env = "POOLD_BAN_CACHE_TTL")]
    pub ban_cache_ttl: u64,
    /// Maximum concurrent miner connections.
    #[arg(long, default_value = "10000", env = "POOLD_MAX_CONNS")]
    pub max_conns: usize,
    /// Seconds to wait for sessions to drain on shutdown.
    #[arg(long, default_value = "5", env = "POOLD_SHUTDOWN_DEADLINE")]
    pub shutdown_deadline: u64,
}

/// Runtime configuration derived from [`Args`].
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Socket address of the wallet daemon.
    pub wallet_addr: SocketAddr,
    /// Socket address to accept miner connections on.
    pub listen: SocketAddr,
    /// Path to the embedded store database file.
    pub db_path: PathBuf,
    /// Mining channel to request from the wallet.
    pub mining_mode: MiningMode,
    /// Pool fee in percent.
    pub fee: u32,
    /// Share-target divider.
    pub difficulty_divider: u32,
    /// Seconds between wallet reconnect attempts.
    pub connection_retry_interval: u64,
    /// Seconds between GET_HEIGHT polls.
    pub get_height_interval: u64,
    /// Seconds a miner has to complete LOGIN.
    pub login_timeout: u64,
    /// Seconds a session ban stays in effect.
    pub ban_ttl: u64,
    /// Seconds a ban-cache entry stays fresh.
    pub ban_cache_ttl: u64,
    /// Maximum concurrent miner connections.
    pub max_conns: usize,
    /// Seconds to wait for sessions to drain on shutdown.
    pub shutdown_deadline: u64,
}

impl PoolConfig {
    /// Seconds of miner silence tolerated before the session is dropped.
    #[must_use]
    pub const fn idle_timeout(&self) -> u64 {
        5 * self.get_height_interval
    }

    /// Validates the configuration values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.fee > 100 {
            return Err("fee cannot exceed 100 percent".to_string());
        }

        if self.difficulty_divider == 0 {
            return Err("difficulty_divider must be greater than 0".to_string());
        }
        if self.difficulty_divider > 1_000_000 {
            return Err("difficulty_divider exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.connection_retry_interval == 0 {
            return Err("connection_retry_interval must be greater than 0".to_string());
        }
        if self.connection_retry_interval > 300 {
            return Err(
                "connection_retry_interval exceeds reasonable limit (300 seconds)".to_string(),
            );
        }

        if self.get_height_interval == 0 {
            return Err("get_height_interval must be greater than 0".to_string());
        }
        if self.get_height_interval > 3600 {
            return Err("get_height_interval exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.login_timeout == 0 {
            return Err("login_timeout must be greater than 0".to_string());
        }
        if self.login_timeout > 300 {
            return Err("login_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        if self.ban_ttl == 0 {
            return Err("ban_ttl must be greater than 0".to_string());
        }

        if self.ban_cache_ttl == 0 {
            return Err("ban_cache_ttl must be greater than 0".to_string());
        }
        if self.ban_cache_ttl > 3600 {
            return Err("ban_cache_ttl exceeds reasonable limit (3600 seconds)".to_string());
        }

        if self.max_conns == 0 {
            return Err("max_conns must be greater than 0".to_string());
        }
        if self.max_conns > 1_000_000 {
            return Err("max_conns exceeds reasonable limit (1,000,000)".to_string());
        }

        if self.shutdown_deadline == 0 {
            return Err("shutdown_deadline must be greater than 0".to_string());
        }
        if self.shutdown_deadline > 300 {
            return Err("shutdown_deadline exceeds reasonable limit (300 seconds)".to_string());
        }

        Ok(())
    }
}

impl From<Args> for PoolConfig {
    fn from(args: Args) -> Self {
        Self {
            wallet_addr: args.wallet_addr,
            listen: args.listen,
            db_path: args.db_path,
            mining_mode: args.mining_mode,
            fee: args.fee,
            difficulty_divider: args.difficulty_divider,
            connection_retry_interval: args.connection_retry_interval,
            get_height_interval: args.get_height_interval,
            login_timeout: args.login_timeout,
            ban_ttl: args.ban_ttl,
            ban_cache_ttl: args.ban_cache_ttl,
            max_conns: args.max_conns,
            shutdown_deadline: args.shutdown_deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> PoolConfig {
        PoolConfig {
            wallet_addr: "127.0.0.1:9325".parse().unwrap(),
            listen: "127.0.0.1:9988".parse().unwrap(),
            db_path: "poold.db".into(),
            mining_mode: MiningMode::Hash,
            fee: 1,
            difficulty_divider: 4,
            connection_retry_interval: 5,
            get_height_interval: 2,
            login_timeout: 10,
            ban_ttl: 3600,
            ban_cache_ttl: 30,
            max_conns: 10_000,
            shutdown_deadline: 5,
        }
    }

    #[test]
    fn valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn fee_over_100_percent() {
        let mut c = valid_config();
        c.fee = 101;
        assert!(c.validate().unwrap_err().contains("fee"));
    }

    #[test]
    fn difficulty_divider_zero() {
        let mut c = valid_config();
        c.difficulty_divider = 0;
        assert!(c.validate().unwrap_err().contains("difficulty_divider"));
    }

    #[test]
    fn difficulty_divider_too_large() {
        let mut c = valid_config();
        c.difficulty_divider = 1_000_001;
        assert!(c.validate().unwrap_err().contains("difficulty_divider"));
    }

    #[test]
    fn retry_interval_zero() {
        let mut c = valid_config();
        c.connection_retry_interval = 0;
        assert!(c
            .validate()
            .unwrap_err()
            .contains("connection_retry_interval"));
    }

    #[test]
    fn height_interval_zero() {
        let mut c = valid_config();
        c.get_height_interval = 0;
        assert!(c.validate().unwrap_err().contains("get_height_interval"));
    }

    #[test]
    fn login_timeout_zero() {
        let mut c = valid_config();
        c.login_timeout = 0;
        assert!(c.validate().unwrap_err().contains("login_timeout"));
    }

    #[test]
    fn ban_ttl_zero() {
        let mut c = valid_config();
        c.ban_ttl = 0;
        assert!(c.validate().unwrap_err().contains("ban_ttl"));
    }

    #[test]
    fn max_conns_zero() {
        let mut c = valid_config();
        c.max_conns = 0;
        assert!(c.validate().unwrap_err().contains("max_conns"));
    }

    #[test]
    fn shutdown_deadline_too_large() {
        let mut c = valid_config();
        c.shutdown_deadline = 301;
        assert!(c.validate().unwrap_err().contains("shutdown_deadline"));
    }

    #[test]
    fn idle_timeout_is_five_height_intervals() {
        let c = valid_config();
        assert_eq!(c.idle_timeout(), 10);
    }

    #[test]
    fn boundary_values_valid() {
        let mut c = valid_config();
        c.fee = 100;
        c.difficulty_divider = 1;
        c.connection_retry_interval = 1;
        c.get_height_interval = 1;
        c.login_timeout = 1;
        c.ban_ttl = 1;
        c.ban_cache_ttl = 1;
        c.max_conns = 1;
        c.shutdown_deadline = 1;
        assert!(c.validate().is_ok());
    }
}
