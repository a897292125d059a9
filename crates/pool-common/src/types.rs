//! Core type definitions and protocol constants for the pool stack.

use std::fmt;
use std::str::FromStr;

/// Identifier assigned to each accepted miner connection.
pub type ConnectionId = u64;

/// Mining channel selected during the wallet handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiningMode {
    /// Prime-chain mining (wallet channel 1).
    Prime,
    /// Hash-chain mining (wallet channel 2).
    Hash,
}

impl MiningMode {
    /// Wire value carried in SET_CHANNEL.
    #[must_use]
    pub const fn channel(self) -> u32 {
        match self {
            Self::Prime => 1,
            Self::Hash => 2,
        }
    }
}

impl fmt::Display for MiningMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Prime => write!(f, "PRIME"),
            Self::Hash => write!(f, "HASH"),
        }
    }
}

impl FromStr for MiningMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PRIME" => Ok(Self::Prime),
            "HASH" => Ok(Self::Hash),
            other => Err(format!("unknown mining mode '{other}', expected PRIME or HASH")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_values_match_the_wire_protocol() {
        assert_eq!(MiningMode::Prime.channel(), 1);
        assert_eq!(MiningMode::Hash.channel(), 2);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("hash".parse::<MiningMode>().unwrap(), MiningMode::Hash);
        assert_eq!("PRIME".parse::<MiningMode>().unwrap(), MiningMode::Prime);
        assert!("proof".parse::<MiningMode>().is_err());
    }

    #[test]
    fn display_round_trips_through_from_str() {
        for mode in [MiningMode::Prime, MiningMode::Hash] {
            assert_eq!(mode.to_string().parse::<MiningMode>().unwrap(), mode);
        }
    }
}
