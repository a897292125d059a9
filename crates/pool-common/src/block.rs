//! Block template layout and parsing.
//!
//! The wallet serves templates as an opaque-looking byte blob with a fixed
//! prefix layout; the pool only needs the height, the previous-block hash,
//! the 64-byte proof segment a miner hashes, and the network target. All
//! multi-byte fields are big-endian, matching the packet framing.

use crate::packet::PROOF_LEN;
use crate::target::Target;
use thiserror::Error;

/// Serialized template size: height ‖ prev_hash ‖ proof ‖ network_target.
pub const TEMPLATE_LEN: usize = 4 + 32 + PROOF_LEN + 32;

/// Size of the nonce seed appended to templates served to miners.
pub const NONCE_SEED_LEN: usize = 8;

/// Errors produced while parsing a block template.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockError {
    /// The template payload has the wrong size.
    #[error("bad template length: expected {expected}, got {actual}")]
    BadLength {
        /// Required template size.
        expected: usize,
        /// Actual payload size.
        actual: usize,
    },
}

/// An unsolved block template received from the wallet.
///
/// Immutable once parsed; the pool manager shares it with sessions behind
/// an `Arc` and never mutates it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTemplate {
    /// Chain height this template builds on.
    pub height: u32,
    /// Hash of the previous block, used for template equality checks.
    pub prev_hash: [u8; 32],
    /// The 64-byte proof segment miners hash together with their nonce.
    pub proof: [u8; PROOF_LEN],
    /// Network difficulty target a block candidate must meet.
    pub network_target: Target,
}

impl BlockTemplate {
    /// Parses a template from a BLOCK_DATA payload.
    ///
    /// # Errors
    ///
    /// Returns [`BlockError::BadLength`] unless the payload is exactly
    /// [`TEMPLATE_LEN`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, BlockError> {
        if data.len() != TEMPLATE_LEN {
            return Err(BlockError::BadLength {
                expected: TEMPLATE_LEN,
                actual: data.len(),
            });
        }
        let height = u32::from_be_bytes(data[0..4].try_into().expect("4 height bytes"));
        let mut prev_hash = [0u8; 32];
        prev_hash.copy_from_slice(&data[4..36]);
        let mut proof = [0u8; PROOF_LEN];
        proof.copy_from_slice(&data[36..36 + PROOF_LEN]);
        let mut target = [0u8; 32];
        target.copy_from_slice(&data[36 + PROOF_LEN..]);
        Ok(Self {
            height,
            prev_hash,
            proof,
            network_target: Target::from_be_bytes(target),
        })
    }

    /// Serializes the template back into its wire layout.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(TEMPLATE_LEN);
        v.extend_from_slice(&self.height.to_be_bytes());
        v.extend_from_slice(&self.prev_hash);
        v.extend_from_slice(&self.proof);
        v.extend_from_slice(&self.network_target.to_be_bytes());
        v
    }

    /// Serializes the template followed by the per-session nonce seed, the
    /// form served to miners in BLOCK_DATA.
    #[must_use]
    pub fn serialize_for_miner(&self, nonce_seed: u64) -> Vec<u8> {
        let mut v = self.serialize();
        v.extend_from_slice(&nonce_seed.to_be_bytes());
        v
    }
}
