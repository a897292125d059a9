//! Share evaluation against the pool and network targets.
//!
//! The proof-of-work digest is a pure function of the proof segment and
//! the nonce, so validation is deterministic: identical inputs always
//! produce the same verdict.

use crate::packet::PROOF_LEN;
use crate::target::Target;
use sha2::{Digest, Sha256};

/// Verdict for a submitted share.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareOutcome {
    /// The hash misses even the pool's share target.
    Invalid,
    /// The hash meets the share target but not the network target.
    Share,
    /// The hash meets the network target; eligible for upstream submission.
    BlockCandidate,
}

/// Hashes a proof segment with a nonce: double SHA-256 over proof ‖ nonce.
#[must_use]
pub fn hash_proof(proof: &[u8; PROOF_LEN], nonce: u64) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(proof);
    hasher.update(nonce.to_be_bytes());
    let first = hasher.finalize();
    let second = Sha256::digest(first);
    second.into()
}

/// Evaluates a share against both targets.
///
/// `share_target` is the pool's (easier) bound, `network_target` the
/// chain's. A hash meeting the network target is reported as a block
/// candidate regardless of the share target, which by construction it
/// also meets whenever the divider is at least one.
#[must_use]
pub fn evaluate(
    proof: &[u8; PROOF_LEN],
    nonce: u64,
    share_target: Target,
    network_target: Target,
) -> ShareOutcome {
    let hash = hash_proof(proof, nonce);
    if network_target.meets(&hash) {
        ShareOutcome::BlockCandidate
    } else if share_target.meets(&hash) {
        ShareOutcome::Share
    } else {
        ShareOutcome::Invalid
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic() {
        let proof = [0x42; PROOF_LEN];
        assert_eq!(hash_proof(&proof, 7), hash_proof(&proof, 7));
        assert_ne!(hash_proof(&proof, 7), hash_proof(&proof, 8));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let proof = [0x42; PROOF_LEN];
        let share = Target::pow2(240);
        let network = Target::pow2(230);
        let first = evaluate(&proof, 1, share, network);
        let second = evaluate(&proof, 1, share, network);
        assert_eq!(first, second);
    }

    #[test]
    fn max_share_target_accepts_everything() {
        let outcome = evaluate(&[0; PROOF_LEN], 0, Target::MAX, Target::ZERO);
        assert_eq!(outcome, ShareOutcome::Share);
    }

    #[test]
    fn zero_targets_reject_everything() {
        let outcome = evaluate(&[0; PROOF_LEN], 0, Target::ZERO, Target::ZERO);
        assert_eq!(outcome, ShareOutcome::Invalid);
    }

    #[test]
    fn hash_exactly_on_target_is_a_candidate() {
        let proof = [0x42; PROOF_LEN];
        let hash = hash_proof(&proof, 99);
        let network = Target::from_be_bytes(hash);
        assert_eq!(
            evaluate(&proof, 99, Target::MAX, network),
            ShareOutcome::BlockCandidate
        );
    }

    #[test]
    fn candidate_wins_over_plain_share() {
        // Pin the network target just above the actual hash so the same
        // submission flips from Share to BlockCandidate.
        let proof = [0x13; PROOF_LEN];
        let nonce = 5;
        let hash = hash_proof(&proof, nonce);
        let just_above = Target::from_be_bytes(hash);
        let just_below = {
            let mut bytes = hash;
            // hash of real data is never all zero, so this cannot underflow
            let mut i = 31;
            while bytes[i] == 0 {
                bytes[i] = 0xFF;
                i -= 1;
            }
            bytes[i] -= 1;
            Target::from_be_bytes(bytes)
        };

        assert_eq!(
            evaluate(&proof, nonce, Target::MAX, just_above),
            ShareOutcome::BlockCandidate
        );
        assert_eq!(
            evaluate(&proof, nonce, Target::MAX, just_below),
            ShareOutcome::Share
        );
    }
}
