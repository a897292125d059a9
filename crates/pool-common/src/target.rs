//! 256-bit big-endian target arithmetic.
//!
//! A target is an unsigned 256-bit bound: a hash "meets" a target when,
//! interpreted as a big-endian integer, it is less than or equal to it.
//! The pool derives its easier share target by multiplying the network
//! target by the configured difficulty divider.

/// A 256-bit unsigned integer in big-endian byte order.
///
/// Byte-wise lexicographic order on big-endian bytes coincides with
/// numeric order, so the derived `Ord` is the numeric comparison.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Target([u8; 32]);

impl Target {
    /// The zero target; nothing meets it except the all-zero hash.
    pub const ZERO: Self = Self([0u8; 32]);

    /// The maximum target; every hash meets it.
    pub const MAX: Self = Self([0xFF; 32]);

    /// Creates a target from big-endian bytes.
    #[must_use]
    pub const fn from_be_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Returns the big-endian byte representation.
    #[must_use]
    pub const fn to_be_bytes(self) -> [u8; 32] {
        self.0
    }

    /// Creates the target `2^exp`. `exp` must be below 256.
    ///
    /// # Panics
    ///
    /// Panics if `exp >= 256`.
    #[must_use]
    pub fn pow2(exp: u32) -> Self {
        assert!(exp < 256, "2^{exp} does not fit a 256-bit target");
        let mut bytes = [0u8; 32];
        let byte = 31 - (exp / 8) as usize;
        bytes[byte] = 1 << (exp % 8);
        Self(bytes)
    }

    /// Multiplies by a small factor, saturating at [`Target::MAX`].
    #[must_use]
    pub fn saturating_mul(self, factor: u32) -> Self {
        let mut limbs = self.limbs();
        let factor = u128::from(factor);
        let mut carry: u128 = 0;
        for limb in limbs.iter_mut().rev() {
            let product = u128::from(*limb) * factor + carry;
            *limb = product as u64;
            carry = product >> 64;
        }
        if carry != 0 {
            return Self::MAX;
        }
        Self::from_limbs(limbs)
    }

    /// Returns `true` when `hash`, read big-endian, is `<= self`.
    #[must_use]
    pub fn meets(self, hash: &[u8; 32]) -> bool {
        *hash <= self.0
    }

    // Limbs are big-endian: limbs[0] is the most significant 64 bits.
    fn limbs(self) -> [u64; 4] {
        let mut limbs = [0u64; 4];
        for (i, limb) in limbs.iter_mut().enumerate() {
            *limb = u64::from_be_bytes(self.0[i * 8..(i + 1) * 8].try_into().expect("8 bytes"));
        }
        limbs
    }

    fn from_limbs(limbs: [u64; 4]) -> Self {
        let mut bytes = [0u8; 32];
        for (i, limb) in limbs.iter().enumerate() {
            bytes[i * 8..(i + 1) * 8].copy_from_slice(&limb.to_be_bytes());
        }
        Self(bytes)
    }
}

impl std::fmt::Debug for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Target(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pow2_sets_the_expected_bit() {
        assert_eq!(Target::pow2(0).to_be_bytes()[31], 1);
        assert_eq!(Target::pow2(7).to_be_bytes()[31], 0x80);
        assert_eq!(Target::pow2(8).to_be_bytes()[30], 1);
        assert_eq!(Target::pow2(255).to_be_bytes()[0], 0x80);
    }

    #[test]
    #[should_panic(expected = "256-bit target")]
    fn pow2_rejects_overflowing_exponent() {
        let _ = Target::pow2(256);
    }

    #[test]
    fn ordering_is_numeric() {
        assert!(Target::pow2(230) < Target::pow2(240));
        assert!(Target::ZERO < Target::pow2(0));
        assert!(Target::pow2(255) < Target::MAX);
    }

    #[test]
    fn meets_is_inclusive() {
        let target = Target::pow2(240);
        assert!(target.meets(&target.to_be_bytes()));
        assert!(target.meets(&Target::pow2(229).to_be_bytes()));
        assert!(!target.meets(&Target::pow2(241).to_be_bytes()));
        assert!(!target.meets(&Target::MAX.to_be_bytes()));
    }

    #[test]
    fn mul_by_power_of_two_shifts() {
        assert_eq!(Target::pow2(10).saturating_mul(4), Target::pow2(12));
        assert_eq!(Target::pow2(100).saturating_mul(1), Target::pow2(100));
    }

    #[test]
    fn mul_carries_across_limbs() {
        // 2^63 * 2 crosses the lowest limb boundary.
        assert_eq!(Target::pow2(63).saturating_mul(2), Target::pow2(64));
        assert_eq!(Target::pow2(127).saturating_mul(2), Target::pow2(128));
    }

    #[test]
    fn mul_saturates_on_overflow() {
        assert_eq!(Target::pow2(255).saturating_mul(2), Target::MAX);
        assert_eq!(Target::MAX.saturating_mul(1000), Target::MAX);
    }

    #[test]
    fn mul_by_zero_is_zero() {
        assert_eq!(Target::pow2(200).saturating_mul(0), Target::ZERO);
    }

    #[test]
    fn round_trips_bytes() {
        let bytes: [u8; 32] = (0u8..32).collect::<Vec<_>>().try_into().unwrap();
        assert_eq!(Target::from_be_bytes(bytes).to_be_bytes(), bytes);
    }
}
