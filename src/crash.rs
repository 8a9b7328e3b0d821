//! Crash point derivation
//!
//! A round's crash multiplier is a pure function of its committed hash, so any
//! party holding the disclosed hash can recompute the outcome. The house edge
//! is a policy parameter of [`CrashResolver`].

use crate::errors::ChainError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::{fmt, str::FromStr};

/// Number of bits taken from the top of the hash for the payout curve.
const CURVE_BITS: u32 = 52;

/// Committed round hash (SHA-256 digest), hex encoded on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoundHash([u8; 32]);

impl RoundHash {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Hash for the last round of a segment, derived from the secret seed.
    pub fn from_seed(seed: &str) -> Self {
        Self(Sha256::digest(seed.as_bytes()).into())
    }

    /// Hash of the round played immediately before this one.
    ///
    /// Links hash the hex text of the later round, so a player can check
    /// `later.preceding() == earlier` once `later` is disclosed but cannot walk
    /// the chain forward.
    pub fn preceding(&self) -> Self {
        Self(Sha256::digest(self.to_hex().as_bytes()).into())
    }

    pub fn from_hex(value: &str) -> Result<Self, ChainError> {
        let bytes = hex::decode(value).map_err(|e| ChainError::InvalidHash {
            value: value.to_string(),
            reason: e.to_string(),
        })?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| ChainError::InvalidHash {
            value: value.to_string(),
            reason: "expected 32 bytes".to_string(),
        })?;
        Ok(Self(array))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RoundHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoundHash({})", self.to_hex())
    }
}

impl fmt::Display for RoundHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl TryFrom<String> for RoundHash {
    type Error = ChainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<RoundHash> for String {
    fn from(hash: RoundHash) -> Self {
        hash.to_hex()
    }
}

impl FromStr for RoundHash {
    type Err = ChainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Payout multiplier in hundredths (`350` is 3.50x).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Multiplier(u64);

impl Multiplier {
    pub const ONE: Multiplier = Multiplier(100);

    pub const fn from_hundredths(value: u64) -> Self {
        Self(value)
    }

    pub const fn hundredths(self) -> u64 {
        self.0
    }

    /// Credit for a stake cashed out at this multiplier, rounded down.
    pub fn payout(self, amount: u64) -> Option<u64> {
        let credit = amount as u128 * self.0 as u128 / 100;
        u64::try_from(credit).ok()
    }
}

impl fmt::Display for Multiplier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}x", self.0 / 100, self.0 % 100)
    }
}

impl FromStr for Multiplier {
    type Err = String;

    /// Parses `"2"`, `"2.5"`, `"2.50"` or `"2.50x"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_end_matches(['x', 'X']);
        let (whole, frac) = trimmed.split_once('.').unwrap_or((trimmed, ""));
        if whole.is_empty() || frac.len() > 2 {
            return Err(format!("invalid multiplier '{}'", s));
        }
        let whole: u64 = whole.parse().map_err(|_| format!("invalid multiplier '{}'", s))?;
        let frac: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().map_err(|_| format!("invalid multiplier '{}'", s))? * 10,
            _ => frac.parse().map_err(|_| format!("invalid multiplier '{}'", s))?,
        };
        whole
            .checked_mul(100)
            .and_then(|v| v.checked_add(frac))
            .map(Multiplier)
            .ok_or_else(|| format!("multiplier '{}' out of range", s))
    }
}

/// Maps round hashes to crash points with a fixed house edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CrashResolver {
    /// One in `instant_bust_modulus` rounds busts at 1.00x.
    instant_bust_modulus: u64,
}

impl Default for CrashResolver {
    fn default() -> Self {
        Self {
            instant_bust_modulus: 101,
        }
    }
}

impl CrashResolver {
    pub fn new(instant_bust_modulus: u64) -> Self {
        Self {
            instant_bust_modulus: instant_bust_modulus.max(1),
        }
    }

    pub fn instant_bust_modulus(&self) -> u64 {
        self.instant_bust_modulus
    }

    /// Crash multiplier for a round hash. Total over all 256-bit values; the
    /// result is always at least 1.00x.
    pub fn crash_point(&self, hash: &RoundHash) -> Multiplier {
        if self.is_instant_bust(hash) {
            return Multiplier::ONE;
        }

        let bytes = hash.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let h = u64::from_be_bytes(head) >> (64 - CURVE_BITS);
        let e = 1u64 << CURVE_BITS;

        Multiplier((100 * e - h) / (e - h))
    }

    fn is_instant_bust(&self, hash: &RoundHash) -> bool {
        let modulus = self.instant_bust_modulus as u128;
        let remainder = hash
            .as_bytes()
            .iter()
            .fold(0u128, |acc, byte| (acc * 256 + *byte as u128) % modulus);
        remainder == 0
    }
}
