//! Share codes.
//!
//! A share code is the only external handle to a stored file or group. Codes
//! are drawn uniformly from [`CODE_ALPHABET`], which omits the easily
//! confused symbols `0`, `O`, `1` and `I`.
//!
//! With the default length of 6 there are 32^6 ≈ 1.07e9 codes. After `n`
//! codes have been issued the probability that a fresh draw collides is
//! `n / 32^6`, and the chance of any collision among `n` draws is roughly
//! `n^2 / 2.15e9`. Callers that hold a record set retry on collision, see
//! `courier_metadata::generate_unique_code`.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Symbols a code is built from.
pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Default number of symbols in a code.
pub const DEFAULT_CODE_LENGTH: usize = 6;

/// Longest code accepted from clients.
pub const MAX_CODE_LENGTH: usize = 32;

/// Draw a random code of `len` symbols.
pub fn random_code(len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| CODE_ALPHABET[rng.random_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// A validated, normalized share code.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareCode(String);

impl ShareCode {
    /// Parse a code supplied by a client.
    ///
    /// Lowercase input is accepted and normalized to uppercase.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let s = s.trim();
        if s.is_empty() || s.len() > MAX_CODE_LENGTH {
            return Err(crate::Error::InvalidCode(format!(
                "length must be between 1 and {MAX_CODE_LENGTH}"
            )));
        }
        let normalized = s.to_ascii_uppercase();
        if !normalized.bytes().all(|b| CODE_ALPHABET.contains(&b)) {
            return Err(crate::Error::InvalidCode(format!(
                "unexpected symbol in {s:?}"
            )));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShareCode({})", self.0)
    }
}

impl fmt::Display for ShareCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
