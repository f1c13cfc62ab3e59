//! Per-instance flag generation and digesting.
//!
//! Only the SHA-256 digest of a flag is ever persisted. The raw value goes
//! into the sandbox's environment and is then dropped.

use rand::{rngs::OsRng, RngCore};
use sha2::{Digest, Sha256};
use std::fmt;
use subtle::ConstantTimeEq;

/// Random bytes per flag; 64 bits of entropy.
const RANDOM_BYTES: usize = 8;

/// A raw flag value. `Debug` never prints the value.
pub struct Secret(String);

impl Secret {
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn digest(&self) -> String {
        digest(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

/// `FLAG{<exercise id>_<16 hex chars>}`.
pub fn generate(exercise_id: &str) -> Secret {
    let mut random = [0u8; RANDOM_BYTES];
    OsRng.fill_bytes(&mut random);

    let suffix: String = random.iter().map(|b| format!("{:02x}", b)).collect();
    Secret(format!("FLAG{{{}_{}}}", exercise_id, suffix))
}

/// Lowercase hex SHA-256.
pub fn digest(value: &str) -> String {
    format!("{:x}", Sha256::digest(value.as_bytes()))
}

pub fn digests_match(submitted: &str, stored: &str) -> bool {
    submitted.as_bytes().ct_eq(stored.as_bytes()).into()
}

/// Short prefix of a digest, safe for log lines.
pub fn log_prefix(digest: &str) -> &str {
    digest.get(..12).unwrap_or(digest)
}
