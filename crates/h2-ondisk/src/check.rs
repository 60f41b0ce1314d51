//! Media check codes carried in the blockref `check` area.

use crate::blockref::Blockref;
use h2_types::{
    HAMMER2_CHECK_DISABLED, HAMMER2_CHECK_FREEMAP, HAMMER2_CHECK_ISCSI32, HAMMER2_CHECK_NONE,
    HAMMER2_CHECK_SHA192, HAMMER2_CHECK_XXHASH64, HAMMER2_XXH64_SEED,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Outcome of validating loaded media against its blockref.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckOutcome {
    /// The digest matched.
    Good,
    /// The blockref carries no check code (NONE or DISABLED).
    Unchecked,
    /// The digest did not match.
    Mismatch,
    /// The check method is not one this build understands.
    UnknownMethod(u8),
}

impl CheckOutcome {
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Mismatch | Self::UnknownMethod(_))
    }
}

/// CRC32C as used by ISCSI32 check codes, freemap checks and volume headers.
#[must_use]
pub fn icrc32(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

#[must_use]
pub fn xxh64(data: &[u8]) -> u64 {
    xxhash_rust::xxh64::xxh64(data, HAMMER2_XXH64_SEED)
}

/// SHA-256 folded to 192 bits: the third 64-bit word is XORed with the
/// fourth and the first 24 bytes are kept.
#[must_use]
pub fn sha192(data: &[u8]) -> [u8; 24] {
    let digest = Sha256::digest(data);
    let mut out = [0_u8; 24];
    out.copy_from_slice(&digest[..24]);
    for (dst, src) in out[16..24].iter_mut().zip(&digest[24..32]) {
        *dst ^= *src;
    }
    out
}

/// Validate `data` (the raw on-media bytes) against `bref.check`.
#[must_use]
pub fn verify(bref: &Blockref, data: &[u8]) -> CheckOutcome {
    let matched = match bref.check_method() {
        HAMMER2_CHECK_NONE | HAMMER2_CHECK_DISABLED => return CheckOutcome::Unchecked,
        HAMMER2_CHECK_ISCSI32 | HAMMER2_CHECK_FREEMAP => {
            bref.check[0..4] == icrc32(data).to_le_bytes()
        }
        HAMMER2_CHECK_XXHASH64 => bref.check[0..8] == xxh64(data).to_le_bytes(),
        HAMMER2_CHECK_SHA192 => bref.check[0..24] == sha192(data),
        other => return CheckOutcome::UnknownMethod(other),
    };
    if matched {
        CheckOutcome::Good
    } else {
        CheckOutcome::Mismatch
    }
}

/// Store the digest of `data` into `bref.check` according to its method.
///
/// Only the digest bytes are written; the freemap `bigmask`/`avail` fields
/// that share the check area are left alone.
pub fn seal(bref: &mut Blockref, data: &[u8]) {
    match bref.check_method() {
        HAMMER2_CHECK_ISCSI32 | HAMMER2_CHECK_FREEMAP => {
            bref.check[0..4].copy_from_slice(&icrc32(data).to_le_bytes());
        }
        HAMMER2_CHECK_XXHASH64 => {
            bref.check[0..8].copy_from_slice(&xxh64(data).to_le_bytes());
        }
        HAMMER2_CHECK_SHA192 => {
            bref.check[0..24].copy_from_slice(&sha192(data));
        }
        _ => {}
    }
}

#[must_use]
pub fn method_name(method: u8) -> &'static str {
    match method {
        HAMMER2_CHECK_NONE => "none",
        HAMMER2_CHECK_DISABLED => "disabled",
        HAMMER2_CHECK_ISCSI32 => "crc32",
        HAMMER2_CHECK_XXHASH64 => "xxhash64",
        HAMMER2_CHECK_SHA192 => "sha192",
        HAMMER2_CHECK_FREEMAP => "freemap",
        _ => "unknown",
    }
}
