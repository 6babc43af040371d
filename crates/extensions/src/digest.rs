//! Stable fingerprints.
//!
//! `serde_json` maps are sorted by key, so the textual form of a [`Value`] is
//! canonical and equal values always hash equally.

use serde_json::Value;
use sha2::{Digest, Sha256};

pub(crate) fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    hex::encode(Sha256::digest(input.as_ref()))
}

pub(crate) fn hash_value(value: &Value) -> String {
    sha256_hex(value.to_string())
}
