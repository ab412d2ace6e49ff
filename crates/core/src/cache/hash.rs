//! Slot naming for the journaled store.

use sha2::{Digest, Sha256};

/// Compute the physical slot name for a resource key.
///
/// The store restricts slot names to `[a-z0-9_-]`, so arbitrary resource
/// identifiers are hashed and hex-encoded.
pub fn slot_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}
