//! Revision-chain hashing, shared by the gateway's store and by tests that
//! need to independently recompute a chain for tamper-evidence checks.

use base64::Engine;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// `SHA256(parent_rev_hash ‖ payload_hash)`, hex-encoded. `parent_rev_hash`
/// is the empty string for `seq=1`.
pub fn rev_hash(parent_rev_hash: &str, payload_hash: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(parent_rev_hash.as_bytes());
    hasher.update(payload_hash.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn payload_hash(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Canonicalize a patch (sorted keys, UTF-8, no whitespace) and base64 it,
/// per the `Task.update` algorithm. `serde_json::Value` maps are `BTreeMap`s
/// in this workspace (no `preserve_order` feature anywhere), so `to_vec`
/// already yields sorted keys with no extra whitespace.
pub fn canonicalize_patch<T: Serialize>(patch: &T) -> anyhow::Result<(String, String)> {
    let canonical = serde_json::to_vec(patch)?;
    let encoded = base64::engine::general_purpose::STANDARD.encode(&canonical);
    let hash = payload_hash(&canonical);
    Ok((encoded, hash))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chain_from_seq1_has_empty_parent() {
        let payload_hash = payload_hash(b"{}");
        let h1 = rev_hash("", &payload_hash);
        assert_eq!(h1.len(), 64);

        let payload_hash_2 = payload_hash.clone();
        let h2 = rev_hash(&h1, &payload_hash_2);
        assert_ne!(h1, h2);

        // Recomputing from the same inputs reproduces the same hash (tamper-evidence).
        assert_eq!(rev_hash(&h1, &payload_hash_2), h2);
    }

    #[test]
    fn canonicalize_patch_is_deterministic() {
        let patch = serde_json::json!({ "b": 1, "a": 2 });
        let (encoded_1, hash_1) = canonicalize_patch(&patch).unwrap();
        let (encoded_2, hash_2) = canonicalize_patch(&patch).unwrap();
        assert_eq!(encoded_1, encoded_2);
        assert_eq!(hash_1, hash_2);
    }
}
