//! Request signing and public-key verification.
//!
//! A principal registers an armored (base64-encoded raw) Ed25519 public key
//! via `PublicKey.upload`; the gateway indexes it by fingerprint
//! (`sha256(raw_bytes)`, hex-encoded). Clients sign the canonical JSON body
//! of a request with the matching private key and attach the signature and
//! fingerprint as headers; [`Verifier::verify`] checks the signature against
//! the stored key before the method handler runs.

use base64::Engine;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use sha2::{Digest, Sha256};

use crate::error::CoreError;

/// Header carrying the base64 Ed25519 signature over the canonical request body.
pub const SIGNATURE_HEADER: &str = "X-Peagen-Signature";
/// Header carrying the hex fingerprint of the signing key, for gateway lookup.
pub const FINGERPRINT_HEADER: &str = "X-Peagen-Key-Fingerprint";

/// Canonicalize a JSON value for signing: sorted object keys, no insignificant
/// whitespace. `serde_json::Value`'s `Map` is a `BTreeMap` by default (the
/// `preserve_order` feature is not enabled anywhere in this workspace), so
/// `to_string` already yields sorted keys.
pub fn canonicalize(value: &serde_json::Value) -> Vec<u8> {
    serde_json::to_vec(value).expect("serde_json::Value always serializes")
}

pub fn fingerprint_of(armored: &str) -> Result<String, CoreError> {
    let raw = decode_armored(armored)?;
    Ok(hex::encode(Sha256::digest(raw)))
}

fn decode_armored(armored: &str) -> Result<Vec<u8>, CoreError> {
    base64::engine::general_purpose::STANDARD
        .decode(armored.trim())
        .map_err(|err| CoreError::invalid_request(format!("invalid armored key: {err}")))
}

pub fn verifying_key_from_armored(armored: &str) -> Result<VerifyingKey, CoreError> {
    let raw = decode_armored(armored)?;
    let bytes: [u8; 32] = raw
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::invalid_request("armored key must be 32 raw bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|err| CoreError::invalid_request(format!("invalid ed25519 key: {err}")))
}

pub fn armor_verifying_key(key: &VerifyingKey) -> String {
    base64::engine::general_purpose::STANDARD.encode(key.as_bytes())
}

/// Client-side helper: sign a canonical request body.
pub struct RequestSigner {
    signing_key: SigningKey,
}

impl RequestSigner {
    pub fn new(signing_key: SigningKey) -> Self {
        Self { signing_key }
    }

    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn armored_public_key(&self) -> String {
        armor_verifying_key(&self.signing_key.verifying_key())
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(Sha256::digest(self.signing_key.verifying_key().as_bytes()))
    }

    pub fn sign(&self, canonical_body: &[u8]) -> String {
        let sig: Signature = self.signing_key.sign(canonical_body);
        base64::engine::general_purpose::STANDARD.encode(sig.to_bytes())
    }
}

/// Gateway-side verification against a stored armored key.
pub fn verify_signature(armored_key: &str, canonical_body: &[u8], signature_b64: &str) -> Result<(), CoreError> {
    let verifying_key = verifying_key_from_armored(armored_key)?;
    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(signature_b64.trim())
        .map_err(|_| CoreError::unauthorized("invalid signature encoding"))?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::unauthorized("invalid signature length"))?;
    let signature = Signature::from_bytes(&sig_array);
    verifying_key
        .verify(canonical_body, &signature)
        .map_err(|_| CoreError::unauthorized("signature verification failed"))
}
