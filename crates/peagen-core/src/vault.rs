//! Hybrid envelope encryption for the secret vault.
//!
//! Built on the standard modern Rust AEAD + X25519 pairing
//! (ChaCha20-Poly1305 for content encryption, X25519 ECDH for per-recipient
//! key wrap); see DESIGN.md for the rationale.
//!
//! `Secret.add`/`Secret.get` pass `ciphertext` and `wrapped_keys` as opaque
//! values — the gateway never computes or sees plaintext. The functions here
//! run **client-side** (in [`crate`]'s consumers: `peagen-client`, task
//! handlers, tests) to produce those opaque values and to unwrap them again.

use base64::Engine;
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};

use crate::error::CoreError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WrappedKey {
    pub recipient_fingerprint: String,
    pub ephemeral_public_key: String,
    pub wrapped_cek: String,
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: String,
    pub nonce: String,
    pub wrapped_keys: Vec<WrappedKey>,
}

pub struct Recipient<'a> {
    pub fingerprint: &'a str,
    pub x25519_public_key: &'a X25519PublicKey,
}

fn b64(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn unb64(s: &str) -> Result<Vec<u8>, CoreError> {
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|err| CoreError::invalid_request(format!("invalid base64: {err}")))
}

fn derive_key(shared_secret: &[u8]) -> Key {
    let digest = Sha256::digest(shared_secret);
    *Key::from_slice(digest.as_slice())
}

/// Encrypt `plaintext` under a fresh content-encryption key, then wrap that
/// key to each recipient's X25519 public key.
pub fn encrypt(plaintext: &[u8], recipients: &[Recipient<'_>]) -> Result<EncryptedSecret, CoreError> {
    let cek = ChaCha20Poly1305::generate_key(&mut OsRng);
    let cipher = ChaCha20Poly1305::new(&cek);
    let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CoreError::internal(anyhow::anyhow!("secret encryption failed")))?;

    let mut wrapped_keys = Vec::with_capacity(recipients.len());
    for recipient in recipients {
        let ephemeral_secret = EphemeralSecret::random_from_rng(OsRng);
        let ephemeral_public = X25519PublicKey::from(&ephemeral_secret);
        let shared = ephemeral_secret.diffie_hellman(recipient.x25519_public_key);

        let wrap_key = derive_key(shared.as_bytes());
        let wrap_cipher = ChaCha20Poly1305::new(&wrap_key);
        let wrap_nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let wrapped_cek = wrap_cipher
            .encrypt(&wrap_nonce, cek.as_slice())
            .map_err(|_| CoreError::internal(anyhow::anyhow!("key wrap failed")))?;

        wrapped_keys.push(WrappedKey {
            recipient_fingerprint: recipient.fingerprint.to_string(),
            ephemeral_public_key: b64(ephemeral_public.as_bytes()),
            wrapped_cek: b64(&wrapped_cek),
            nonce: b64(&wrap_nonce),
        });
    }

    Ok(EncryptedSecret {
        ciphertext: b64(&ciphertext),
        nonce: b64(&nonce),
        wrapped_keys,
    })
}

/// Unwrap the content-encryption key for `my_fingerprint` and decrypt the
/// ciphertext. Returns `unauthorized` if no wrapped key matches.
pub fn decrypt(encrypted: &EncryptedSecret, my_fingerprint: &str, my_secret: &StaticSecret) -> Result<Vec<u8>, CoreError> {
    let wrapped = encrypted
        .wrapped_keys
        .iter()
        .find(|w| w.recipient_fingerprint == my_fingerprint)
        .ok_or_else(|| CoreError::unauthorized("no wrapped key for this principal"))?;

    let ephemeral_public_bytes = unb64(&wrapped.ephemeral_public_key)?;
    let ephemeral_public_array: [u8; 32] = ephemeral_public_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::invalid_request("malformed ephemeral public key"))?;
    let ephemeral_public = X25519PublicKey::from(ephemeral_public_array);

    let shared = my_secret.diffie_hellman(&ephemeral_public);
    let wrap_key = derive_key(shared.as_bytes());
    let wrap_cipher = ChaCha20Poly1305::new(&wrap_key);
    let wrap_nonce = Nonce::from_slice(&unb64(&wrapped.nonce)?).to_owned();

    let cek_bytes = wrap_cipher
        .decrypt(&wrap_nonce, unb64(&wrapped.wrapped_cek)?.as_slice())
        .map_err(|_| CoreError::unauthorized("failed to unwrap content key"))?;
    let cek = Key::from_slice(&cek_bytes);
    let cipher = ChaCha20Poly1305::new(cek);
    let nonce = Nonce::from_slice(&unb64(&encrypted.nonce)?).to_owned();

    cipher
        .decrypt(&nonce, unb64(&encrypted.ciphertext)?.as_slice())
        .map_err(|_| CoreError::unauthorized("failed to decrypt secret"))
}

pub fn generate_keypair() -> (StaticSecret, X25519PublicKey) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = X25519PublicKey::from(&secret);
    (secret, public)
}

pub fn armor_x25519_public(key: &X25519PublicKey) -> String {
    b64(key.as_bytes())
}

pub fn x25519_public_from_armored(armored: &str) -> Result<X25519PublicKey, CoreError> {
    let bytes = unb64(armored)?;
    let array: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::invalid_request("x25519 public key must be 32 raw bytes"))?;
    Ok(X25519PublicKey::from(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_for_every_recipient() {
        let (u_secret, u_public) = generate_keypair();
        let (w_secret, w_public) = generate_keypair();

        let recipients = vec![
            Recipient { fingerprint: "user-fp", x25519_public_key: &u_public },
            Recipient { fingerprint: "worker-fp", x25519_public_key: &w_public },
        ];

        let encrypted = encrypt(b"super-secret-value", &recipients).unwrap();

        let plaintext_u = decrypt(&encrypted, "user-fp", &u_secret).unwrap();
        assert_eq!(plaintext_u, b"super-secret-value");

        let plaintext_w = decrypt(&encrypted, "worker-fp", &w_secret).unwrap();
        assert_eq!(plaintext_w, b"super-secret-value");
    }

    #[test]
    fn unauthorized_principal_cannot_unwrap() {
        let (u_secret, u_public) = generate_keypair();
        let (_other_secret, _other_public) = generate_keypair();

        let recipients = vec![Recipient { fingerprint: "user-fp", x25519_public_key: &u_public }];
        let encrypted = encrypt(b"v", &recipients).unwrap();

        let err = decrypt(&encrypted, "intruder-fp", &u_secret).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Unauthorized);
    }
}
