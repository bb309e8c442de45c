//! Credential guard for secrets that live for exactly one job.
//!
//! A secret supplied with a submission is sealed into an [`Envelope`] at once
//! and the caller's copy is dropped. The envelope sits in the runner's memory
//! until the job executes, where [`CredentialGuard::unseal`] consumes it and
//! yields a [`SecretString`] that is handed to a single adapter call and then
//! dropped.
//!
//! # Key
//!
//! The symmetric key is derived with PBKDF2-HMAC-SHA256 from a master value
//! read from the environment variable named in `[credentials].key_env`. When
//! the variable is unset a fixed development key is used and a warning is
//! logged. Changing the master key between seal and unseal makes the envelope
//! unusable ([`JobError::Decryption`]).
//!
//! # Memory hygiene
//!
//! Plaintext is only ever held in [`SecretString`], which zeroes its buffer on
//! drop and redacts itself in `Debug`. This is best-effort: the allocator,
//! the adapter and any external process may still leave copies behind.

use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hmac::{Hmac, Mac};
use secrecy::zeroize::Zeroize;
use secrecy::{ExposeSecret, SecretBox, SecretString};
use sha2::Sha256;
use std::fmt;

use crate::error::{JobError, JobResult};
use crate::models::ProgressUpdate;

type HmacSha256 = Hmac<Sha256>;

const KEY_SALT: &[u8] = b"tracker-harness/credential-guard/v1";
const PBKDF2_ROUNDS: u32 = 100_000;
const DEV_MASTER_KEY: &str = "tracker-harness-development-key-change-me";

/// Wraps an owned string into a [`SecretString`].
pub fn secret_from(value: String) -> SecretString {
    SecretBox::new(value.into_boxed_str())
}

/// Replaces every occurrence of `secret` in `text`. Used on engine output
/// before it is stored as a failure message.
pub fn redact(text: &str, secret: Option<&SecretString>) -> String {
    match secret.map(|s| s.expose_secret()) {
        Some(s) if !s.is_empty() => text.replace(s, "[REDACTED]"),
        _ => text.to_string(),
    }
}

/// [`redact`] applied to a progress report: the message, every string in
/// its data and every object key.
pub fn redact_update(update: ProgressUpdate, secret: Option<&SecretString>) -> ProgressUpdate {
    let Some(secret) = secret else {
        return update;
    };
    ProgressUpdate {
        message: redact(&update.message, Some(secret)),
        data: update.data.map(|data| redact_json(data, secret)),
    }
}

fn redact_json(value: serde_json::Value, secret: &SecretString) -> serde_json::Value {
    use serde_json::Value;
    match value {
        Value::String(s) => Value::String(redact(&s, Some(secret))),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_json(item, secret))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (redact(&k, Some(secret)), redact_json(v, secret)))
                .collect(),
        ),
        other => other,
    }
}

/// An encrypted secret scoped to one job. Never serialized, never persisted.
pub struct Envelope {
    key_id: [u8; 8],
    nonce: [u8; 12],
    ciphertext: Vec<u8>,
}

impl fmt::Debug for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Envelope")
            .field("key_id", &hex::encode(self.key_id))
            .field("ciphertext", &"[REDACTED]")
            .finish()
    }
}

pub struct CredentialGuard {
    cipher: ChaCha20Poly1305,
    key_id: [u8; 8],
}

impl fmt::Debug for CredentialGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialGuard")
            .field("key_id", &hex::encode(self.key_id))
            .finish()
    }
}

impl CredentialGuard {
    /// Builds a guard from the master key in `key_env`, or the development
    /// fallback when the variable is unset or empty.
    pub fn from_env(key_env: &str) -> Self {
        match std::env::var(key_env) {
            Ok(mut master) if !master.is_empty() => {
                let guard = Self::from_master_key(&master);
                master.zeroize();
                guard
            }
            _ => {
                tracing::warn!(
                    key_env = %key_env,
                    "credential key not set, using the development fallback key"
                );
                Self::from_master_key(DEV_MASTER_KEY)
            }
        }
    }

    pub fn from_master_key(master: &str) -> Self {
        let mut derived = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(master.as_bytes(), KEY_SALT, PBKDF2_ROUNDS, &mut derived);

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&derived));
        let key_id = fingerprint(&derived);
        derived.zeroize();

        Self { cipher, key_id }
    }

    /// Hex fingerprint of the active key; safe to log.
    pub fn key_id(&self) -> String {
        hex::encode(self.key_id)
    }

    pub fn seal(&self, secret: &SecretString) -> JobResult<Envelope> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, secret.expose_secret().as_bytes())
            .map_err(|_| JobError::Other(anyhow::anyhow!("failed to seal credential")))?;

        let mut nonce_bytes = [0u8; 12];
        nonce_bytes.copy_from_slice(nonce.as_slice());

        Ok(Envelope {
            key_id: self.key_id,
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Opens `envelope`, consuming it. The returned secret should be dropped
    /// as soon as the call that needs it returns.
    pub fn unseal(&self, envelope: Envelope) -> JobResult<SecretString> {
        if envelope.key_id != self.key_id {
            return Err(JobError::Decryption(format!(
                "sealed under key {}, active key is {}",
                hex::encode(envelope.key_id),
                self.key_id()
            )));
        }

        let mut plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(&envelope.nonce), envelope.ciphertext.as_slice())
            .map_err(|_| JobError::Decryption("authentication tag mismatch".to_string()))?;

        match String::from_utf8(std::mem::take(&mut plaintext)) {
            Ok(s) => Ok(secret_from(s)),
            Err(e) => {
                e.into_bytes().zeroize();
                Err(JobError::Decryption("plaintext is not valid UTF-8".to_string()))
            }
        }
    }
}

fn fingerprint(key: &[u8; 32]) -> [u8; 8] {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(b"key-id");
    let digest = mac.finalize().into_bytes();
    let mut id = [0u8; 8];
    id.copy_from_slice(&digest[..8]);
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_unseal_returns_secret() {
        let guard = CredentialGuard::from_master_key("master-one");
        let envelope = guard.seal(&secret_from("hunter2".into())).unwrap();
        let opened = guard.unseal(envelope).unwrap();
        assert_eq!(opened.expose_secret(), "hunter2");
    }

    #[test]
    fn ciphertext_does_not_contain_plaintext() {
        let guard = CredentialGuard::from_master_key("master-one");
        let envelope = guard.seal(&secret_from("hunter2-hunter2".into())).unwrap();
        let needle = b"hunter2";
        assert!(!envelope
            .ciphertext
            .windows(needle.len())
            .any(|w| w == needle));
    }

    #[test]
    fn different_key_is_a_decryption_error() {
        let sealer = CredentialGuard::from_master_key("master-one");
        let opener = CredentialGuard::from_master_key("master-two");
        let envelope = sealer.seal(&secret_from("hunter2".into())).unwrap();
        let err = opener.unseal(envelope).unwrap_err();
        assert!(matches!(err, JobError::Decryption(_)));
    }

    #[test]
    fn tampered_ciphertext_is_a_decryption_error() {
        let guard = CredentialGuard::from_master_key("master-one");
        let mut envelope = guard.seal(&secret_from("hunter2".into())).unwrap();
        envelope.ciphertext[0] ^= 0xff;
        assert!(matches!(
            guard.unseal(envelope),
            Err(JobError::Decryption(_))
        ));
    }

    #[test]
    fn nonces_are_unique_per_seal() {
        let guard = CredentialGuard::from_master_key("master-one");
        let a = guard.seal(&secret_from("same".into())).unwrap();
        let b = guard.seal(&secret_from("same".into())).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn debug_output_is_redacted() {
        let guard = CredentialGuard::from_master_key("master-one");
        let secret = secret_from("hunter2".into());
        let envelope = guard.seal(&secret).unwrap();
        assert!(!format!("{:?}", envelope).contains("hunter2"));
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert!(format!("{:?}", guard).contains(&guard.key_id()));
    }

    #[test]
    fn redact_masks_every_occurrence() {
        let secret = secret_from("hunter2".into());
        assert_eq!(
            redact("hunter2 rejected: bad password hunter2", Some(&secret)),
            "[REDACTED] rejected: bad password [REDACTED]"
        );
        assert_eq!(redact("plain", None), "plain");
        assert_eq!(redact("plain", Some(&secret_from(String::new()))), "plain");
    }

    #[test]
    fn redact_update_scrubs_message_and_data() {
        let secret = secret_from("hunter2".into());
        let update = ProgressUpdate::with_data(
            "signing in with hunter2",
            serde_json::json!({
                "attempt": 1,
                "form": { "password": "hunter2", "hunter2": ["x", "pw=hunter2"] }
            }),
        );
        let clean = redact_update(update, Some(&secret));
        assert_eq!(clean.message, "signing in with [REDACTED]");
        assert_eq!(
            clean.data,
            Some(serde_json::json!({
                "attempt": 1,
                "form": { "password": "[REDACTED]", "[REDACTED]": ["x", "pw=[REDACTED]"] }
            }))
        );

        let untouched = redact_update(ProgressUpdate::text("hunter2"), None);
        assert_eq!(untouched.message, "hunter2");
    }

    #[test]
    fn same_master_key_gives_same_key_id() {
        let a = CredentialGuard::from_master_key("master-one");
        let b = CredentialGuard::from_master_key("master-one");
        assert_eq!(a.key_id(), b.key_id());
    }
}
