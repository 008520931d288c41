//! Client-side sealing of sync payloads.
//!
//! The key is derived from the encryption secret with PBKDF2, salted by the
//! client id, and never leaves the replica. Each payload is sealed with
//! AES-256-GCM under a fresh random nonce, with the version id as associated
//! data, so a payload moved to another version fails to open.
//!
//! Envelope layout: `u32` big-endian envelope version, 12-byte nonce, then
//! ciphertext with the tag appended.

use std::num::NonZeroU32;

use ring::rand::SecureRandom;
use ring::{aead, digest, pbkdf2, rand};
use uuid::Uuid;

use crate::error::{Error, Result};

const PBKDF2_ITERATIONS: u32 = 100_000;
const ENVELOPE_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + aead::NONCE_LEN;

/// Seals and opens payloads for one client. Deriving the key is slow, so
/// build one per server and keep it.
pub(crate) struct Cryptor {
    key: aead::LessSafeKey,
    rng: rand::SystemRandom,
}

impl Cryptor {
    pub(crate) fn new(client_id: Uuid, secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::InvalidArgument(
                "encryption secret must not be empty".to_string(),
            ));
        }
        let salt = digest::digest(&digest::SHA256, client_id.as_bytes());
        let iterations = NonZeroU32::new(PBKDF2_ITERATIONS)
            .ok_or_else(|| Error::Sync("invalid key derivation parameters".to_string()))?;

        let mut key_bytes = vec![0u8; aead::AES_256_GCM.key_len()];
        pbkdf2::derive(
            pbkdf2::PBKDF2_HMAC_SHA256,
            iterations,
            salt.as_ref(),
            secret,
            &mut key_bytes,
        );
        let unbound = aead::UnboundKey::new(&aead::AES_256_GCM, &key_bytes)
            .map_err(|_| Error::Sync("cannot build encryption key".to_string()))?;

        Ok(Self {
            key: aead::LessSafeKey::new(unbound),
            rng: rand::SystemRandom::new(),
        })
    }

    /// Encrypt `plaintext` for `version_id`.
    pub(crate) fn seal(&self, version_id: Uuid, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; aead::NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| Error::Sync("cannot generate nonce".to_string()))?;
        let nonce = aead::Nonce::assume_unique_for_key(nonce_bytes);

        let mut payload = plaintext.to_vec();
        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, aead::Aad::from(version_id.as_bytes()), &mut payload)
            .map_err(|_| Error::Sync(format!("cannot seal version {}", version_id)))?;

        let mut envelope = Vec::with_capacity(HEADER_LEN + payload.len() + tag.as_ref().len());
        envelope.extend_from_slice(&ENVELOPE_VERSION.to_be_bytes());
        envelope.extend_from_slice(&nonce_bytes);
        envelope.extend_from_slice(&payload);
        envelope.extend_from_slice(tag.as_ref());
        Ok(envelope)
    }

    /// Decrypt an envelope sealed for `version_id`.
    pub(crate) fn unseal(&self, version_id: Uuid, envelope: &[u8]) -> Result<Vec<u8>> {
        if envelope.len() <= HEADER_LEN {
            return Err(Error::Sync(format!(
                "payload for version {} is too short",
                version_id
            )));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&envelope[..4]);
        let version = u32::from_be_bytes(version);
        if version != ENVELOPE_VERSION {
            return Err(Error::Sync(format!(
                "unrecognized envelope version {}",
                version
            )));
        }

        let mut nonce = [0u8; aead::NONCE_LEN];
        nonce.copy_from_slice(&envelope[4..HEADER_LEN]);
        let mut payload = envelope[HEADER_LEN..].to_vec();
        let plaintext = self
            .key
            .open_in_place(
                aead::Nonce::assume_unique_for_key(nonce),
                aead::Aad::from(version_id.as_bytes()),
                &mut payload,
            )
            .map_err(|_| {
                Error::Sync(format!(
                    "cannot decrypt version {}; is the encryption secret right?",
                    version_id
                ))
            })?;
        Ok(plaintext.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_unseal() {
        let cryptor = Cryptor::new(Uuid::new_v4(), b"correct horse").unwrap();
        let version = Uuid::new_v4();
        let sealed = cryptor.seal(version, b"[{\"create\":1}]").unwrap();

        assert!(!sealed.windows(6).any(|w| w == b"create"));
        assert_eq!(cryptor.unseal(version, &sealed).unwrap(), b"[{\"create\":1}]");
    }

    #[test]
    fn nonces_differ_between_seals() {
        let cryptor = Cryptor::new(Uuid::new_v4(), b"s").unwrap();
        let version = Uuid::new_v4();
        assert_ne!(
            cryptor.seal(version, b"same").unwrap(),
            cryptor.seal(version, b"same").unwrap()
        );
    }

    #[test]
    fn wrong_version_secret_or_client_fails() {
        let client = Uuid::new_v4();
        let cryptor = Cryptor::new(client, b"secret").unwrap();
        let version = Uuid::new_v4();
        let sealed = cryptor.seal(version, b"payload").unwrap();

        assert!(cryptor.unseal(Uuid::new_v4(), &sealed).is_err());
        let other_secret = Cryptor::new(client, b"secret2").unwrap();
        assert!(other_secret.unseal(version, &sealed).is_err());
        let other_client = Cryptor::new(Uuid::new_v4(), b"secret").unwrap();
        assert!(other_client.unseal(version, &sealed).is_err());
    }

    #[test]
    fn damaged_envelopes_are_rejected() {
        let cryptor = Cryptor::new(Uuid::new_v4(), b"secret").unwrap();
        let version = Uuid::new_v4();
        let mut sealed = cryptor.seal(version, b"payload").unwrap();

        assert!(cryptor.unseal(version, &sealed[..HEADER_LEN]).is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(cryptor.unseal(version, &sealed).is_err());

        sealed[last] ^= 0x01;
        sealed[3] = 2;
        let err = cryptor.unseal(version, &sealed).unwrap_err();
        assert!(err.to_string().contains("envelope version 2"));
    }

    #[test]
    fn empty_secret_is_rejected() {
        assert!(matches!(
            Cryptor::new(Uuid::new_v4(), b""),
            Err(Error::InvalidArgument(_))
        ));
    }
}
