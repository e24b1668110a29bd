//! Cipher gateway: organisation key derivation and envelope encryption.
//!
//! # Algorithms
//!
//! - **Key Derivation**: Argon2id over the user's organisation secret, salted with the
//!   organisation id
//! - **Encryption**: XChaCha20-Poly1305 with a random 24-byte nonce per message
//!
//! Every entity is sealed with its own random key; that key is sealed with the
//! organisation key and travels next to the payload as `encryptedEntityKey`.
//! Rotating the organisation key therefore only rewraps entity keys.
//!
//! Sealed values are `base64(nonce || ciphertext || tag)`.
//!
//! The organisation key lives in memory only. Nothing in this module writes it anywhere.

use crate::entity::{Entity, Record};
use argon2::{Algorithm, Argon2, Params, Version};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Key length for XChaCha20-Poly1305 (32 bytes)
pub const KEY_LEN: usize = 32;

/// Nonce length for XChaCha20-Poly1305 (24 bytes)
pub const NONCE_LEN: usize = 24;

/// Plaintext sealed into the organisation's verification key
const VERIFICATION_MARKER: &[u8] = b"casefile-organisation-key-check";

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed")]
    Encrypt,

    #[error("Decryption failed (corrupt ciphertext or wrong key)")]
    Decrypt,

    #[error("Record {0} has no encrypted payload")]
    MissingPayload(String),

    #[error("Invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("Invalid payload: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Organisation key does not match the verification key")]
    WrongKey,
}

pub type Result<T> = std::result::Result<T, CipherError>;

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB
    pub memory_kib: u32,
    /// Iteration count
    pub iterations: u32,
    /// Parallelism (lanes)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            iterations: 3,
            parallelism: 1,
        }
    }
}

/// The per-organisation symmetric key. Held in memory for the session only.
#[derive(Clone, PartialEq, Eq)]
pub struct OrganisationKey([u8; KEY_LEN]);

impl OrganisationKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// A random key, for tests and fresh organisations.
    pub fn generate() -> Self {
        Self(random_bytes())
    }
}

impl fmt::Debug for OrganisationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OrganisationKey(..)")
    }
}

/// Derive the organisation key from the user's secret.
pub fn derive_organisation_key(
    secret: &str,
    organisation_id: &str,
    params: &KdfParams,
) -> Result<OrganisationKey> {
    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CipherError::KeyDerivation(format!("Invalid Argon2 params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    // Argon2 wants at least 8 bytes of salt; the prefix guarantees it.
    let salt = format!("casefile:{organisation_id}");
    let mut key = [0u8; KEY_LEN];
    argon2
        .hash_password_into(secret.as_bytes(), salt.as_bytes(), &mut key)
        .map_err(|e| CipherError::KeyDerivation(e.to_string()))?;

    Ok(OrganisationKey(key))
}

/// Ciphertext of one entity payload plus its wrapped entity key.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedPayload {
    pub ciphertext: String,
    pub entity_key: String,
}

/// Encrypt a payload under a fresh entity key.
pub fn encrypt_entity(payload: &Value, key: &OrganisationKey) -> Result<EncryptedPayload> {
    let entity_key: [u8; KEY_LEN] = random_bytes();
    let plaintext = serde_json::to_vec(payload)?;
    Ok(EncryptedPayload {
        ciphertext: seal(&entity_key, &plaintext)?,
        entity_key: seal(&key.0, &entity_key)?,
    })
}

/// Decrypt a payload by first unwrapping its entity key.
pub fn decrypt_entity(encrypted: &EncryptedPayload, key: &OrganisationKey) -> Result<Value> {
    let entity_key = unwrap_entity_key(&encrypted.entity_key, key)?;
    let plaintext = open(&entity_key, &encrypted.ciphertext)?;
    Ok(serde_json::from_slice(&plaintext)?)
}

/// Seal an entity into its wire form.
pub fn seal_entity(entity: &Entity, key: &OrganisationKey) -> Result<Record> {
    let (encrypted, encrypted_entity_key) = if entity.is_tombstoned() {
        (None, None)
    } else {
        let sealed = encrypt_entity(&entity.payload()?, key)?;
        (Some(sealed.ciphertext), Some(sealed.entity_key))
    };
    Ok(Record {
        id: entity.id.clone(),
        organisation: entity.organisation.clone(),
        created_at: entity.created_at,
        updated_at: entity.updated_at,
        deleted_at: entity.deleted_at,
        encrypted,
        encrypted_entity_key,
    })
}

/// Open a wire record. Tombstones open to metadata-only entities without decryption.
pub fn open_record(record: &Record, key: &OrganisationKey) -> Result<Entity> {
    if record.is_tombstoned() {
        return Ok(Entity::tombstone_of(record));
    }
    let (Some(ciphertext), Some(entity_key)) = (&record.encrypted, &record.encrypted_entity_key)
    else {
        return Err(CipherError::MissingPayload(record.id.clone()));
    };
    let payload = decrypt_entity(
        &EncryptedPayload {
            ciphertext: ciphertext.clone(),
            entity_key: entity_key.clone(),
        },
        key,
    )?;
    Ok(Entity::from_payload(record, payload)?)
}

/// Re-encrypt a record's entity key under a new organisation key.
///
/// The payload ciphertext is left untouched.
pub fn rewrap_entity_key(
    record: &Record,
    old_key: &OrganisationKey,
    new_key: &OrganisationKey,
) -> Result<Record> {
    let Some(wrapped) = &record.encrypted_entity_key else {
        return Ok(record.clone());
    };
    let entity_key = unwrap_entity_key(wrapped, old_key)?;
    let mut rewrapped = record.clone();
    rewrapped.encrypted_entity_key = Some(seal(&new_key.0, &entity_key)?);
    Ok(rewrapped)
}

/// An encrypted file blob and its wrapped key.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedFile {
    /// nonce || ciphertext || tag
    pub content: Vec<u8>,
    pub entity_key: String,
}

pub fn encrypt_file(bytes: &[u8], key: &OrganisationKey) -> Result<EncryptedFile> {
    let file_key: [u8; KEY_LEN] = random_bytes();
    Ok(EncryptedFile {
        content: seal_bytes(&file_key, bytes)?,
        entity_key: seal(&key.0, &file_key)?,
    })
}

pub fn decrypt_file(file: &EncryptedFile, key: &OrganisationKey) -> Result<Vec<u8>> {
    let file_key = unwrap_entity_key(&file.entity_key, key)?;
    open_bytes(&file_key, &file.content)
}

/// Produce the organisation's verification key for a freshly derived key.
pub fn encrypt_verification_key(key: &OrganisationKey) -> Result<String> {
    seal(&key.0, VERIFICATION_MARKER)
}

/// Check a derived key against the organisation's verification key.
pub fn verify_organisation_key(key: &OrganisationKey, verification: &str) -> Result<()> {
    match open(&key.0, verification) {
        Ok(plain) if plain == VERIFICATION_MARKER => Ok(()),
        Ok(_) | Err(CipherError::Decrypt) => Err(CipherError::WrongKey),
        Err(e) => Err(e),
    }
}

fn unwrap_entity_key(wrapped: &str, key: &OrganisationKey) -> Result<[u8; KEY_LEN]> {
    let bytes = open(&key.0, wrapped)?;
    bytes.try_into().map_err(|_| CipherError::Decrypt)
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    bytes
}

fn seal(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<String> {
    Ok(STANDARD.encode(seal_bytes(key, plaintext)?))
}

fn open(key: &[u8; KEY_LEN], sealed: &str) -> Result<Vec<u8>> {
    open_bytes(key, &STANDARD.decode(sealed)?)
}

fn seal_bytes(key: &[u8; KEY_LEN], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let nonce: [u8; NONCE_LEN] = random_bytes();
    let ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), plaintext)
        .map_err(|_| CipherError::Encrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn open_bytes(key: &[u8; KEY_LEN], sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < NONCE_LEN {
        return Err(CipherError::Decrypt);
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(XNonce::from_slice(nonce), ciphertext)
        .map_err(|_| CipherError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::parse_date;
    use serde_json::json;

    /// Cheap parameters so tests don't spend seconds in Argon2.
    fn fast_kdf() -> KdfParams {
        KdfParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    fn record() -> Record {
        Record {
            id: "c1".into(),
            organisation: "org".into(),
            created_at: parse_date("2024-01-01").unwrap(),
            updated_at: parse_date("2024-01-02").unwrap(),
            deleted_at: None,
            encrypted: None,
            encrypted_entity_key: None,
        }
    }

    #[test]
    fn test_key_derivation_is_deterministic() {
        let a = derive_organisation_key("secret", "org-1", &fast_kdf()).unwrap();
        let b = derive_organisation_key("secret", "org-1", &fast_kdf()).unwrap();
        let other_org = derive_organisation_key("secret", "org-2", &fast_kdf()).unwrap();
        let other_secret = derive_organisation_key("Secret", "org-1", &fast_kdf()).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other_org);
        assert_ne!(a, other_secret);
    }

    #[test]
    fn test_entity_encryption_uses_fresh_keys() {
        let key = OrganisationKey::generate();
        let payload = json!({ "diagnosis": "confidential" });

        let first = encrypt_entity(&payload, &key).unwrap();
        let second = encrypt_entity(&payload, &key).unwrap();

        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(first.entity_key, second.entity_key);
        assert!(!first.ciphertext.contains("confidential"));
        assert_eq!(decrypt_entity(&first, &key).unwrap(), payload);
    }

    #[test]
    fn test_wrong_key_is_a_decrypt_error() {
        let sealed = encrypt_entity(&json!({ "a": 1 }), &OrganisationKey::generate()).unwrap();
        let err = decrypt_entity(&sealed, &OrganisationKey::generate()).unwrap_err();
        assert!(matches!(err, CipherError::Decrypt));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let key = OrganisationKey::generate();
        let mut sealed = encrypt_entity(&json!({ "a": 1 }), &key).unwrap();
        let mut raw = STANDARD.decode(&sealed.ciphertext).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        sealed.ciphertext = STANDARD.encode(raw);

        assert!(matches!(decrypt_entity(&sealed, &key), Err(CipherError::Decrypt)));
    }

    #[test]
    fn test_seal_and_open_entity() {
        let key = OrganisationKey::generate();
        let entity = Entity::from_payload(&record(), json!({ "name": "Alice" })).unwrap();

        let sealed = seal_entity(&entity, &key).unwrap();
        assert!(sealed.encrypted.is_some());
        assert_eq!(open_record(&sealed, &key).unwrap(), entity);
    }

    #[test]
    fn test_open_tombstone_skips_decryption() {
        let mut rec = record();
        rec.deleted_at = Some(parse_date("2024-01-03").unwrap());

        let entity = open_record(&rec, &OrganisationKey::generate()).unwrap();
        assert!(entity.is_tombstoned());
    }

    #[test]
    fn test_missing_payload_is_reported() {
        let err = open_record(&record(), &OrganisationKey::generate()).unwrap_err();
        assert!(matches!(err, CipherError::MissingPayload(id) if id == "c1"));
    }

    #[test]
    fn test_rewrap_keeps_payload_ciphertext() {
        let old_key = OrganisationKey::generate();
        let new_key = OrganisationKey::generate();
        let entity = Entity::from_payload(&record(), json!({ "name": "Bob" })).unwrap();
        let sealed = seal_entity(&entity, &old_key).unwrap();

        let rewrapped = rewrap_entity_key(&sealed, &old_key, &new_key).unwrap();

        assert_eq!(rewrapped.encrypted, sealed.encrypted);
        assert_ne!(rewrapped.encrypted_entity_key, sealed.encrypted_entity_key);
        assert_eq!(open_record(&rewrapped, &new_key).unwrap(), entity);
        assert!(open_record(&rewrapped, &old_key).is_err());
    }

    #[test]
    fn test_file_round_trip() {
        let key = OrganisationKey::generate();
        let blob = b"%PDF-1.7 scanned prescription".to_vec();

        let encrypted = encrypt_file(&blob, &key).unwrap();
        assert_ne!(encrypted.content, blob);
        assert_eq!(decrypt_file(&encrypted, &key).unwrap(), blob);
    }

    #[test]
    fn test_verification_key() {
        let key = derive_organisation_key("secret", "org", &fast_kdf()).unwrap();
        let verification = encrypt_verification_key(&key).unwrap();

        assert!(verify_organisation_key(&key, &verification).is_ok());

        let wrong = derive_organisation_key("wrong", "org", &fast_kdf()).unwrap();
        assert!(matches!(
            verify_organisation_key(&wrong, &verification),
            Err(CipherError::WrongKey)
        ));
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = OrganisationKey::from_bytes([7u8; KEY_LEN]);
        assert_eq!(format!("{:?}", key), "OrganisationKey(..)");
    }
}
