//! Cryptographic primitives for the vault.
//!
//! This module is pure: no I/O, no shared state, safe to call from any
//! number of concurrent tasks.
//!
//! - **Encryption/decryption**: AES-256-GCM authenticated encryption with
//!   randomly generated 96-bit nonces and caller-supplied associated data.
//! - **Key derivation**: PBKDF2-HMAC-SHA256 to derive a 256-bit wrapping key
//!   from a password and a per-vault random salt.
//! - **Password hashing**: Argon2id with tunable cost and a per-user salt.
//! - **Digests**: SHA-256 integrity digests with constant-time comparison.
//!
//! # Security Notes
//!
//! - Nonces are generated randomly for each encryption operation. With a
//!   96-bit nonce and random generation, the probability of a collision is
//!   negligible for up to ~2^32 encryptions under the same key.
//! - Derived keys and decrypted plaintext are returned in [`Zeroizing`]
//!   buffers so they are wiped when dropped.

use std::num::NonZeroU32;

use ring::aead::{self, Aad, BoundKey, NONCE_LEN, Nonce, NonceSequence, SealingKey, UnboundKey};
use ring::digest as sha;
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::{Result, VaultError};

/// Length of the AES-256-GCM key in bytes.
pub const KEY_LEN: usize = 32;

/// Length of the AES-256-GCM nonce in bytes (96 bits).
pub const NONCE_LEN_BYTES: usize = NONCE_LEN;

/// Length of the PBKDF2 salt in bytes.
pub const SALT_LEN: usize = 32;

/// Length of the Argon2id password salt in bytes.
pub const PASSWORD_SALT_LEN: usize = 16;

/// Length of a SHA-256 digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Lowest PBKDF2 iteration count accepted by [`derive_key`].
pub const MIN_KDF_ITERATIONS: u32 = 100_000;

/// PBKDF2 iteration count: 600,000 per OWASP 2023 recommendation for
/// HMAC-SHA256.
pub const DEFAULT_KDF_ITERATIONS: u32 = 600_000;

/// PBKDF2 algorithm: HMAC-SHA256.
static PBKDF2_ALG: pbkdf2::Algorithm = pbkdf2::PBKDF2_HMAC_SHA256;

/// AES-256-GCM algorithm from `ring`.
static AEAD_ALG: &aead::Algorithm = &aead::AES_256_GCM;

/// A 256-bit symmetric key that is wiped on drop.
pub type Key = Zeroizing<[u8; KEY_LEN]>;

// ---------------------------------------------------------------------------
// Nonce handling
// ---------------------------------------------------------------------------

/// A single-use nonce sequence that yields exactly one nonce and then errors.
///
/// `ring` requires a [`NonceSequence`] for sealing operations. Since we
/// generate a fresh random nonce per encryption call, this wrapper ensures
/// each sealing key is used exactly once.
struct SingleNonce(Option<[u8; NONCE_LEN_BYTES]>);

impl SingleNonce {
    fn new(bytes: [u8; NONCE_LEN_BYTES]) -> Self {
        Self(Some(bytes))
    }
}

impl NonceSequence for SingleNonce {
    fn advance(&mut self) -> std::result::Result<Nonce, ring::error::Unspecified> {
        self.0
            .take()
            .map(Nonce::assume_unique_for_key)
            .ok_or(ring::error::Unspecified)
    }
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Encrypt `plaintext` with AES-256-GCM under the 256-bit `key`.
///
/// `aad` is authenticated but not encrypted; the same bytes must be passed
/// to [`decrypt`]. Returns `(nonce, ciphertext)` where `ciphertext` includes
/// the 128-bit authentication tag.
///
/// # Errors
///
/// Returns [`VaultError::EncryptionFailed`] if the key length is wrong or
/// `ring` reports a failure.
pub fn encrypt(plaintext: &[u8], key: &[u8], aad: &[u8]) -> Result<([u8; NONCE_LEN_BYTES], Vec<u8>)> {
    if key.len() != KEY_LEN {
        return Err(VaultError::EncryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }

    let mut nonce_bytes = [0u8; NONCE_LEN_BYTES];
    SystemRandom::new()
        .fill(&mut nonce_bytes)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "failed to generate random nonce".into(),
        })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::EncryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;

    let mut sealing_key = SealingKey::new(unbound_key, SingleNonce::new(nonce_bytes));

    // `ring` encrypts in-place and appends the authentication tag.
    let mut in_out = plaintext.to_vec();
    sealing_key
        .seal_in_place_append_tag(Aad::from(aad), &mut in_out)
        .map_err(|_| VaultError::EncryptionFailed {
            reason: "seal_in_place failed".into(),
        })?;

    tracing::trace!(
        plaintext_len = plaintext.len(),
        ciphertext_len = in_out.len(),
        "encrypted data"
    );

    Ok((nonce_bytes, in_out))
}

/// Decrypt `ciphertext` (which includes the GCM tag) with `nonce`, `key`
/// and the associated data it was sealed with.
///
/// Fails closed: on any authentication failure no plaintext is returned.
///
/// # Errors
///
/// Returns [`VaultError::DecryptionFailed`] if the key is wrong, the
/// ciphertext or associated data has been tampered with, or the nonce is
/// malformed.
pub fn decrypt(nonce: &[u8], ciphertext: &[u8], key: &[u8], aad: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if key.len() != KEY_LEN {
        return Err(VaultError::DecryptionFailed {
            reason: format!("key must be {} bytes, got {}", KEY_LEN, key.len()),
        });
    }
    let nonce: [u8; NONCE_LEN_BYTES] = nonce.try_into().map_err(|_| VaultError::DecryptionFailed {
        reason: format!("nonce must be {} bytes, got {}", NONCE_LEN_BYTES, nonce.len()),
    })?;

    let unbound_key = UnboundKey::new(AEAD_ALG, key).map_err(|_| VaultError::DecryptionFailed {
        reason: "failed to create AES-256-GCM key".into(),
    })?;

    let mut opening_key = aead::OpeningKey::new(unbound_key, SingleNonce::new(nonce));

    let mut in_out = Zeroizing::new(ciphertext.to_vec());
    let plaintext_len = opening_key
        .open_in_place(Aad::from(aad), in_out.as_mut_slice())
        .map_err(|_| VaultError::DecryptionFailed {
            reason: "authentication failed: wrong key or corrupted data".into(),
        })?
        .len();
    in_out.truncate(plaintext_len);

    tracing::trace!(
        ciphertext_len = ciphertext.len(),
        plaintext_len,
        "decrypted data"
    );

    Ok(in_out)
}

// ---------------------------------------------------------------------------
// Key derivation
// ---------------------------------------------------------------------------

/// Derive a 256-bit key from `password` and `salt` with PBKDF2-HMAC-SHA256.
///
/// The salt must be random per vault (or per backup) and persisted next to
/// whatever the derived key protects.
///
/// # Errors
///
/// Returns [`VaultError::KeyDerivationFailed`] if `iterations` is below
/// [`MIN_KDF_ITERATIONS`] or the salt is empty.
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> Result<Key> {
    if iterations < MIN_KDF_ITERATIONS {
        return Err(VaultError::KeyDerivationFailed {
            reason: format!("iterations must be at least {MIN_KDF_ITERATIONS}, got {iterations}"),
        });
    }
    if salt.is_empty() {
        return Err(VaultError::KeyDerivationFailed {
            reason: "salt must not be empty".into(),
        });
    }
    let iterations = NonZeroU32::new(iterations).ok_or_else(|| VaultError::KeyDerivationFailed {
        reason: "iterations must be non-zero".into(),
    })?;

    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    pbkdf2::derive(PBKDF2_ALG, iterations, salt, password, key.as_mut());

    tracing::debug!(iterations = iterations.get(), "derived key from password via PBKDF2");
    Ok(key)
}

// ---------------------------------------------------------------------------
// Random material
// ---------------------------------------------------------------------------

/// Generate a random salt for [`derive_key`].
pub fn generate_salt() -> Result<[u8; SALT_LEN]> {
    let mut salt = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "failed to generate random salt".into(),
        })?;
    Ok(salt)
}

/// Generate a random 256-bit symmetric key.
pub fn generate_key() -> Result<Key> {
    let mut key = Zeroizing::new([0u8; KEY_LEN]);
    SystemRandom::new()
        .fill(key.as_mut())
        .map_err(|_| VaultError::Internal("failed to generate random key".into()))?;
    Ok(key)
}

/// Generate `len` cryptographically secure random bytes.
///
/// # Errors
///
/// Returns [`VaultError::Internal`] if the system CSPRNG fails.
pub fn random_bytes(len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| VaultError::Internal("failed to generate random bytes".into()))?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// Digests
// ---------------------------------------------------------------------------

/// SHA-256 digest of `bytes`.
pub fn digest(bytes: &[u8]) -> [u8; DIGEST_LEN] {
    let mut out = [0u8; DIGEST_LEN];
    out.copy_from_slice(sha::digest(&sha::SHA256, bytes).as_ref());
    out
}

/// Compare two digests in constant time.
pub fn digests_match(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

// ---------------------------------------------------------------------------
// Password hashing
// ---------------------------------------------------------------------------

/// Argon2id cost parameters. Stored alongside every password hash so the
/// cost can be raised without invalidating existing accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordHashParams {
    /// Memory cost in KiB.
    pub memory_kib: u32,
    /// Number of passes.
    pub iterations: u32,
    /// Degree of parallelism.
    pub parallelism: u32,
}

impl Default for PasswordHashParams {
    /// OWASP-recommended Argon2id baseline (19 MiB, 2 passes, 1 lane).
    fn default() -> Self {
        Self {
            memory_kib: 19_456,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl PasswordHashParams {
    fn hasher(&self) -> Result<argon2::Argon2<'static>> {
        let params = argon2::Params::new(
            self.memory_kib,
            self.iterations,
            self.parallelism,
            Some(DIGEST_LEN),
        )
        .map_err(|e| VaultError::KeyDerivationFailed {
            reason: format!("invalid Argon2id parameters: {e}"),
        })?;
        Ok(argon2::Argon2::new(
            argon2::Algorithm::Argon2id,
            argon2::Version::V0x13,
            params,
        ))
    }

    /// Check that the parameters are accepted by Argon2.
    pub fn validate(&self) -> Result<()> {
        self.hasher().map(|_| ())
    }
}

/// Hash `password` with Argon2id under a fresh random salt.
///
/// Returns `(hash, salt)`; both must be stored to verify later.
pub fn hash_password(
    password: &str,
    params: &PasswordHashParams,
) -> Result<([u8; DIGEST_LEN], [u8; PASSWORD_SALT_LEN])> {
    let mut salt = [0u8; PASSWORD_SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| VaultError::KeyDerivationFailed {
            reason: "failed to generate random salt".into(),
        })?;

    let hash = compute_password_hash(password, &salt, params)?;
    Ok((*hash, salt))
}

/// Verify `password` against a stored Argon2id `hash` and `salt`.
///
/// The comparison is constant time. Returns `Ok(false)` on mismatch; errors
/// only if the stored parameters are unusable.
pub fn verify_password(
    password: &str,
    hash: &[u8],
    salt: &[u8],
    params: &PasswordHashParams,
) -> Result<bool> {
    let candidate = compute_password_hash(password, salt, params)?;
    Ok(digests_match(candidate.as_ref(), hash))
}

fn compute_password_hash(
    password: &str,
    salt: &[u8],
    params: &PasswordHashParams,
) -> Result<Zeroizing<[u8; DIGEST_LEN]>> {
    let mut out = Zeroizing::new([0u8; DIGEST_LEN]);
    params
        .hasher()?
        .hash_password_into(password.as_bytes(), salt, out.as_mut())
        .map_err(|e| VaultError::KeyDerivationFailed {
            reason: format!("Argon2id hashing failed: {e}"),
        })?;
    Ok(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> PasswordHashParams {
        PasswordHashParams {
            memory_kib: 64,
            iterations: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = generate_key().unwrap();
        let plaintext = b"hello, keyward vault!";

        let (nonce, ciphertext) = encrypt(plaintext, key.as_ref(), b"ctx").unwrap();
        let decrypted = decrypt(&nonce, &ciphertext, key.as_ref(), b"ctx").unwrap();

        assert_eq!(decrypted.as_slice(), plaintext);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let key1 = generate_key().unwrap();
        let key2 = generate_key().unwrap();

        let (nonce, ciphertext) = encrypt(b"secret data", key1.as_ref(), b"").unwrap();
        let result = decrypt(&nonce, &ciphertext, key2.as_ref(), b"");

        assert!(matches!(result, Err(VaultError::DecryptionFailed { .. })));
    }

    #[test]
    fn decrypt_with_wrong_aad_fails() {
        let key = generate_key().unwrap();

        let (nonce, ciphertext) = encrypt(b"secret data", key.as_ref(), b"github").unwrap();
        let result = decrypt(&nonce, &ciphertext, key.as_ref(), b"gitlab");

        assert!(result.is_err());
    }

    #[test]
    fn decrypt_with_tampered_ciphertext_fails() {
        let key = generate_key().unwrap();

        let (nonce, mut ciphertext) = encrypt(b"secret data", key.as_ref(), b"").unwrap();
        // Flip a bit in the ciphertext.
        if let Some(byte) = ciphertext.first_mut() {
            *byte ^= 0x01;
        }

        assert!(decrypt(&nonce, &ciphertext, key.as_ref(), b"").is_err());
    }

    #[test]
    fn invalid_key_length_rejected() {
        let short_key = vec![0u8; 16]; // AES-128, not AES-256
        assert!(encrypt(b"test", &short_key, b"").is_err());
    }

    #[test]
    fn malformed_nonce_rejected() {
        let key = generate_key().unwrap();
        let (_, ciphertext) = encrypt(b"test", key.as_ref(), b"").unwrap();
        let result = decrypt(&[0u8; 4], &ciphertext, key.as_ref(), b"");
        assert!(matches!(result, Err(VaultError::DecryptionFailed { .. })));
    }

    #[test]
    fn empty_plaintext_roundtrip() {
        let key = generate_key().unwrap();

        let (nonce, ciphertext) = encrypt(b"", key.as_ref(), b"").unwrap();
        let decrypted = decrypt(&nonce, &ciphertext, key.as_ref(), b"").unwrap();

        assert!(decrypted.is_empty());
    }

    #[test]
    fn derive_key_is_deterministic_per_salt() {
        let salt = generate_salt().unwrap();
        let key1 = derive_key(b"my-password", &salt, MIN_KDF_ITERATIONS).unwrap();
        let key2 = derive_key(b"my-password", &salt, MIN_KDF_ITERATIONS).unwrap();
        assert_eq!(*key1, *key2);

        let other_salt = generate_salt().unwrap();
        let key3 = derive_key(b"my-password", &other_salt, MIN_KDF_ITERATIONS).unwrap();
        assert_ne!(*key1, *key3);
    }

    #[test]
    fn derive_key_rejects_low_iterations() {
        let salt = generate_salt().unwrap();
        let result = derive_key(b"pw", &salt, 1_000);
        assert!(matches!(result, Err(VaultError::KeyDerivationFailed { .. })));
    }

    #[test]
    fn salts_are_random() {
        assert_ne!(generate_salt().unwrap(), generate_salt().unwrap());
    }

    #[test]
    fn digest_comparison() {
        let a = digest(b"payload");
        let b = digest(b"payload");
        let c = digest(b"payload!");
        assert!(digests_match(&a, &b));
        assert!(!digests_match(&a, &c));
        assert!(!digests_match(&a, &a[..16]));
    }

    #[test]
    fn password_hash_and_verify() {
        let params = fast_params();
        let (hash, salt) = hash_password("correct horse battery staple", &params).unwrap();

        assert!(verify_password("correct horse battery staple", &hash, &salt, &params).unwrap());
        assert!(!verify_password("wrong password", &hash, &salt, &params).unwrap());
    }

    #[test]
    fn password_hashes_are_salted() {
        let params = fast_params();
        let (hash1, salt1) = hash_password("same password", &params).unwrap();
        let (hash2, salt2) = hash_password("same password", &params).unwrap();

        assert_ne!(salt1, salt2);
        assert_ne!(hash1, hash2);
    }

    #[test]
    fn invalid_password_params_rejected() {
        let params = PasswordHashParams {
            memory_kib: 1,
            iterations: 0,
            parallelism: 1,
        };
        assert!(params.validate().is_err());
        assert!(hash_password("pw", &params).is_err());
    }
}
