//! On-disk storage for the password-wrapped master key.
//!
//! The master key never touches disk in the clear. It is encrypted under a
//! key derived from the vault password and stored in a small binary file
//! next to the database.
//!
//! The key file layout (binary, big-endian integers):
//! ```text
//! [4 bytes:  magic "KWMK"]
//! [2 bytes:  format version]
//! [4 bytes:  PBKDF2 iterations]
//! [32 bytes: PBKDF2 salt]
//! [12 bytes: AES-256-GCM nonce]
//! [remaining: AES-256-GCM ciphertext + 16-byte tag]
//! ```
//!
//! The first four fields form the associated data of the wrapped key, so a
//! file whose salt or iteration count has been edited fails to unwrap.
//!
//! Writes are atomic: the new contents are staged in a temporary file in the
//! same directory, flushed to disk, and renamed over the old file. A crash at
//! any point leaves either the old key file or the new one, never a mix.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::crypto::{NONCE_LEN_BYTES, SALT_LEN};
use crate::error::{Result, VaultError};

const MAGIC: &[u8; 4] = b"KWMK";
const FORMAT_VERSION: u16 = 1;

/// Length of the authenticated header (magic, version, iterations, salt).
const HEADER_LEN: usize = 4 + 2 + 4 + SALT_LEN;

/// AES-GCM tag length; the wrapped key is at least this long.
const TAG_LEN: usize = 16;

/// A master key as persisted: encrypted, plus what is needed to re-derive
/// the wrapping key.
#[derive(Clone, PartialEq, Eq)]
pub struct WrappedMasterKey {
    pub iterations: u32,
    pub salt: [u8; SALT_LEN],
    pub nonce: [u8; NONCE_LEN_BYTES],
    pub ciphertext: Vec<u8>,
}

impl std::fmt::Debug for WrappedMasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WrappedMasterKey")
            .field("iterations", &self.iterations)
            .finish_non_exhaustive()
    }
}

impl WrappedMasterKey {
    /// Associated data binding the ciphertext to its derivation parameters.
    pub fn header(iterations: u32, salt: &[u8; SALT_LEN]) -> Vec<u8> {
        let mut header = Vec::with_capacity(HEADER_LEN);
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        header.extend_from_slice(&iterations.to_be_bytes());
        header.extend_from_slice(salt);
        header
    }

    /// Associated data for this key.
    pub fn aad(&self) -> Vec<u8> {
        Self::header(self.iterations, &self.salt)
    }

    fn to_bytes(&self) -> Vec<u8> {
        let mut data = self.aad();
        data.reserve(NONCE_LEN_BYTES + self.ciphertext.len());
        data.extend_from_slice(&self.nonce);
        data.extend_from_slice(&self.ciphertext);
        data
    }

    fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + NONCE_LEN_BYTES + TAG_LEN {
            return Err(corrupted("key file is too small"));
        }
        if &data[..4] != MAGIC {
            return Err(corrupted("key file has an unknown magic number"));
        }
        let version = u16::from_be_bytes([data[4], data[5]]);
        if version != FORMAT_VERSION {
            return Err(corrupted(&format!("unsupported key file version {version}")));
        }
        let iterations = u32::from_be_bytes([data[6], data[7], data[8], data[9]]);

        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&data[10..HEADER_LEN]);
        let mut nonce = [0u8; NONCE_LEN_BYTES];
        nonce.copy_from_slice(&data[HEADER_LEN..HEADER_LEN + NONCE_LEN_BYTES]);

        Ok(Self {
            iterations,
            salt,
            nonce,
            ciphertext: data[HEADER_LEN + NONCE_LEN_BYTES..].to_vec(),
        })
    }
}

fn corrupted(reason: &str) -> VaultError {
    VaultError::DecryptionFailed {
        reason: reason.to_string(),
    }
}

/// Handle to the master key file of one vault.
#[derive(Debug, Clone)]
pub struct KeyFile {
    path: PathBuf,
}

impl KeyFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a master key has been written.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read and parse the key file.
    ///
    /// # Errors
    ///
    /// Returns [`VaultError::NotInitialized`] if the file does not exist and
    /// [`VaultError::DecryptionFailed`] if it is malformed.
    pub fn load(&self) -> Result<WrappedMasterKey> {
        let data = match std::fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(VaultError::NotInitialized);
            }
            Err(e) => return Err(e.into()),
        };
        WrappedMasterKey::from_bytes(&data)
    }

    /// Atomically replace the key file with `wrapped`.
    pub fn write(&self, wrapped: &WrappedMasterKey) -> Result<()> {
        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;

        let mut staged = tempfile::NamedTempFile::new_in(&dir)?;
        staged.write_all(&wrapped.to_bytes())?;
        staged.as_file().sync_all()?;

        // Restrict file permissions on Unix (owner read/write only).
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            staged
                .as_file()
                .set_permissions(std::fs::Permissions::from_mode(0o600))?;
        }

        staged.persist(&self.path).map_err(|e| e.error)?;
        sync_dir(&dir)?;

        tracing::info!(path = %self.path.display(), "wrote master key file");
        Ok(())
    }
}

/// Flush a directory entry so a completed rename survives power loss.
pub(crate) fn sync_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        std::fs::File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WrappedMasterKey {
        WrappedMasterKey {
            iterations: 100_000,
            salt: [7u8; SALT_LEN],
            nonce: [9u8; NONCE_LEN_BYTES],
            ciphertext: vec![1u8; 48],
        }
    }

    #[test]
    fn write_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("master.key"));
        assert!(!file.exists());

        file.write(&sample()).unwrap();
        assert!(file.exists());
        assert_eq!(file.load().unwrap(), sample());
    }

    #[test]
    fn overwrite_leaves_no_stray_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("master.key"));

        file.write(&sample()).unwrap();
        let mut second = sample();
        second.iterations = 200_000;
        file.write(&second).unwrap();

        assert_eq!(file.load().unwrap().iterations, 200_000);
        let entries = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("master.key"));
        file.write(&sample()).unwrap();

        let mode = std::fs::metadata(file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn missing_file_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let file = KeyFile::new(dir.path().join("master.key"));
        assert!(matches!(file.load(), Err(VaultError::NotInitialized)));
    }

    #[test]
    fn truncated_or_foreign_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("master.key");
        let file = KeyFile::new(&path);

        std::fs::write(&path, b"KWMK").unwrap();
        assert!(matches!(file.load(), Err(VaultError::DecryptionFailed { .. })));

        let mut bytes = sample().to_bytes();
        bytes[0] = b'X';
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(file.load(), Err(VaultError::DecryptionFailed { .. })));
    }

    #[test]
    fn header_binds_salt_and_iterations() {
        let a = WrappedMasterKey::header(100_000, &[1u8; SALT_LEN]);
        let b = WrappedMasterKey::header(100_001, &[1u8; SALT_LEN]);
        let c = WrappedMasterKey::header(100_000, &[2u8; SALT_LEN]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), HEADER_LEN);
    }
}
