//! Per-machine encryption key for the token store
//!
//! The key is 32 random bytes stored base64-encoded in an owner-only file.
//! It is created on first use and never regenerated implicitly: a malformed
//! key file is an error, because a silent replacement would orphan every
//! token encrypted under the old key.

use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use common::Secret;
use rand::RngExt;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::fsutil::write_private;

/// AES-256 key size in bytes
pub const KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct EncryptionKey(Secret<[u8; KEY_LEN]>);

impl EncryptionKey {
    /// Fresh key from the thread-local CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        rand::rng().fill(&mut bytes);
        Self(Secret::new(bytes))
    }

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(Secret::new(bytes))
    }

    /// Parse the key file's contents (base64, surrounding whitespace ignored).
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::KeyCorrupt(format!("key file is not valid base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = bytes.try_into().map_err(|b: Vec<u8>| {
            Error::KeyCorrupt(format!("key must be {KEY_LEN} bytes, got {}", b.len()))
        })?;
        Ok(Self::from_bytes(bytes))
    }

    fn encode(&self) -> String {
        format!("{}\n", STANDARD.encode(self.0.expose()))
    }

    pub(crate) fn bytes(&self) -> &[u8; KEY_LEN] {
        self.0.expose()
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey([REDACTED])")
    }
}

/// Load the key at `path`, creating it on first use.
///
/// Two processes racing on first use may both generate a key; the rename
/// makes the last writer win without a torn file, and the key is re-read
/// after writing so this process uses whatever actually landed on disk.
pub async fn load_or_create_key(path: &Path) -> Result<EncryptionKey> {
    match tokio::fs::read(path).await {
        Ok(raw) => {
            let text = String::from_utf8(raw)
                .map_err(|_| Error::KeyCorrupt(format!("{} is not text", path.display())))?;
            EncryptionKey::decode(&text)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no encryption key found, generating one");
            let key = EncryptionKey::generate();
            write_private(path, key.encode().as_bytes()).await?;
            let written = tokio::fs::read_to_string(path)
                .await
                .map_err(|e| Error::Io(format!("re-reading {}: {e}", path.display())))?;
            let on_disk = EncryptionKey::decode(&written)?;
            if on_disk.bytes() != key.bytes() {
                warn!(path = %path.display(), "another process created the key first, using theirs");
            }
            Ok(on_disk)
        }
        Err(e) => Err(Error::Io(format!("reading {}: {e}", path.display()))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn creates_key_once_and_reloads_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".key");

        let first = load_or_create_key(&path).await.unwrap();
        let second = load_or_create_key(&path).await.unwrap();
        assert_eq!(first.bytes(), second.bytes());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn key_file_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".key");
        load_or_create_key(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600, "key file must be 0600, got {mode:o}");
    }

    #[tokio::test]
    async fn malformed_key_fails_without_regenerating() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".key");
        std::fs::write(&path, "definitely not a key").unwrap();

        let result = load_or_create_key(&path).await;
        assert!(matches!(result, Err(Error::KeyCorrupt(_))), "{result:?}");
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "definitely not a key",
            "corrupt key file must be left for the user to inspect"
        );
    }

    #[tokio::test]
    async fn wrong_length_key_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".key");
        std::fs::write(&path, STANDARD.encode([7u8; 16])).unwrap();

        let result = load_or_create_key(&path).await;
        assert!(matches!(result, Err(Error::KeyCorrupt(ref m)) if m.contains("got 16")));
    }

    #[test]
    fn decode_accepts_trailing_newline() {
        let key = EncryptionKey::generate();
        let decoded = EncryptionKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.bytes(), key.bytes());
    }

    #[test]
    fn debug_is_redacted() {
        let key = EncryptionKey::from_bytes([1u8; KEY_LEN]);
        assert_eq!(format!("{key:?}"), "EncryptionKey([REDACTED])");
    }
}
