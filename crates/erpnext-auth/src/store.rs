//! Encrypted multi-site token store
//!
//! The whole `site -> TokenRecord` map is serialized to JSON and sealed with
//! AES-256-GCM under the machine key. On disk:
//!
//! ```text
//! erpnext-tokens:v1:<base64(nonce || ciphertext+tag)>
//! ```
//!
//! Decryption failures are reported as `TokenStoreCorrupt`, never as an empty
//! store: dropping credentials silently would look like a spontaneous logout.

use std::collections::BTreeMap;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand::RngExt;
use tracing::debug;

use crate::error::{Error, Result};
use crate::fsutil::write_private;
use crate::keys::EncryptionKey;
use crate::record::TokenRecord;

/// Site name to credential bundle.
pub type TokenMap = BTreeMap<String, TokenRecord>;

const HEADER: &str = "erpnext-tokens:v1:";
const NONCE_LEN: usize = 12;

/// Read and decrypt the store. A missing file is an empty store.
pub async fn load(path: &Path, key: &EncryptionKey) -> Result<TokenMap> {
    let contents = match tokio::fs::read(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "token store not found, starting empty");
            return Ok(TokenMap::new());
        }
        Err(e) => return Err(Error::Io(format!("reading {}: {e}", path.display()))),
    };
    let tokens = open(&contents, key)?;
    debug!(path = %path.display(), sites = tokens.len(), "loaded token store");
    Ok(tokens)
}

/// Encrypt and atomically replace the store, resetting mode 0600.
pub async fn save(path: &Path, key: &EncryptionKey, tokens: &TokenMap) -> Result<()> {
    let sealed = seal(tokens, key)?;
    write_private(path, sealed.as_bytes()).await?;
    debug!(path = %path.display(), sites = tokens.len(), "saved token store");
    Ok(())
}

fn cipher(key: &EncryptionKey) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key.bytes())
        .map_err(|e| Error::KeyCorrupt(format!("unusable key: {e}")))
}

fn seal(tokens: &TokenMap, key: &EncryptionKey) -> Result<String> {
    let plaintext = serde_json::to_vec(tokens)
        .map_err(|e| Error::Io(format!("serializing token store: {e}")))?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce);
    let ciphertext = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|e| Error::Io(format!("encrypting token store: {e}")))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce);
    blob.extend_from_slice(&ciphertext);
    Ok(format!("{HEADER}{}\n", STANDARD.encode(blob)))
}

fn open(contents: &[u8], key: &EncryptionKey) -> Result<TokenMap> {
    let text = std::str::from_utf8(contents)
        .map_err(|_| Error::TokenStoreCorrupt("file is not text".into()))?;
    let encoded = text
        .trim()
        .strip_prefix(HEADER)
        .ok_or_else(|| Error::TokenStoreCorrupt("unrecognized file header".into()))?;
    let blob = STANDARD
        .decode(encoded)
        .map_err(|e| Error::TokenStoreCorrupt(format!("invalid base64: {e}")))?;
    if blob.len() <= NONCE_LEN {
        return Err(Error::TokenStoreCorrupt("file is truncated".into()));
    }

    let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
    let plaintext = cipher(key)?
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| {
            Error::TokenStoreCorrupt("authentication failed (wrong key or tampered file)".into())
        })?;
    serde_json::from_slice(&plaintext)
        .map_err(|e| Error::TokenStoreCorrupt(format!("decrypted payload is not a token map: {e}")))
}
