//! # Session Vault
//!
//! Encrypted-at-rest storage for the one [`AuthSession`] of the signed-in
//! identity. The session never touches the durable store used for the queue
//! and cache.
//!
//! ## File Format
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  session.json                                                           │
//! │  {                                                                      │
//! │    "version": 1,                                                        │
//! │    "nonce": "<24 hex chars>",          ← random 96-bit nonce            │
//! │    "ciphertext": "<hex>"               ← AES-256-GCM(session JSON)      │
//! │  }                                                                      │
//! │                                                                         │
//! │  file key = HKDF-SHA256(                                               │
//! │      salt = master_key[..16],                                          │
//! │      ikm  = master_key,                                                │
//! │      info = "tether-session-v1" || nonce)                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Writes go to a sibling temp file which is then renamed over the target.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{SyncError, SyncResult};
use tether_core::AuthSession;

/// AES-256 key size in bytes.
pub const KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const NONCE_SIZE: usize = 12;

const ENVELOPE_VERSION: u32 = 1;
const KEY_INFO: &[u8] = b"tether-session-v1";

// =============================================================================
// Session Store Trait
// =============================================================================

/// Where the auth pipeline keeps the session between runs.
pub trait SessionStore: Send + Sync {
    fn load(&self) -> SyncResult<Option<AuthSession>>;
    fn save(&self, session: &AuthSession) -> SyncResult<()>;
    fn clear(&self) -> SyncResult<()>;
}

// =============================================================================
// Encrypted File Vault
// =============================================================================

#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u32,
    nonce: String,
    ciphertext: String,
}

/// Session store backed by one AES-256-GCM encrypted file.
pub struct EncryptedFileVault {
    path: PathBuf,
    master_key: [u8; KEY_SIZE],
}

impl std::fmt::Debug for EncryptedFileVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFileVault")
            .field("path", &self.path)
            .field("master_key", &"<redacted>")
            .finish()
    }
}

impl EncryptedFileVault {
    pub fn new(path: impl Into<PathBuf>, master_key: [u8; KEY_SIZE]) -> Self {
        EncryptedFileVault {
            path: path.into(),
            master_key,
        }
    }

    /// Builds a vault from a 64-character hex key.
    pub fn from_hex_key(path: impl Into<PathBuf>, hex_key: &str) -> SyncResult<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| SyncError::CryptoFailure(format!("invalid session key: {}", e)))?;

        let master_key: [u8; KEY_SIZE] = bytes.try_into().map_err(|_| {
            SyncError::CryptoFailure(format!(
                "session key must be {} hex characters",
                KEY_SIZE * 2
            ))
        })?;

        Ok(Self::new(path, master_key))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn derive_key(&self, nonce: &[u8; NONCE_SIZE]) -> SyncResult<[u8; KEY_SIZE]> {
        let salt = &self.master_key[..16];

        let mut info = Vec::with_capacity(KEY_INFO.len() + NONCE_SIZE);
        info.extend_from_slice(KEY_INFO);
        info.extend_from_slice(nonce);

        let hk = Hkdf::<Sha256>::new(Some(salt), &self.master_key);
        let mut output = [0u8; KEY_SIZE];
        hk.expand(&info, &mut output)
            .map_err(|_| SyncError::CryptoFailure("HKDF expand failed".into()))?;

        Ok(output)
    }

    fn seal(&self, plaintext: &[u8]) -> SyncResult<Envelope> {
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(&nonce)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SyncError::CryptoFailure(format!("failed to create cipher: {}", e)))?;

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| SyncError::CryptoFailure(format!("encryption failed: {}", e)))?;

        Ok(Envelope {
            version: ENVELOPE_VERSION,
            nonce: hex::encode(nonce),
            ciphertext: hex::encode(ciphertext),
        })
    }

    fn open(&self, envelope: &Envelope) -> SyncResult<Vec<u8>> {
        if envelope.version != ENVELOPE_VERSION {
            return Err(SyncError::CryptoFailure(format!(
                "unsupported vault version {}",
                envelope.version
            )));
        }

        let nonce: [u8; NONCE_SIZE] = hex::decode(&envelope.nonce)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| SyncError::CryptoFailure("malformed nonce".into()))?;
        let ciphertext = hex::decode(&envelope.ciphertext)
            .map_err(|e| SyncError::CryptoFailure(format!("malformed ciphertext: {}", e)))?;

        let key = self.derive_key(&nonce)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| SyncError::CryptoFailure(format!("failed to create cipher: {}", e)))?;

        cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| SyncError::CryptoFailure("decryption failed (wrong key or tampered file)".into()))
    }

    fn write_atomically(&self, contents: &[u8]) -> SyncResult<()> {
        let io_err = |e: std::io::Error| SyncError::CryptoFailure(format!("vault write failed: {}", e));

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, contents).map_err(io_err)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).map_err(io_err)?;
        }

        std::fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

impl SessionStore for EncryptedFileVault {
    fn load(&self) -> SyncResult<Option<AuthSession>> {
        let contents = match std::fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(SyncError::CryptoFailure(format!("vault read failed: {}", e))),
        };

        let envelope: Envelope = serde_json::from_slice(&contents)
            .map_err(|e| SyncError::CryptoFailure(format!("malformed vault file: {}", e)))?;
        let plaintext = self.open(&envelope)?;
        let session = serde_json::from_slice(&plaintext)?;

        debug!(path = %self.path.display(), "Session loaded from vault");
        Ok(Some(session))
    }

    fn save(&self, session: &AuthSession) -> SyncResult<()> {
        let plaintext = serde_json::to_vec(session)?;
        let envelope = self.seal(&plaintext)?;
        self.write_atomically(&serde_json::to_vec_pretty(&envelope)?)?;

        debug!(path = %self.path.display(), "Session saved to vault");
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                info!(path = %self.path.display(), "Session vault cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SyncError::CryptoFailure(format!("vault clear failed: {}", e))),
        }
    }
}

// =============================================================================
// Memory Vault
// =============================================================================

/// Keeps the session for the life of the process only.
///
/// Used when no session key is configured, and in tests.
#[derive(Default)]
pub struct MemoryVault {
    session: Mutex<Option<AuthSession>>,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<AuthSession>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl SessionStore for MemoryVault {
    fn load(&self) -> SyncResult<Option<AuthSession>> {
        Ok(self.slot().clone())
    }

    fn save(&self, session: &AuthSession) -> SyncResult<()> {
        *self.slot() = Some(session.clone());
        Ok(())
    }

    fn clear(&self) -> SyncResult<()> {
        *self.slot() = None;
        Ok(())
    }
}
