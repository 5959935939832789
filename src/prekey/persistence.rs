//! Encrypted on-disk persistence for pre-key bundles
//!
//! Each peer's bundle is serialized deterministically, sealed with AES-256-GCM
//! under a key derived by SHA-256 of the owner's key material, and written to
//! a file named by the peer's public key. A bundle that fails to load for any
//! reason is treated as absent so the caller regenerates it; unavailability is
//! preferred over corrupted state.

use std::path::{Path, PathBuf};

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};

use crate::crypto;
use crate::error::{Error, Result};
use crate::prekey::PreKeyBundle;
use crate::protocol::PeerId;

const BUNDLE_EXTENSION: &str = "bundle";
const NONCE_SIZE: usize = 12;

/// Persists one bundle file per peer under a private directory
pub struct PreKeyPersistence {
    dir: PathBuf,
    cipher_key: [u8; 32],
}

impl PreKeyPersistence {
    /// Create the storage directory (restrictive permissions) and derive the
    /// file-encryption key from the owner's key material.
    pub fn new(dir: impl AsRef<Path>, key_material: &[u8]) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(0o700))?;
        }

        Ok(Self {
            dir,
            cipher_key: crypto::sha256(key_material),
        })
    }

    fn path_for(&self, peer_pk: &PeerId) -> PathBuf {
        self.dir
            .join(format!("{}.{}", hex::encode(peer_pk), BUNDLE_EXTENSION))
    }

    /// Encrypt and write a bundle, replacing any previous file
    pub async fn save(&self, bundle: &PreKeyBundle) -> Result<()> {
        let plaintext = bincode::serialize(bundle)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.cipher_key));
        let nonce_bytes = crypto::random::random_nonce_12();
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_slice())
            .map_err(|_| Error::Persistence("bundle encryption failed".into()))?;

        let mut file_data = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        file_data.extend_from_slice(&nonce_bytes);
        file_data.extend_from_slice(&ciphertext);

        let path = self.path_for(&bundle.peer_pk);
        tokio::fs::write(&path, file_data).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Load and decrypt one peer's bundle. Returns `None` when the file is
    /// missing, unreadable, or fails authentication.
    pub async fn load(&self, peer_pk: &PeerId) -> Option<PreKeyBundle> {
        let path = self.path_for(peer_pk);
        let file_data = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("failed to read bundle file {:?}: {}", path, e);
                return None;
            }
        };

        if file_data.len() <= NONCE_SIZE {
            log::warn!("bundle file {:?} truncated, regenerating", path);
            return None;
        }

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.cipher_key));
        let plaintext = match cipher.decrypt(
            Nonce::from_slice(&file_data[..NONCE_SIZE]),
            &file_data[NONCE_SIZE..],
        ) {
            Ok(pt) => pt,
            Err(_) => {
                log::warn!("bundle file {:?} failed authentication, regenerating", path);
                return None;
            }
        };

        match bincode::deserialize(&plaintext) {
            Ok(bundle) => Some(bundle),
            Err(e) => {
                log::warn!("bundle file {:?} corrupt ({}), regenerating", path, e);
                None
            }
        }
    }

    /// Load every readable bundle in the directory
    pub async fn load_all(&self) -> Vec<PreKeyBundle> {
        let mut bundles = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("cannot scan bundle directory {:?}: {}", self.dir, e);
                return bundles;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let stem = match path.file_stem().and_then(|s| s.to_str()) {
                Some(stem) => stem,
                None => continue,
            };
            if path.extension().and_then(|e| e.to_str()) != Some(BUNDLE_EXTENSION) {
                continue;
            }
            let peer_pk = match hex::decode(stem)
                .ok()
                .and_then(|bytes| <PeerId>::try_from(bytes.as_slice()).ok())
            {
                Some(pk) => pk,
                None => continue,
            };
            if let Some(bundle) = self.load(&peer_pk).await {
                bundles.push(bundle);
            }
        }
        bundles
    }

    /// Delete a peer's bundle file
    pub async fn remove(&self, peer_pk: &PeerId) -> Result<()> {
        match tokio::fs::remove_file(self.path_for(peer_pk)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
