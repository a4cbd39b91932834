//! Encrypted file backend.
//!
//! The whole store snapshot is serialized with postcard and sealed with
//! AES-256-GCM under a PBKDF2-HMAC-SHA256 key derived from a passphrase.
//! Every commit rewrites the file through a temporary sibling that is renamed
//! into place, so readers only ever see a complete snapshot.

use std::fs;
use std::io::Write;
use std::num::NonZeroU32;
use std::path::PathBuf;

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::pbkdf2;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::backend::StorageBackend;
use crate::collections::Collections;
use crate::error::StoreError;

const MAGIC: &[u8; 4] = b"ODST"; // "OlmDev STore"
const VERSION: u8 = 0x01;
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const HEADER_LEN: usize = 4 + 1 + SALT_LEN + NONCE_LEN + 4; // 53 bytes

pub const DEFAULT_PBKDF2_ITERATIONS: u32 = 600_000;

/// Derive a 256-bit AES-GCM key from passphrase and salt.
fn derive_key(
    passphrase: &str,
    salt: &[u8; SALT_LEN],
    iterations: NonZeroU32,
) -> Result<LessSafeKey, StoreError> {
    let mut key_bytes = Zeroizing::new([0u8; 32]);
    pbkdf2::derive(
        pbkdf2::PBKDF2_HMAC_SHA256,
        iterations,
        salt,
        passphrase.as_bytes(),
        &mut key_bytes[..],
    );
    let unbound =
        UnboundKey::new(&AES_256_GCM, &key_bytes[..]).map_err(|_| StoreError::Encrypt)?;
    Ok(LessSafeKey::new(unbound))
}

fn aad() -> [u8; 5] {
    let mut aad_bytes = [0u8; 5];
    aad_bytes[..4].copy_from_slice(MAGIC);
    aad_bytes[4] = VERSION;
    aad_bytes
}

/// Check if file data starts with a valid store header.
pub fn has_valid_header(file_data: &[u8]) -> bool {
    file_data.len() >= HEADER_LEN && &file_data[0..4] == MAGIC && file_data[4] == VERSION
}

/// Store snapshot kept in a single encrypted file.
///
/// The key is derived once when the backend is opened. The salt is read from
/// an existing file or freshly generated for a new one.
pub struct EncryptedFileBackend {
    path: PathBuf,
    salt: [u8; SALT_LEN],
    key: LessSafeKey,
    rng: SystemRandom,
}

impl EncryptedFileBackend {
    pub fn open(path: impl Into<PathBuf>, passphrase: &str) -> Result<Self, StoreError> {
        Self::open_with_iterations(path, passphrase, DEFAULT_PBKDF2_ITERATIONS)
    }

    pub fn open_with_iterations(
        path: impl Into<PathBuf>,
        passphrase: &str,
        iterations: u32,
    ) -> Result<Self, StoreError> {
        let path = path.into();
        let iterations = NonZeroU32::new(iterations)
            .ok_or(StoreError::Format("PBKDF2 iterations must be non-zero"))?;
        let rng = SystemRandom::new();

        let salt = match fs::read(&path) {
            Ok(file_data) => {
                if !has_valid_header(&file_data) {
                    return Err(StoreError::Format("expected ODST header"));
                }
                let mut salt = [0u8; SALT_LEN];
                salt.copy_from_slice(&file_data[5..5 + SALT_LEN]);
                salt
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let mut salt = [0u8; SALT_LEN];
                rng.fill(&mut salt).map_err(|_| StoreError::Rng)?;
                info!(path = %path.display(), "creating new store file");
                salt
            }
            Err(e) => return Err(e.into()),
        };

        let key = derive_key(passphrase, &salt, iterations)?;
        Ok(Self {
            path,
            salt,
            key,
            rng,
        })
    }

    /// File format: [ODST magic(4)] [version(1)] [salt(32)] [nonce(12)] [length(4)] [encrypted payload + tag(16)]
    fn encrypt(&self, data: &Collections) -> Result<Vec<u8>, StoreError> {
        let mut in_out = postcard::to_allocvec(data)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng
            .fill(&mut nonce_bytes)
            .map_err(|_| StoreError::Rng)?;
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        self.key
            .seal_in_place_append_tag(nonce, Aad::from(&aad()), &mut in_out)
            .map_err(|_| StoreError::Encrypt)?;

        let payload_len = u32::try_from(in_out.len())
            .map_err(|_| StoreError::Format("store snapshot too large"))?;
        let mut file_data = Vec::with_capacity(HEADER_LEN + in_out.len());
        file_data.extend_from_slice(MAGIC);
        file_data.push(VERSION);
        file_data.extend_from_slice(&self.salt);
        file_data.extend_from_slice(&nonce_bytes);
        file_data.extend_from_slice(&payload_len.to_be_bytes());
        file_data.extend_from_slice(&in_out);

        Ok(file_data)
    }

    fn decrypt(&self, file_data: &[u8]) -> Result<Collections, StoreError> {
        if !has_valid_header(file_data) {
            return Err(StoreError::Format("expected ODST header"));
        }

        let mut nonce_bytes = [0u8; NONCE_LEN];
        nonce_bytes.copy_from_slice(&file_data[37..37 + NONCE_LEN]);

        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&file_data[49..53]);
        let payload_len = u32::from_be_bytes(len_bytes) as usize;

        if file_data.len() < HEADER_LEN + payload_len {
            return Err(StoreError::Format("file truncated"));
        }

        let mut ciphertext = file_data[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        let nonce = Nonce::assume_unique_for_key(nonce_bytes);

        let plaintext = self
            .key
            .open_in_place(nonce, Aad::from(&aad()), &mut ciphertext)
            .map_err(|_| StoreError::Decrypt)?;

        Ok(postcard::from_bytes(plaintext)?)
    }
}

impl StorageBackend for EncryptedFileBackend {
    fn load(&self) -> Result<Option<Collections>, StoreError> {
        match fs::read(&self.path) {
            Ok(file_data) => self.decrypt(&file_data).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn persist(&self, data: &Collections) -> Result<(), StoreError> {
        let file_data = self.encrypt(data)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let mut file = fs::File::create(&tmp_path)?;
            file.write_all(&file_data)?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        debug!(path = %self.path.display(), bytes = file_data.len(), "store persisted");
        Ok(())
    }
}
