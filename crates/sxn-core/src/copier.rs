//! File copying and symlinking with mode control and optional at-rest encryption.

use std::fs;
use std::os::unix::fs::{symlink, PermissionsExt};
use std::path::{Path, PathBuf};

use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::path_validator::PathValidator;

const DEFAULT_FILE_MODE: u32 = 0o644;
const SECRET_FILE_MODE: u32 = 0o600;
const PARENT_DIR_MODE: u32 = 0o755;
const NONCE_LEN: usize = 12;
const SCHEME_ID: &str = "aes-256-gcm-hkdf-sha256";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStrategy {
    Copy,
    Symlink,
}

/// Prior state of the destination, recorded before a copy so the rule can undo it.
#[derive(Debug, Clone)]
pub enum PriorState {
    Absent,
    Existing { content: Vec<u8>, mode: u32 },
}

#[derive(Debug, Clone)]
pub struct CopyOutcome {
    pub destination: PathBuf,
    pub strategy: CopyStrategy,
    pub mode_applied: Option<u32>,
    pub encrypted: bool,
    pub scheme: Option<String>,
    pub nonce: Option<[u8; NONCE_LEN]>,
    pub prior_state: PriorState,
    pub skipped: bool,
}

pub struct CopyRequest<'a> {
    pub source: &'a Path,
    pub destination: &'a Path,
    pub strategy: CopyStrategy,
    pub mode: Option<u32>,
    pub encrypt: bool,
    pub required: bool,
}

fn looks_like_secret(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .is_some_and(|name| name.ends_with(".key") || name.starts_with(".env"))
}

fn derive_key(master_key: &[u8; 32], session_salt: &[u8]) -> [u8; 32] {
    let hk = Hkdf::<Sha256>::new(Some(session_salt), master_key);
    let mut key = [0_u8; 32];
    hk.expand(b"sxn-copy-encrypt", &mut key)
        .expect("32 bytes is a valid HKDF output length");
    key
}

pub struct FileCopier {
    validator: PathValidator,
}

impl Default for FileCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCopier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            validator: PathValidator::default(),
        }
    }

    fn capture_prior(destination: &Path) -> Result<PriorState> {
        if !destination.exists() {
            return Ok(PriorState::Absent);
        }
        let content = fs::read(destination).map_err(Error::Io)?;
        let mode = fs::metadata(destination)
            .map_err(Error::Io)?
            .permissions()
            .mode();
        Ok(PriorState::Existing { content, mode })
    }

    /// Perform one copy/symlink operation under `session_root`.
    ///
    /// `master_key` is required only when `request.encrypt` is set.
    pub fn copy(
        &self,
        session_root: &Path,
        request: &CopyRequest<'_>,
        master_key: Option<&[u8; 32]>,
        session_salt: &[u8],
    ) -> Result<CopyOutcome> {
        if !request.source.exists() {
            if request.required {
                return Err(Error::SourceMissing {
                    path: request.source.to_path_buf(),
                });
            }
            return Ok(CopyOutcome {
                destination: request.destination.to_path_buf(),
                strategy: request.strategy,
                mode_applied: None,
                encrypted: false,
                scheme: None,
                nonce: None,
                prior_state: PriorState::Absent,
                skipped: true,
            });
        }

        let destination = self.validator.validate(session_root, request.destination)?;
        let prior = Self::capture_prior(&destination)?;

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(Error::Io)?;
            fs::set_permissions(parent, fs::Permissions::from_mode(PARENT_DIR_MODE))
                .map_err(Error::Io)?;
        }

        let mut nonce_bytes = None;
        let mut encrypted = false;
        let mut scheme = None;

        match request.strategy {
            CopyStrategy::Symlink => {
                if destination.exists() || destination.symlink_metadata().is_ok() {
                    fs::remove_file(&destination).map_err(Error::Io)?;
                }
                symlink(request.source, &destination).map_err(Error::Io)?;
            }
            CopyStrategy::Copy => {
                let bytes = fs::read(request.source).map_err(Error::Io)?;
                if request.encrypt {
                    let key_bytes = master_key.ok_or_else(|| Error::Validation {
                        message: "encrypt:true requires a master key".into(),
                    })?;
                    let key = derive_key(key_bytes, session_salt);
                    let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Validation {
                        message: format!("invalid derived key: {e}"),
                    })?;
                    let mut nonce = [0_u8; NONCE_LEN];
                    OsRng.fill_bytes(&mut nonce);
                    let ciphertext = cipher
                        .encrypt(Nonce::from_slice(&nonce), bytes.as_ref())
                        .map_err(|e| Error::Validation {
                            message: format!("encryption failed: {e}"),
                        })?;
                    let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
                    payload.extend_from_slice(&nonce);
                    payload.extend_from_slice(&ciphertext);
                    fs::write(&destination, payload).map_err(Error::Io)?;
                    nonce_bytes = Some(nonce);
                    encrypted = true;
                    scheme = Some(SCHEME_ID.to_string());
                } else {
                    fs::write(&destination, &bytes).map_err(Error::Io)?;
                }
            }
        }

        let mode = request.mode.unwrap_or_else(|| {
            if looks_like_secret(&destination) {
                SECRET_FILE_MODE
            } else {
                DEFAULT_FILE_MODE
            }
        });
        if matches!(request.strategy, CopyStrategy::Copy) {
            fs::set_permissions(&destination, fs::Permissions::from_mode(mode)).map_err(Error::Io)?;
        }

        Ok(CopyOutcome {
            destination,
            strategy: request.strategy,
            mode_applied: matches!(request.strategy, CopyStrategy::Copy).then_some(mode),
            encrypted,
            scheme,
            nonce: nonce_bytes,
            prior_state: prior,
            skipped: false,
        })
    }

    /// Undo a copy using the recorded prior state.
    pub fn rollback(&self, outcome: &CopyOutcome) -> Result<()> {
        if outcome.skipped {
            return Ok(());
        }
        match &outcome.prior_state {
            PriorState::Absent => {
                if outcome.destination.exists() || outcome.destination.symlink_metadata().is_ok() {
                    fs::remove_file(&outcome.destination).map_err(Error::Io)?;
                }
            }
            PriorState::Existing { content, mode } => {
                fs::write(&outcome.destination, content).map_err(Error::Io)?;
                fs::set_permissions(&outcome.destination, fs::Permissions::from_mode(*mode))
                    .map_err(Error::Io)?;
            }
        }
        Ok(())
    }

    /// Decrypt a payload written with `encrypt:true`, given the same master key
    /// and session salt used at encryption time.
    pub fn decrypt(
        &self,
        ciphertext_with_nonce: &[u8],
        master_key: &[u8; 32],
        session_salt: &[u8],
    ) -> Result<Vec<u8>> {
        if ciphertext_with_nonce.len() < NONCE_LEN {
            return Err(Error::Validation {
                message: "ciphertext shorter than nonce".into(),
            });
        }
        let (nonce, ciphertext) = ciphertext_with_nonce.split_at(NONCE_LEN);
        let key = derive_key(master_key, session_salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| Error::Validation {
            message: format!("invalid derived key: {e}"),
        })?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|e| Error::Validation {
                message: format!("decryption failed: {e}"),
            })
    }
}
