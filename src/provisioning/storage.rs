use crate::config::Settings;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

/// Mode for private key files (owner read/write only).
pub const PRIVATE_KEY_MODE: u32 = 0o600;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path} not found")]
    Missing { path: PathBuf },
    #[error("write {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// File names of a permanent certificate and key inside the secure directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCredentials {
    pub directory: PathBuf,
    pub certificate: String,
    pub private_key: String,
}

impl StoredCredentials {
    pub fn certificate_path(&self) -> PathBuf {
        self.directory.join(&self.certificate)
    }

    pub fn private_key_path(&self) -> PathBuf {
        self.directory.join(&self.private_key)
    }
}

/// The secure certificate directory.
#[derive(Debug, Clone)]
pub struct SecureStorage {
    root: PathBuf,
}

impl SecureStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Check that the directory and the claim certificate exist.
    pub fn ensure_claim(&self, settings: &Settings) -> Result<(), StorageError> {
        if !self.root.is_dir() {
            return Err(StorageError::Missing {
                path: self.root.clone(),
            });
        }
        let claim = self.path(&settings.claim_cert);
        if !claim.is_file() {
            return Err(StorageError::Missing { path: claim });
        }
        debug!(path = %claim.display(), "claim certificate present");
        Ok(())
    }

    /// Write `{prefix}-certificate.pem.crt` and `{prefix}-private.pem.key`.
    pub fn write_permanent(
        &self,
        prefix: &str,
        certificate_pem: &str,
        private_key_pem: &str,
    ) -> Result<StoredCredentials, StorageError> {
        let stored = StoredCredentials {
            directory: self.root.clone(),
            certificate: format!("{prefix}-certificate.pem.crt"),
            private_key: format!("{prefix}-private.pem.key"),
        };

        let cert_path = stored.certificate_path();
        fs::write(&cert_path, certificate_pem).map_err(|source| StorageError::Write {
            path: cert_path.clone(),
            source,
        })?;
        let key_path = stored.private_key_path();
        write_private(&key_path, private_key_pem.as_bytes()).map_err(|source| {
            StorageError::Write {
                path: key_path.clone(),
                source,
            }
        })?;

        info!(
            certificate = %cert_path.display(),
            key = %key_path.display(),
            "stored permanent credentials"
        );
        Ok(stored)
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(PRIVATE_KEY_MODE)
        .open(path)?;
    // mode() only applies on creation
    file.set_permissions(fs::Permissions::from_mode(PRIVATE_KEY_MODE))?;
    file.write_all(data)?;
    file.sync_all()
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()
}
