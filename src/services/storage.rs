use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::core::config::Settings;

#[derive(Debug, Error)]
pub(crate) enum StorageFault {
    #[error("object not available")]
    Missing,
    #[error("storage key escapes the storage root")]
    PathEscape,
    #[error("size mismatch")]
    SizeMismatch,
    #[error("hash mismatch")]
    HashMismatch,
    #[error("object exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("read error: {0}")]
    Read(#[from] std::io::Error),
}

/// Uploaded submission bytes on the local filesystem.
#[derive(Debug, Clone)]
pub(crate) struct LocalStorage {
    root: PathBuf,
    max_bytes: u64,
}

impl LocalStorage {
    pub(crate) fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self { root: root.into(), max_bytes }
    }

    pub(crate) fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.storage().root, settings.storage().max_upload_bytes)
    }

    pub(crate) fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    /// Reads an object and checks it against the size and digest recorded at intake.
    pub(crate) async fn read_verified(
        &self,
        storage_key: &str,
        expected_size: Option<i64>,
        expected_sha256: Option<&str>,
    ) -> Result<Vec<u8>, StorageFault> {
        let path = self.resolve(storage_key)?;

        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => metadata,
            Ok(_) => return Err(StorageFault::Missing),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageFault::Missing)
            }
            Err(err) => return Err(StorageFault::Read(err)),
        };

        if metadata.len() > self.max_bytes {
            return Err(StorageFault::TooLarge { limit: self.max_bytes });
        }
        if let Some(expected) = expected_size {
            if u64::try_from(expected).ok() != Some(metadata.len()) {
                return Err(StorageFault::SizeMismatch);
            }
        }

        let bytes = tokio::fs::read(&path).await?;

        if let Some(expected) = expected_sha256.filter(|value| value.len() == 64) {
            let actual = hex::encode(Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(StorageFault::HashMismatch);
            }
        }

        Ok(bytes)
    }

    fn resolve(&self, storage_key: &str) -> Result<PathBuf, StorageFault> {
        let key = Path::new(storage_key.trim_start_matches('/'));
        if key.as_os_str().is_empty()
            || !key.components().all(|component| matches!(component, Component::Normal(_)))
        {
            return Err(StorageFault::PathEscape);
        }
        Ok(self.root.join(key))
    }
}
