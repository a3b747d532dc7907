use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

const MAX_EXTENSION_LEN: usize = 10;

/// Resolve `file_ref` under `base`, refusing anything that could escape it.
fn resolve_within(base: &Path, file_ref: &str) -> Result<PathBuf, ServerError> {
    let mut components = Path::new(file_ref).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(base.join(name)),
        _ => Err(ServerError::BadRequest("Path traversal detected".to_string())),
    }
}

/// Keep a short alphanumeric extension from the client's file name so the
/// stored file is served with a recognisable suffix.
fn sanitized_extension(original_name: &str) -> Option<String> {
    let ext = Path::new(original_name).extension()?.to_str()?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// A file accepted by [`UploadStore::store`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredUpload {
    pub file_ref: String,
    pub file_name: String,
    pub file_size: usize,
}

/// Flat directory of uploaded chat attachments and avatars, addressed by a
/// server-generated reference.
#[derive(Debug, Clone)]
pub struct UploadStore {
    base_path: PathBuf,
    max_size: usize,
}

impl UploadStore {
    pub async fn new(base_path: PathBuf, max_size: usize) -> Result<Self, ServerError> {
        fs::create_dir_all(&base_path).await.map_err(|e| {
            ServerError::UploadStorage(format!(
                "Failed to create upload directory '{}': {}",
                base_path.display(),
                e
            ))
        })?;

        info!(path = %base_path.display(), "Upload store initialized");

        Ok(Self {
            base_path,
            max_size,
        })
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub async fn store(&self, data: &[u8], original_name: &str) -> Result<StoredUpload, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty upload".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::UploadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let file_ref = match sanitized_extension(original_name) {
            Some(ext) => format!("{}.{}", Uuid::new_v4(), ext),
            None => Uuid::new_v4().to_string(),
        };
        let path = resolve_within(&self.base_path, &file_ref)?;

        fs::write(&path, data).await.map_err(|e| {
            ServerError::UploadStorage(format!("Failed to write upload {}: {}", file_ref, e))
        })?;

        debug!(file_ref = %file_ref, size = data.len(), "Stored upload");
        Ok(StoredUpload {
            file_ref,
            file_name: original_name.to_string(),
            file_size: data.len(),
        })
    }

    pub async fn get(&self, file_ref: &str) -> Result<Vec<u8>, ServerError> {
        let path = resolve_within(&self.base_path, file_ref)?;

        match fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(ServerError::NotFound(format!("upload {file_ref}")))
            }
            Err(e) => Err(ServerError::UploadStorage(format!(
                "Failed to read upload {}: {}",
                file_ref, e
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_store() -> (UploadStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf(), 1024).await.unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (store, _dir) = test_store().await;

        let stored = store.store(b"picture-bytes", "Holiday.JPG").await.unwrap();
        assert!(stored.file_ref.ends_with(".jpg"));
        assert_eq!(stored.file_name, "Holiday.JPG");
        assert_eq!(stored.file_size, 13);

        let data = store.get(&stored.file_ref).await.unwrap();
        assert_eq!(data, b"picture-bytes");
    }

    #[tokio::test]
    async fn test_odd_extensions_are_dropped() {
        let (store, _dir) = test_store().await;
        let stored = store.store(b"x", "archive.tar.g$z").await.unwrap();
        assert!(!stored.file_ref.contains('.'));
        let stored = store.store(b"x", "noext").await.unwrap();
        assert!(Uuid::parse_str(&stored.file_ref).is_ok());
    }

    #[tokio::test]
    async fn test_traversal_rejected() {
        let (store, _dir) = test_store().await;
        for bad in ["../secret", "a/b", "/etc/passwd", "..", ""] {
            assert!(
                matches!(store.get(bad).await, Err(ServerError::BadRequest(_))),
                "{bad} accepted"
            );
        }
    }

    #[tokio::test]
    async fn test_limits() {
        let (store, _dir) = test_store().await;
        assert!(matches!(
            store.store(b"", "empty.txt").await,
            Err(ServerError::BadRequest(_))
        ));
        assert!(matches!(
            store.store(&[0u8; 2048], "big.bin").await,
            Err(ServerError::UploadTooLarge { size: 2048, max: 1024 })
        ));
        assert!(matches!(
            store.get("missing").await,
            Err(ServerError::NotFound(_))
        ));
    }
}
