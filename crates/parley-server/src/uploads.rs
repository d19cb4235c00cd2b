//! Attachment storage on the local filesystem.
//!
//! Files land in `<base>/<uuid>/<sanitized name>` and are served back under
//! `/api/uploads/<uuid>/<name>`; that URL is what clients put in file and
//! audio message bodies.

use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target.strip_prefix(base).unwrap_or(target).components() {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".to_string()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".to_string()));
    }
    Ok(resolved)
}

/// Keep the last path segment and a conservative character set.
pub fn sanitize_file_name(raw: &str) -> String {
    let last = raw.rsplit(['/', '\\']).next().unwrap_or("");
    let cleaned: String = last
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

fn parse_upload_url(url: &str) -> Option<(Uuid, &str)> {
    let rest = url.strip_prefix("/api/uploads/")?;
    let (id, file_name) = rest.split_once('/')?;
    Some((id.parse().ok()?, file_name))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredUpload {
    pub id: Uuid,
    pub file_name: String,
    pub size: usize,
    pub file_url: String,
}

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

    pub async fn store(&self, file_name: &str, data: &[u8]) -> Result<StoredUpload, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty upload".to_string()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::UploadTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let id = Uuid::new_v4();
        let file_name = sanitize_file_name(file_name);
        let path = self.safe_path(id, &file_name)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).await.map_err(|e| {
                ServerError::UploadStorage(format!("Failed to create upload dir {id}: {e}"))
            })?;
        }
        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::UploadStorage(format!("Failed to write upload {id}: {e}")))?;

        debug!(id = %id, size = data.len(), "Stored upload");
        Ok(StoredUpload {
            id,
            file_url: format!("/api/uploads/{id}/{file_name}"),
            file_name,
            size: data.len(),
        })
    }

    pub async fn read(&self, id: Uuid, file_name: &str) -> Result<Vec<u8>, ServerError> {
        if file_name != sanitize_file_name(file_name) {
            return Err(ServerError::BadRequest("Invalid file name".to_string()));
        }
        let path = self.safe_path(id, file_name)?;

        if !path.exists() {
            return Err(ServerError::NotFound("Upload".to_string()));
        }

        fs::read(&path)
            .await
            .map_err(|e| ServerError::UploadStorage(format!("Failed to read upload {id}: {e}")))
    }

    /// Delete the upload behind a `/api/uploads/<uuid>/<name>` URL.
    /// Returns `false` for URLs that do not point into this store, such as
    /// an avatar hosted by the identity provider.
    pub async fn remove_by_url(&self, url: &str) -> Result<bool, ServerError> {
        let Some((id, file_name)) = parse_upload_url(url) else {
            return Ok(false);
        };
        if file_name != sanitize_file_name(file_name) {
            return Ok(false);
        }
        let path = self.safe_path(id, file_name)?;
        if !path.exists() {
            return Ok(false);
        }

        fs::remove_file(&path)
            .await
            .map_err(|e| ServerError::UploadStorage(format!("Failed to remove upload {id}: {e}")))?;
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir(dir).await;
        }
        debug!(id = %id, "Removed upload");
        Ok(true)
    }

    fn safe_path(&self, id: Uuid, file_name: &str) -> Result<PathBuf, ServerError> {
        let raw = self.base_path.join(id.to_string()).join(file_name);
        ensure_within(&self.base_path, &raw)
    }
}
