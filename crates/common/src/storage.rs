//! Blob storage collaborator.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Uploads a local file and returns its public URL.
    async fn store_file(&self, path: &Path) -> Result<String>;
}

/// Dev storage: the "upload" is the local filesystem, the URL a file://
/// pointer to the canonicalized path.
pub struct LocalStorage;

#[async_trait]
impl Storage for LocalStorage {
    async fn store_file(&self, path: &Path) -> Result<String> {
        let absolute = tokio::fs::canonicalize(path)
            .await
            .with_context(|| format!("error resolving {}", path.display()))?;
        Ok(format!("file://{}", absolute.display()))
    }
}
