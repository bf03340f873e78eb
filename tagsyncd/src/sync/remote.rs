use async_trait::async_trait;
use tagsync_core::{Delta, Download, FileMetadata, RemoteClient, RemoteError};

/// The remote operations a pass needs. Implementations own retry, backoff
/// and credential refresh; callers see either success or a terminal error.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<FileMetadata, RemoteError>;
    async fn download(&self, path: &str) -> Result<Download, RemoteError>;
    /// `false` when the path was already absent.
    async fn delete(&self, path: &str) -> Result<bool, RemoteError>;
    async fn list_delta(&self, base_path: &str, cursor: Option<&str>)
    -> Result<Delta, RemoteError>;
}

#[async_trait]
impl RemoteStore for RemoteClient {
    async fn upload(&self, path: &str, bytes: &[u8]) -> Result<FileMetadata, RemoteError> {
        RemoteClient::upload(self, path, bytes).await
    }

    async fn download(&self, path: &str) -> Result<Download, RemoteError> {
        RemoteClient::download(self, path).await
    }

    async fn delete(&self, path: &str) -> Result<bool, RemoteError> {
        RemoteClient::delete(self, path).await
    }

    async fn list_delta(
        &self,
        base_path: &str,
        cursor: Option<&str>,
    ) -> Result<Delta, RemoteError> {
        RemoteClient::list_delta(self, base_path, cursor).await
    }
}
