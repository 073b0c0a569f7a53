pub mod azure;
pub mod memory;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;

pub use self::azure::AzureBlobClient;
pub use self::memory::MemoryBlobClient;

/// Trait implemented by blob-store clients.
///
/// A client is bound to one container. It performs raw I/O only: no key
/// mapping, no error translation and no retries. Those belong to the
/// datastore built on top of it.
#[async_trait]
pub trait BlobClient: Send + Sync {
    /// Create the container. Fails with `ContainerAlreadyExists` if present.
    async fn create_container(&self) -> Result<(), BlobError>;

    /// Upload `data` as the complete content of `name` in one request.
    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BlobError>;

    /// Download the full content of `name`.
    async fn download(&self, name: &str) -> Result<Bytes, BlobError>;

    /// Fetch metadata of `name` without its content.
    async fn get_properties(&self, name: &str) -> Result<BlobProperties, BlobError>;

    /// Delete `name` together with its snapshots.
    async fn delete(&self, name: &str) -> Result<(), BlobError>;

    /// List one page of blobs. Pass the previous page's `next_marker` to
    /// continue; a page without a marker is the last one.
    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<BlobPage, BlobError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub content_length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobItem {
    pub name: String,
    pub content_length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobPage {
    pub items: Vec<BlobItem>,
    pub next_marker: Option<String>,
}

/// Error codes reported by the blob service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceCode {
    BlobNotFound,
    ContainerNotFound,
    ContainerAlreadyExists,
    AuthenticationFailed,
    Other(String),
}

impl ServiceCode {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceCode::BlobNotFound => "BlobNotFound",
            ServiceCode::ContainerNotFound => "ContainerNotFound",
            ServiceCode::ContainerAlreadyExists => "ContainerAlreadyExists",
            ServiceCode::AuthenticationFailed => "AuthenticationFailed",
            ServiceCode::Other(code) => code,
        }
    }
}

impl From<&str> for ServiceCode {
    fn from(code: &str) -> Self {
        match code {
            "BlobNotFound" => ServiceCode::BlobNotFound,
            "ContainerNotFound" => ServiceCode::ContainerNotFound,
            "ContainerAlreadyExists" => ServiceCode::ContainerAlreadyExists,
            "AuthenticationFailed" => ServiceCode::AuthenticationFailed,
            other => ServiceCode::Other(other.to_string()),
        }
    }
}

impl fmt::Display for ServiceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Blob service error: HTTP {status} {code} - {message}")]
    Service {
        status: u16,
        code: ServiceCode,
        message: String,
    },
    #[error("Malformed blob service response: {0}")]
    Protocol(String),
    #[error("Invalid storage credential: {0}")]
    Credential(String),
}

impl BlobError {
    pub fn service_code(&self) -> Option<&ServiceCode> {
        match self {
            BlobError::Service { code, .. } => Some(code),
            _ => None,
        }
    }
}
