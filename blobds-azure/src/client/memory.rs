//! In-process blob backend.
//!
//! Behaves like a single blob container held in memory, including paged
//! listings with continuation markers and the service's error codes. Used
//! for tests and local development, with hooks to inject failures.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use super::{BlobClient, BlobError, BlobItem, BlobPage, BlobProperties, ServiceCode};

const DEFAULT_PAGE_SIZE: usize = 5000;

pub struct MemoryBlobClient {
    blobs: Mutex<BTreeMap<String, Bytes>>,
    container_exists: AtomicBool,
    page_size: usize,
    failing_downloads: Mutex<HashSet<String>>,
    failing_names: Mutex<HashSet<String>>,
    create_failure: Mutex<Option<ServiceCode>>,
    downloads: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for MemoryBlobClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobClient {
    pub fn new() -> Self {
        Self {
            blobs: Mutex::new(BTreeMap::new()),
            container_exists: AtomicBool::new(false),
            page_size: DEFAULT_PAGE_SIZE,
            failing_downloads: Mutex::new(HashSet::new()),
            failing_names: Mutex::new(HashSet::new()),
            create_failure: Mutex::new(None),
            downloads: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    /// Cap listing pages at `page_size` items regardless of the caller's
    /// `max_results`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Start with the container already present.
    pub fn with_existing_container(self) -> Self {
        self.container_exists.store(true, Ordering::SeqCst);
        self
    }

    /// Make every download of `name` fail with a server error.
    pub fn fail_downloads_of(&self, name: &str) {
        lock(&self.failing_downloads).insert(name.to_string());
    }

    /// Make every request naming `name` fail with a server error, including
    /// uploads, property lookups and deletes.
    pub fn fail_requests_of(&self, name: &str) {
        lock(&self.failing_names).insert(name.to_string());
    }

    fn check_failure(&self, name: &str) -> Result<(), BlobError> {
        if lock(&self.failing_names).contains(name) {
            return Err(internal_error());
        }
        Ok(())
    }

    /// Make the next container creation fail with `code`.
    pub fn fail_create_with(&self, code: ServiceCode) {
        *lock(&self.create_failure) = Some(code);
    }

    /// Number of download calls served so far, failed ones included.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    pub fn list_call_count(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn contains(&self, name: &str) -> bool {
        lock(&self.blobs).contains_key(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn service_error(status: u16, code: ServiceCode) -> BlobError {
    let message = format!("{} (in-memory backend)", code);
    BlobError::Service {
        status,
        code,
        message,
    }
}

fn internal_error() -> BlobError {
    service_error(500, ServiceCode::Other("InternalError".to_string()))
}

fn blob_not_found() -> BlobError {
    service_error(404, ServiceCode::BlobNotFound)
}

#[async_trait]
impl BlobClient for MemoryBlobClient {
    async fn create_container(&self) -> Result<(), BlobError> {
        if let Some(code) = lock(&self.create_failure).take() {
            let status = match code {
                ServiceCode::AuthenticationFailed => 403,
                _ => 500,
            };
            return Err(service_error(status, code));
        }
        if self.container_exists.swap(true, Ordering::SeqCst) {
            return Err(service_error(409, ServiceCode::ContainerAlreadyExists));
        }
        debug!("Created in-memory container");
        Ok(())
    }

    async fn upload(&self, name: &str, data: Bytes) -> Result<(), BlobError> {
        self.check_failure(name)?;
        lock(&self.blobs).insert(name.to_string(), data);
        Ok(())
    }

    async fn download(&self, name: &str) -> Result<Bytes, BlobError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.check_failure(name)?;
        if lock(&self.failing_downloads).contains(name) {
            return Err(internal_error());
        }
        lock(&self.blobs).get(name).cloned().ok_or_else(blob_not_found)
    }

    async fn get_properties(&self, name: &str) -> Result<BlobProperties, BlobError> {
        self.check_failure(name)?;
        lock(&self.blobs)
            .get(name)
            .map(|data| BlobProperties {
                content_length: data.len() as u64,
            })
            .ok_or_else(blob_not_found)
    }

    async fn delete(&self, name: &str) -> Result<(), BlobError> {
        self.check_failure(name)?;
        lock(&self.blobs)
            .remove(name)
            .map(|_| ())
            .ok_or_else(blob_not_found)
    }

    async fn list_blobs(
        &self,
        prefix: Option<&str>,
        marker: Option<&str>,
        max_results: Option<u32>,
    ) -> Result<BlobPage, BlobError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let limit = max_results
            .map(|m| (m as usize).clamp(1, self.page_size))
            .unwrap_or(self.page_size);
        let prefix = prefix.unwrap_or("");
        let start = marker.unwrap_or(prefix).to_string();

        let blobs = lock(&self.blobs);
        let mut matching = blobs
            .range(start..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| BlobItem {
                name: name.clone(),
                content_length: data.len() as u64,
            });

        let items: Vec<BlobItem> = matching.by_ref().take(limit).collect();
        // The marker is the first name of the next page.
        let next_marker = matching.next().map(|item| item.name);
        Ok(BlobPage { items, next_marker })
    }
}
