//! Datastore backed by a single blob container.
//!
//! Every key is stored as one blob whose name is the key string, unchanged.
//! CRUD calls map onto exactly one blob request each. Queries page through
//! the container listing and, unless keys-only, download values with
//! bounded concurrency.

use std::sync::Arc;

use async_trait::async_trait;
use blobds_common::{
    BasicBatch, Batch, Datastore, DatastoreError, Entry, Key, Query, QueryError, QueryResult,
    QueryResults,
};
use bytes::Bytes;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{AzureBlobClient, BlobClient, BlobError, BlobItem, ServiceCode};
use crate::config::AzureConfig;
use crate::errors::{is_service_code, translate};

/// Results buffered between the listing task and the consumer.
const RESULT_BUFFER: usize = 64;

#[derive(Debug, Clone)]
pub struct DatastoreOptions {
    /// Maximum value downloads in flight during a query. At least 1.
    pub fetch_concurrency: usize,
    /// Listing page size requested from the backend.
    pub page_size: Option<u32>,
}

impl Default for DatastoreOptions {
    fn default() -> Self {
        Self {
            fetch_concurrency: 16,
            page_size: None,
        }
    }
}

impl From<&AzureConfig> for DatastoreOptions {
    fn from(config: &AzureConfig) -> Self {
        Self {
            fetch_concurrency: config.fetch_concurrency,
            page_size: config.page_size,
        }
    }
}

pub struct BlobDatastore {
    client: Arc<dyn BlobClient>,
    options: DatastoreOptions,
}

/// Blob name for a key. Keys are used verbatim.
fn blob_name(key: &Key) -> &str {
    key.as_str()
}

/// Key for a listed blob name.
fn blob_key(name: String) -> Key {
    Key::new(name)
}

impl BlobDatastore {
    /// Connect to Azure Blob Storage and make sure the container exists.
    pub async fn connect(config: &AzureConfig) -> Result<Self, BlobError> {
        let client = AzureBlobClient::new(config)?;
        Self::open(Arc::new(client), DatastoreOptions::from(config)).await
    }

    /// Wrap an existing client, creating its container if it is missing.
    ///
    /// An already existing container is not an error. Any other failure,
    /// including rejected credentials, is returned as reported by the client.
    pub async fn open(
        client: Arc<dyn BlobClient>,
        options: DatastoreOptions,
    ) -> Result<Self, BlobError> {
        match client.create_container().await {
            Ok(()) => info!("Blob datastore container created"),
            Err(e) if is_service_code(&e, &ServiceCode::ContainerAlreadyExists) => {
                debug!("Blob datastore container already exists");
            }
            Err(e) => return Err(e),
        }
        let options = DatastoreOptions {
            fetch_concurrency: options.fetch_concurrency.max(1),
            ..options
        };
        Ok(Self { client, options })
    }

    /// Like `query`, but stops early once `cancel` fires. Dropping the
    /// returned results cancels as well. Must be called within a Tokio
    /// runtime.
    pub fn query_with_cancel(&self, query: Query, cancel: CancellationToken) -> QueryResults {
        let cancel = cancel.child_token();
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let listing = Listing {
            client: self.client.clone(),
            prefix: query.listing_prefix(),
            keys_only: query.keys_only,
            page_size: self.options.page_size,
            fetch_limit: Arc::new(Semaphore::new(self.options.fetch_concurrency)),
            tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(listing.run());
        QueryResults::new(query, rx, Some(cancel))
    }
}

#[async_trait]
impl Datastore for BlobDatastore {
    async fn put(&self, key: &Key, value: Bytes) -> Result<(), DatastoreError> {
        self.client
            .upload(blob_name(key), value)
            .await
            .map_err(DatastoreError::backend)?;
        debug!(key = %key, "Put complete");
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Bytes, DatastoreError> {
        self.client.download(blob_name(key)).await.map_err(translate)
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        match self.client.get_properties(blob_name(key)).await {
            Ok(_) => Ok(true),
            Err(e) if is_service_code(&e, &ServiceCode::BlobNotFound) => Ok(false),
            Err(e) => Err(DatastoreError::backend(e)),
        }
    }

    async fn get_size(&self, key: &Key) -> Result<u64, DatastoreError> {
        let props = self
            .client
            .get_properties(blob_name(key))
            .await
            .map_err(translate)?;
        Ok(props.content_length)
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        match self.client.delete(blob_name(key)).await {
            Ok(()) => Ok(()),
            Err(e) if is_service_code(&e, &ServiceCode::BlobNotFound) => {
                debug!(key = %key, "Delete of absent key");
                Ok(())
            }
            Err(e) => Err(DatastoreError::backend(e)),
        }
    }

    async fn query(&self, query: Query) -> Result<QueryResults, DatastoreError> {
        Ok(self.query_with_cancel(query, CancellationToken::new()))
    }

    fn batch(&self) -> Result<Box<dyn Batch + '_>, DatastoreError> {
        Ok(Box::new(BasicBatch::new(self)))
    }

    async fn close(&self) -> Result<(), DatastoreError> {
        Ok(())
    }

    /// Blob storage has no cheap way to report container size.
    async fn disk_usage(&self) -> Result<u64, DatastoreError> {
        Err(DatastoreError::Unsupported("disk usage"))
    }
}

/// Producer side of a query: one task per query, holding the sender that
/// fetch tasks clone. Every page's fetches are joined before the next page
/// is listed, so the channel closes exactly once, after the last result has
/// been sent.
struct Listing {
    client: Arc<dyn BlobClient>,
    prefix: Option<String>,
    keys_only: bool,
    page_size: Option<u32>,
    fetch_limit: Arc<Semaphore>,
    tx: mpsc::Sender<QueryResult>,
    cancel: CancellationToken,
}

impl Listing {
    async fn run(self) {
        let mut marker: Option<String> = None;
        let mut pages = 0usize;
        loop {
            let listed = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("Query cancelled while listing");
                    return;
                }
                listed = self.client.list_blobs(
                    self.prefix.as_deref(),
                    marker.as_deref(),
                    self.page_size,
                ) => listed,
            };
            let page = match listed {
                Ok(page) => page,
                Err(e) => {
                    warn!(error = %e, "Blob listing failed");
                    let _ = self.tx.send(Err(QueryError::Listing(translate(e)))).await;
                    return;
                }
            };
            pages += 1;

            if !self.emit_page(page.items).await {
                return;
            }
            marker = page.next_marker;
            if marker.is_none() {
                break;
            }
        }
        debug!(pages, "Query listing complete");
    }

    /// Emit every item of one page. Returns false if the query should stop.
    async fn emit_page(&self, items: Vec<BlobItem>) -> bool {
        if self.keys_only {
            for item in items {
                let entry = Entry {
                    key: blob_key(item.name),
                    value: None,
                    size: item.content_length,
                };
                let sent = tokio::select! {
                    _ = self.cancel.cancelled() => false,
                    sent = self.tx.send(Ok(entry)) => sent.is_ok(),
                };
                if !sent {
                    debug!("Keys-only query stopped mid-page");
                    return false;
                }
            }
            return true;
        }

        let mut fetches = JoinSet::new();
        for item in items {
            let permit = tokio::select! {
                _ = self.cancel.cancelled() => break,
                permit = self.fetch_limit.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let client = self.client.clone();
            let tx = self.tx.clone();
            let cancel = self.cancel.clone();
            fetches.spawn(async move {
                let _permit = permit;
                let key = blob_key(item.name);
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => return,
                    fetched = client.download(blob_name(&key)) => fetched,
                };
                let result = match fetched {
                    Ok(value) => Ok(Entry {
                        key,
                        value: Some(value),
                        size: item.content_length,
                    }),
                    Err(e) => {
                        warn!(key = %key, error = %e, "Value fetch failed");
                        Err(QueryError::Fetch {
                            key,
                            source: translate(e),
                        })
                    }
                };
                let _ = tx.send(result).await;
            });
        }

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    fetches.shutdown().await;
                    debug!("Query cancelled while fetching values");
                    return false;
                }
                joined = fetches.join_next() => match joined {
                    Some(Ok(())) => {}
                    Some(Err(e)) => warn!(error = %e, "Value fetch task failed"),
                    None => break,
                },
            }
        }
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}
