use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::Batch;
use crate::error::DatastoreError;
use crate::key::Key;
use crate::query::{Query, QueryResults};

/// Trait implemented by all key/value datastores.
///
/// Absence is a normal state, not a failure: `has` answers `false` and
/// `delete` succeeds for keys that were never written, while `get` and
/// `get_size` report `DatastoreError::NotFound`. Any other backend failure
/// is surfaced as `DatastoreError::Backend` without retries.
#[async_trait]
pub trait Datastore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    async fn put(&self, key: &Key, value: Bytes) -> Result<(), DatastoreError>;

    /// Fetch the full value stored under `key`.
    async fn get(&self, key: &Key) -> Result<Bytes, DatastoreError>;

    /// Whether a value exists under `key`. Must not fetch the value.
    async fn has(&self, key: &Key) -> Result<bool, DatastoreError>;

    /// Size in bytes of the value under `key`. Must not fetch the value.
    async fn get_size(&self, key: &Key) -> Result<u64, DatastoreError>;

    /// Remove `key`. Removing an absent key succeeds.
    async fn delete(&self, key: &Key) -> Result<(), DatastoreError>;

    /// Start a query. Entries arrive lazily through the returned results.
    async fn query(&self, query: Query) -> Result<QueryResults, DatastoreError>;

    /// Flush writes under `prefix` to durable storage.
    async fn sync(&self, _prefix: &Key) -> Result<(), DatastoreError> {
        Ok(())
    }

    /// Group puts and deletes to be applied together.
    fn batch(&self) -> Result<Box<dyn Batch + '_>, DatastoreError>;

    async fn close(&self) -> Result<(), DatastoreError>;

    /// Bytes used by the store, or `DatastoreError::Unsupported` when the
    /// backend cannot report it.
    async fn disk_usage(&self) -> Result<u64, DatastoreError>;
}
