use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::key::Key;

#[async_trait]
pub trait Batch: Send {
    fn put(&mut self, key: Key, value: Bytes);

    fn delete(&mut self, key: Key);

    /// Apply every queued operation.
    async fn commit(self: Box<Self>) -> Result<(), DatastoreError>;
}

#[derive(Debug, Clone)]
pub enum BatchOp {
    Put { key: Key, value: Bytes },
    Delete { key: Key },
}

/// Batch that replays queued operations one by one against its datastore.
///
/// There is no atomicity: operations are applied in the order they were
/// queued and the commit stops at the first failure, leaving earlier
/// operations applied.
pub struct BasicBatch<'a> {
    datastore: &'a dyn Datastore,
    ops: Vec<BatchOp>,
}

impl<'a> BasicBatch<'a> {
    pub fn new(datastore: &'a dyn Datastore) -> Self {
        Self {
            datastore,
            ops: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[async_trait]
impl<'a> Batch for BasicBatch<'a> {
    fn put(&mut self, key: Key, value: Bytes) {
        self.ops.push(BatchOp::Put { key, value });
    }

    fn delete(&mut self, key: Key) {
        self.ops.push(BatchOp::Delete { key });
    }

    async fn commit(self: Box<Self>) -> Result<(), DatastoreError> {
        let BasicBatch { datastore, ops } = *self;
        let total = ops.len();
        for op in ops {
            match op {
                BatchOp::Put { key, value } => datastore.put(&key, value).await?,
                BatchOp::Delete { key } => datastore.delete(&key).await?,
            }
        }
        debug!(ops = total, "Batch committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::MapDatastore;
    use crate::query::{Query, QueryResults};

    /// Map datastore that refuses writes to one key.
    struct RejectingDatastore {
        inner: MapDatastore,
        rejected: Key,
    }

    #[async_trait]
    impl Datastore for RejectingDatastore {
        async fn put(&self, key: &Key, value: Bytes) -> Result<(), DatastoreError> {
            if *key == self.rejected {
                return Err(DatastoreError::Unsupported("writes to this key"));
            }
            self.inner.put(key, value).await
        }

        async fn get(&self, key: &Key) -> Result<Bytes, DatastoreError> {
            self.inner.get(key).await
        }

        async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
            self.inner.has(key).await
        }

        async fn get_size(&self, key: &Key) -> Result<u64, DatastoreError> {
            self.inner.get_size(key).await
        }

        async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
            self.inner.delete(key).await
        }

        async fn query(&self, query: Query) -> Result<QueryResults, DatastoreError> {
            self.inner.query(query).await
        }

        fn batch(&self) -> Result<Box<dyn Batch + '_>, DatastoreError> {
            Ok(Box::new(BasicBatch::new(self)))
        }

        async fn close(&self) -> Result<(), DatastoreError> {
            Ok(())
        }

        async fn disk_usage(&self) -> Result<u64, DatastoreError> {
            self.inner.disk_usage().await
        }
    }

    #[tokio::test]
    async fn test_batch_applies_in_queue_order() {
        let ds = MapDatastore::new();
        let mut batch = ds.batch().unwrap();
        batch.put(Key::new("/k"), Bytes::from("first"));
        batch.delete(Key::new("/k"));
        batch.put(Key::new("/k"), Bytes::from("last"));
        batch.put(Key::new("/other"), Bytes::from("x"));
        batch.commit().await.unwrap();

        assert_eq!(ds.get(&Key::new("/k")).await.unwrap(), Bytes::from("last"));
        assert!(ds.has(&Key::new("/other")).await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_stops_at_first_failure() {
        let ds = RejectingDatastore {
            inner: MapDatastore::new(),
            rejected: Key::new("/bad"),
        };
        let mut batch = ds.batch().unwrap();
        batch.put(Key::new("/before"), Bytes::from("1"));
        batch.put(Key::new("/bad"), Bytes::from("2"));
        batch.put(Key::new("/after"), Bytes::from("3"));

        let err = batch.commit().await.unwrap_err();
        assert!(matches!(err, DatastoreError::Unsupported(_)));
        assert!(ds.has(&Key::new("/before")).await.unwrap());
        assert!(!ds.has(&Key::new("/after")).await.unwrap());
    }

    #[tokio::test]
    async fn test_uncommitted_batch_has_no_effect() {
        let ds = MapDatastore::new();
        {
            let mut batch = BasicBatch::new(&ds);
            batch.put(Key::new("/k"), Bytes::from("v"));
            assert_eq!(batch.len(), 1);
        }
        assert!(!ds.has(&Key::new("/k")).await.unwrap());
    }
}
