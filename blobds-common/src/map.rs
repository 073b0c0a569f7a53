use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use bytes::Bytes;

use crate::batch::{BasicBatch, Batch};
use crate::datastore::Datastore;
use crate::error::DatastoreError;
use crate::key::Key;
use crate::query::{Entry, Query, QueryResults};

/// In-memory datastore. Reference implementation of the `Datastore`
/// contract, used to validate the conformance suite itself.
#[derive(Default)]
pub struct MapDatastore {
    values: Mutex<BTreeMap<Key, Bytes>>,
}

impl MapDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<Key, Bytes>> {
        // A poisoned map is still structurally valid.
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Datastore for MapDatastore {
    async fn put(&self, key: &Key, value: Bytes) -> Result<(), DatastoreError> {
        self.lock().insert(key.clone(), value);
        Ok(())
    }

    async fn get(&self, key: &Key) -> Result<Bytes, DatastoreError> {
        self.lock().get(key).cloned().ok_or(DatastoreError::NotFound)
    }

    async fn has(&self, key: &Key) -> Result<bool, DatastoreError> {
        Ok(self.lock().contains_key(key))
    }

    async fn get_size(&self, key: &Key) -> Result<u64, DatastoreError> {
        self.lock()
            .get(key)
            .map(|v| v.len() as u64)
            .ok_or(DatastoreError::NotFound)
    }

    async fn delete(&self, key: &Key) -> Result<(), DatastoreError> {
        self.lock().remove(key);
        Ok(())
    }

    async fn query(&self, query: Query) -> Result<QueryResults, DatastoreError> {
        let entries = self
            .lock()
            .iter()
            .map(|(key, value)| Entry {
                key: key.clone(),
                value: (!query.keys_only).then(|| value.clone()),
                size: value.len() as u64,
            })
            .collect();
        Ok(QueryResults::from_entries(query, entries))
    }

    fn batch(&self) -> Result<Box<dyn Batch + '_>, DatastoreError> {
        Ok(Box::new(BasicBatch::new(self)))
    }

    async fn close(&self) -> Result<(), DatastoreError> {
        Ok(())
    }

    async fn disk_usage(&self) -> Result<u64, DatastoreError> {
        Ok(self.lock().values().map(|v| v.len() as u64).sum())
    }
}
