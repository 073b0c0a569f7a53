//! Generic key/value datastore contract shared by blobds backends.

pub mod batch;
pub mod datastore;
pub mod error;
pub mod key;
pub mod map;
pub mod query;
pub mod suite;

pub use batch::{BasicBatch, Batch, BatchOp};
pub use datastore::Datastore;
pub use error::{DatastoreError, QueryError};
pub use key::Key;
pub use map::MapDatastore;
pub use query::{CompareOp, Entry, Filter, Order, Query, QueryResult, QueryResults};
