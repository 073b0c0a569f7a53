//! Key/value datastore on top of Azure Blob Storage.

pub mod client;
pub mod config;
pub mod datastore;
pub mod errors;

pub use client::{AzureBlobClient, BlobClient, BlobError, MemoryBlobClient, ServiceCode};
pub use config::AzureConfig;
pub use datastore::{BlobDatastore, DatastoreOptions};
