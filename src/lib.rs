//! Node Storage is a small layer of named, file-backed key-value storages.
//!
//! A [`NodeStorageManager`] owns a root directory. Every named storage it creates lives in a
//! hidden sub-directory (`<root>/.<name>`) and the list of names is persisted inside the root
//! store itself, under [`STORAGE_NAMES_KEY`].
//!
//! ## Core Components
//! - [`engine`]: The persistence engine (one JSON file per key, TTL, write queue, expiry sweep).
//! - [`storage`]: [`NodeStorageManager`] and the typed [`NodeStorage`] handle.
//! - [`options`]: Resolved [`StoreOptions`] and the sparse [`InitOptions`] merged over them.

pub mod engine;
pub mod options;
pub mod storage;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use engine::{Datum, DeleteResult, LocalStorage, WriteResult};
pub use options::{InitOptions, StoreOptions};
pub use storage::{NodeStorage, NodeStorageManager};

/// Errors returned by Node Storage.
#[derive(Error, Debug)]
pub enum Error {
    /// The storage name cannot be mapped to a child directory.
    #[error("invalid storage name: {0:?}")]
    InvalidName(String),
    /// Keys must be non-empty.
    #[error("invalid key: {0:?}")]
    InvalidKey(String),
    /// A store option has a value the engine cannot run with.
    #[error("invalid option: {0}")]
    InvalidOption(String),
    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
    /// An I/O error occurred while reading or writing entry files.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Error during JSON serialization or deserialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A specialized Result type for Node Storage operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Reserved key holding the registry of storage names in the manager's root store.
pub const STORAGE_NAMES_KEY: &str = "storageNames";

/// Point reads against a store.
#[async_trait]
pub trait DatumReader: Send + Sync {
    /// Returns the full datum stored under `key`, or `None` if the key is absent or expired.
    async fn get_datum(&self, key: &str) -> Result<Option<Datum>>;
    /// Returns the value stored under `key`. A datum without a value reads as `None`.
    async fn get_item(&self, key: &str) -> Result<Option<serde_json::Value>>;
}

/// Writes and deletions against a store.
#[async_trait]
pub trait DatumWriter: Send + Sync {
    /// Stores `value` under `key`, expiring after `ttl` when given.
    async fn set_item(
        &self,
        key: &str,
        value: Option<serde_json::Value>,
        ttl: Option<Duration>,
    ) -> Result<WriteResult>;
    /// Deletes `key`.
    async fn remove_item(&self, key: &str) -> Result<DeleteResult>;
    /// Deletes every key of the store.
    async fn clear(&self) -> Result<()>;
}

/// Whole-store views.
#[async_trait]
pub trait KeyEnumeration: Send + Sync {
    /// Lists all live keys.
    async fn keys(&self) -> Result<Vec<String>>;
    /// Lists all live values. A datum without a value is reported as `null`.
    async fn values(&self) -> Result<Vec<serde_json::Value>>;
    /// Counts live keys.
    async fn length(&self) -> Result<usize>;
    /// Dumps every live datum.
    async fn data(&self) -> Result<Vec<Datum>>;
}

/// The contract a persistence engine fulfils for the storage layer.
pub trait PersistEngine: DatumReader + DatumWriter + KeyEnumeration {
    /// The options the store was opened with.
    fn options(&self) -> &StoreOptions;
}
