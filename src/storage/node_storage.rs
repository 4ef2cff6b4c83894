use std::collections::HashMap;
use std::time::Duration;

use log::{error, info};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::engine::LocalStorage;
use crate::{
    DatumReader, DatumWriter, DeleteResult, KeyEnumeration, PersistEngine, Result, StoreOptions, WriteResult,
};

/// A typed handle on one named storage.
///
/// Values are anything `serde` can turn into JSON. Handles are obtained from
/// [`NodeStorageManager::create_storage`](crate::NodeStorageManager::create_storage); several
/// handles on the same name share the same directory.
pub struct NodeStorage {
    name: String,
    engine: LocalStorage,
}

impl NodeStorage {
    pub(crate) fn new(name: &str, engine: LocalStorage) -> Self {
        Self {
            name: name.to_string(),
            engine,
        }
    }

    /// The name this storage is registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The underlying engine store.
    pub fn engine(&self) -> &LocalStorage {
        &self.engine
    }

    /// Resolved options, with `dir` pointing at this storage's directory.
    pub fn options(&self) -> &StoreOptions {
        self.engine.options()
    }

    /// Stores `value` under `key`, expiring after the store's default `ttl` if one is set.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<WriteResult> {
        let value = serde_json::to_value(value)?;
        let ttl = self.engine.options().ttl;
        self.engine.set_item(key, Some(value), ttl).await
    }

    /// Stores `value` under `key` for `ttl`.
    pub async fn set_with_ttl<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<WriteResult> {
        let value = serde_json::to_value(value)?;
        self.engine.set_item(key, Some(value), Some(ttl)).await
    }

    /// Reads the value under `key`, `None` when the key is absent.
    ///
    /// A stored `null` is passed to `T`'s deserializer, so reading it as `Option<U>` yields
    /// `Some(None)` and stays distinguishable from an absent key.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.engine.get_datum(key).await? {
            Some(datum) if datum.key == key => {
                let value = datum.value.unwrap_or(Value::Null);
                Ok(Some(serde_json::from_value(value)?))
            }
            _ => Ok(None),
        }
    }

    /// Reads the value under `key`, falling back to `default` when the key is absent.
    pub async fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.get(key).await?.unwrap_or(default))
    }

    /// Whether `key` is stored and not expired.
    pub async fn has(&self, key: &str) -> Result<bool> {
        let keys = self.engine.keys().await?;
        Ok(keys.iter().any(|k| k == key))
    }

    /// Same as [`has`](Self::has).
    pub async fn includes(&self, key: &str) -> Result<bool> {
        self.has(key).await
    }

    /// Number of stored keys.
    pub async fn size(&self) -> Result<usize> {
        self.engine.length().await
    }

    /// Deletes `key`, dropping any queued write for it. Removing an absent key is not an error.
    pub async fn remove(&self, key: &str) -> Result<DeleteResult> {
        self.engine.remove_item(key).await
    }

    /// Snapshot of every key and value.
    pub async fn data(&self) -> Result<HashMap<String, Value>> {
        Ok(self
            .engine
            .data()
            .await?
            .into_iter()
            .map(|d| (d.key, d.value.unwrap_or(Value::Null)))
            .collect())
    }

    /// Every stored key.
    pub async fn keys(&self) -> Result<Vec<String>> {
        self.engine.keys().await
    }

    /// Every stored value, decoded as `T`. A missing payload decodes from `null`.
    pub async fn values<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.engine
            .values()
            .await?
            .into_iter()
            .map(|v| serde_json::from_value(v).map_err(Into::into))
            .collect()
    }

    /// Deletes every key. Child storages below this one are left alone.
    pub async fn clear(&self) -> Result<()> {
        self.engine.clear().await
    }

    /// Logs every key and value. Returns the number of keys.
    pub async fn log_storage(&self) -> Result<usize> {
        let data = self.engine.data().await?;
        info!("Storage {:?} has {} keys:", self.name, data.len());
        for datum in &data {
            let value = datum.value.as_ref().unwrap_or(&Value::Null);
            info!("- {}: {}", datum.key, value);
        }
        Ok(data.len())
    }

    /// Stops the expiry sweep and the write queue flusher. Data stays on disk.
    pub async fn close(&self) -> Result<()> {
        self.engine.close().await
    }

    /// Checks that the data dump, the key list and the value list of `store` agree.
    ///
    /// Fails when a datum has no key, a key cannot be read back on its own, the three views
    /// differ in length, or the store returns an error. Details are logged only when the
    /// store's `logging` option is on.
    pub async fn health_check<S: PersistEngine + ?Sized>(store: &S) -> bool {
        let logging = store.options().logging;
        match check_consistency(store, logging).await {
            Ok(healthy) => healthy,
            Err(e) => {
                if logging {
                    error!("Health check failed: {}", e);
                }
                false
            }
        }
    }
}

async fn check_consistency<S: PersistEngine + ?Sized>(store: &S, logging: bool) -> Result<bool> {
    let data = store.data().await?;
    for datum in &data {
        if datum.key.is_empty() {
            if logging {
                error!("Health check failed for invalid data: {}", serde_json::to_string(datum)?);
            }
            return Ok(false);
        }
        if store.get_datum(&datum.key).await?.is_none() {
            if logging {
                error!("Health check failed: key {:?} is listed but cannot be read", datum.key);
            }
            return Ok(false);
        }
    }

    let keys = store.keys().await?;
    if keys.len() != data.len() {
        if logging {
            error!("Health check failed: {} keys for {} entries", keys.len(), data.len());
        }
        return Ok(false);
    }

    let values = store.values().await?;
    if values.len() != data.len() {
        if logging {
            error!("Health check failed: {} values for {} entries", values.len(), data.len());
        }
        return Ok(false);
    }
    Ok(true)
}
