use log::{debug, info};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::engine::LocalStorage;
use crate::storage::NodeStorage;
use crate::{DatumReader, DatumWriter, Error, InitOptions, KeyEnumeration, Result, StoreOptions, STORAGE_NAMES_KEY};

/// Owns a root store and the named storages below it.
///
/// The registry of names is kept in the root store under [`STORAGE_NAMES_KEY`]. Every
/// registry update is a read-modify-write performed while holding an async lock, so concurrent
/// `create_storage`/`remove_storage` calls on one manager never lose each other's changes.
///
/// # Examples
///
/// ```no_run
/// use node_storage::{InitOptions, NodeStorageManager};
///
/// #[tokio::main]
/// async fn main() -> node_storage::Result<()> {
///     let manager = NodeStorageManager::open(InitOptions::new().dir("data")).await?;
///     let storage = manager.create_storage("devices").await?;
///     storage.set("count", &3).await?;
///     storage.close().await?;
///     manager.close().await
/// }
/// ```
pub struct NodeStorageManager {
    options: StoreOptions,
    storage: LocalStorage,
    registry: Mutex<()>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(|c: char| c == '/' || c == '\\') {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

impl NodeStorageManager {
    /// Merges `init_options` over the defaults and opens the root store.
    pub async fn open(init_options: InitOptions) -> Result<Self> {
        let options = StoreOptions::default().merged(&init_options);
        let storage = LocalStorage::init(options.clone()).await?;
        if options.logging {
            info!("Storage manager initialized with options {:?}", options);
        }
        Ok(Self {
            options,
            storage,
            registry: Mutex::new(()),
        })
    }

    /// The resolved options of the root store.
    pub fn options(&self) -> &StoreOptions {
        &self.options
    }

    /// The root engine store.
    pub fn engine(&self) -> &LocalStorage {
        &self.storage
    }

    /// Opens the storage `name` in `<dir>/.<name>` and registers it.
    ///
    /// Calling it again with the same name returns a fresh handle on the same data and leaves
    /// the registry as it is.
    pub async fn create_storage(&self, name: &str) -> Result<NodeStorage> {
        validate_name(name)?;
        let engine = LocalStorage::init(self.options.child(name)).await?;

        let _guard = self.registry.lock().await;
        let mut names = self.read_names().await?;
        if !names.iter().any(|n| n == name) {
            names.push(name.to_string());
        }
        self.write_names(&names).await?;

        Ok(NodeStorage::new(name, engine))
    }

    /// Opens the storage `name` if it is registered, `None` otherwise. Never touches the
    /// registry or creates a directory.
    pub async fn get_storage(&self, name: &str) -> Result<Option<NodeStorage>> {
        if !self.read_names().await?.iter().any(|n| n == name) {
            return Ok(None);
        }
        let engine = LocalStorage::init(self.options.child(name)).await?;
        Ok(Some(NodeStorage::new(name, engine)))
    }

    /// Deletes the directory of storage `name` and unregisters it.
    ///
    /// Returns `false`, leaving the registry untouched, when the directory cannot be removed,
    /// whatever the reason.
    pub async fn remove_storage(&self, name: &str) -> Result<bool> {
        validate_name(name)?;
        let dir = self.options.child(name).dir;
        if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
            debug!("Could not remove storage {:?} at {:?}: {} ({:?})", name, dir, e, e.kind());
            return Ok(false);
        }

        let _guard = self.registry.lock().await;
        let mut names = self.read_names().await?;
        if let Some(index) = names.iter().position(|n| n == name) {
            names.remove(index);
        }
        self.write_names(&names).await?;
        Ok(true)
    }

    /// Registered storage names, in creation order.
    pub async fn get_storage_names(&self) -> Result<Vec<String>> {
        self.read_names().await
    }

    /// Logs the registered names. Returns the number of keys in the root store.
    pub async fn log_storage(&self) -> Result<usize> {
        info!("This storage manager has these storages:");
        for name in self.read_names().await? {
            info!("- {}", name);
        }
        self.storage.length().await
    }

    /// Stops the root store's interval tasks. Data stays on disk.
    pub async fn close(&self) -> Result<()> {
        self.storage.close().await
    }

    async fn read_names(&self) -> Result<Vec<String>> {
        match self.storage.get_item(STORAGE_NAMES_KEY).await? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(value) => Ok(serde_json::from_value(value)?),
        }
    }

    async fn write_names(&self, names: &[String]) -> Result<()> {
        let value = serde_json::to_value(names)?;
        self.storage.set_item(STORAGE_NAMES_KEY, Some(value), None).await?;
        Ok(())
    }
}
