use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info};
use serde_json::Value;

use crate::engine::datum::{now_millis, Datum, DeleteResult, WriteResult};
use crate::engine::interval::IntervalTask;
use crate::engine::write_queue::WriteQueue;
use crate::engine::Persistence;
use crate::{DatumReader, DatumWriter, Error, KeyEnumeration, PersistEngine, Result, StoreOptions};

/// A file-backed key-value store bound to one directory.
///
/// Reads and writes go straight to the entry files unless the write queue is enabled, in which
/// case writes are batched and performed by a background flusher every
/// `write_queue_interval`. While the flusher is stopped, a queued write is flushed by the
/// caller that queued it. An optional expiry sweep deletes datums past their TTL; expired
/// datums are also dropped lazily when read.
pub struct LocalStorage {
    options: StoreOptions,
    persistence: Arc<Persistence>,
    write_queue: Arc<WriteQueue>,
    write_queue_timer: Mutex<IntervalTask>,
    expired_keys_timer: Mutex<IntervalTask>,
}

async fn run_blocking<T, F>(persistence: Arc<Persistence>, f: F) -> Result<T>
where
    F: FnOnce(&Persistence) -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&persistence))
        .await
        .map_err(|e| Error::Internal(e.to_string()))?
}

fn slot(timer: &Mutex<IntervalTask>) -> MutexGuard<'_, IntervalTask> {
    timer.lock().unwrap_or_else(PoisonError::into_inner)
}

impl LocalStorage {
    /// Opens the store, creating its directory, and starts the interval tasks the options
    /// enable. Must be called from within a tokio runtime.
    pub async fn init(options: StoreOptions) -> Result<Self> {
        options.validate()?;

        let dir = options.dir.clone();
        let forgive = options.forgive_parse_errors;
        let persistence = tokio::task::spawn_blocking(move || Persistence::new(dir, forgive))
            .await
            .map_err(|e| Error::Internal(e.to_string()))??;

        let store = Self {
            write_queue: Arc::new(WriteQueue::new(options.write_queue_write_only_last)),
            persistence: Arc::new(persistence),
            write_queue_timer: Mutex::new(IntervalTask::idle()),
            expired_keys_timer: Mutex::new(IntervalTask::idle()),
            options,
        };

        if store.options.write_queue {
            store.start_write_queue_interval();
        }
        store.start_expired_keys_interval();

        if store.options.logging {
            info!("Store opened in {:?}", store.options.dir);
        }
        Ok(store)
    }

    /// Directory holding this store's entry files.
    pub fn dir(&self) -> &Path {
        self.persistence.dir()
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Persistence) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        run_blocking(self.persistence.clone(), f).await
    }

    /// Starts the write queue flusher, restarting it if it already runs.
    pub fn start_write_queue_interval(&self) {
        let queue = self.write_queue.clone();
        let persistence = self.persistence.clone();
        slot(&self.write_queue_timer).start(self.options.write_queue_interval, move || {
            let queue = queue.clone();
            let persistence = persistence.clone();
            async move {
                if let Err(e) = queue.flush(&persistence).await {
                    error!("Failed to flush write queue in {:?}: {}", persistence.dir(), e);
                }
            }
        });
    }

    /// Stops the flusher, waiting for a flush in progress, then writes whatever is still
    /// queued. Safe to call when the flusher is not running.
    pub async fn stop_write_queue_interval(&self) -> Result<()> {
        let flusher = std::mem::take(&mut *slot(&self.write_queue_timer));
        flusher.shutdown().await;
        self.flush_write_queue().await?;
        Ok(())
    }

    /// Whether the background flusher runs.
    pub fn is_write_queue_interval_running(&self) -> bool {
        slot(&self.write_queue_timer).is_running()
    }

    /// Starts the expiry sweep. Does nothing when `expired_interval` is not set.
    pub fn start_expired_keys_interval(&self) {
        let Some(period) = self.options.expired_interval else {
            return;
        };
        let persistence = self.persistence.clone();
        slot(&self.expired_keys_timer).start(period, move || {
            let persistence = persistence.clone();
            async move {
                let dir = persistence.dir().to_path_buf();
                match run_blocking(persistence, |p| p.remove_expired(now_millis())).await {
                    Ok(0) => {}
                    Ok(n) => debug!("Removed {} expired keys from {:?}", n, dir),
                    Err(e) => error!("Failed to remove expired keys from {:?}: {}", dir, e),
                }
            }
        });
    }

    /// Stops the expiry sweep, waiting for a sweep in progress.
    pub async fn stop_expired_keys_interval(&self) {
        let sweep = std::mem::take(&mut *slot(&self.expired_keys_timer));
        sweep.shutdown().await;
    }

    /// Whether the expiry sweep runs.
    pub fn is_expired_keys_interval_running(&self) -> bool {
        slot(&self.expired_keys_timer).is_running()
    }

    /// Number of writes waiting for the next flush.
    pub fn queued_writes(&self) -> usize {
        self.write_queue.len()
    }

    /// Writes every queued write now. Returns the number of files written.
    pub async fn flush_write_queue(&self) -> Result<usize> {
        self.write_queue.flush(&self.persistence).await
    }

    /// Deletes every expired datum. Returns how many were removed.
    pub async fn remove_expired_items(&self) -> Result<usize> {
        self.blocking(|p| p.remove_expired(now_millis())).await
    }

    /// Stops both interval tasks, then writes what is still queued. Data stays on disk.
    pub async fn close(&self) -> Result<()> {
        self.stop_expired_keys_interval().await;
        self.stop_write_queue_interval().await
    }
}

#[async_trait]
impl DatumReader for LocalStorage {
    async fn get_datum(&self, key: &str) -> Result<Option<Datum>> {
        let k = key.to_string();
        let datum = self.blocking(move |p| p.load_datum(&k)).await?;
        let now = now_millis();
        match datum {
            Some(d) if d.is_expired(now) => {
                let k = key.to_string();
                self.blocking(move |p| p.delete_if_expired(&k, now)).await?;
                Ok(None)
            }
            other => Ok(other),
        }
    }

    async fn get_item(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get_datum(key).await?.and_then(|d| d.value))
    }
}

#[async_trait]
impl DatumWriter for LocalStorage {
    async fn set_item(&self, key: &str, value: Option<Value>, ttl: Option<Duration>) -> Result<WriteResult> {
        if key.is_empty() {
            return Err(Error::InvalidKey(key.to_string()));
        }
        if self.options.logging {
            info!("set {:?} in {:?}", key, self.dir());
        }

        let datum = Datum::new(key, value, ttl);
        if !self.options.write_queue {
            return self.blocking(move |p| p.save_datum(&datum)).await;
        }

        let content = serde_json::to_vec(&datum)?;
        let receiver = self.write_queue.push(key, self.persistence.file_for(key), content);
        if !self.is_write_queue_interval_running() {
            self.flush_write_queue().await?;
        }
        receiver
            .await
            .map_err(|_| Error::Internal("write queue dropped a pending write".to_string()))?
    }

    async fn remove_item(&self, key: &str) -> Result<DeleteResult> {
        if self.options.logging {
            info!("remove {:?} from {:?}", key, self.dir());
        }
        self.write_queue.discard(Some(key));
        let k = key.to_string();
        self.blocking(move |p| p.delete_datum(&k)).await
    }

    async fn clear(&self) -> Result<()> {
        if self.options.logging {
            info!("clear {:?}", self.dir());
        }
        self.write_queue.discard(None);
        self.blocking(|p| p.clear()).await?;
        Ok(())
    }
}

#[async_trait]
impl KeyEnumeration for LocalStorage {
    async fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data().await?.into_iter().map(|d| d.key).collect())
    }

    async fn values(&self) -> Result<Vec<Value>> {
        Ok(self
            .data()
            .await?
            .into_iter()
            .map(|d| d.value.unwrap_or(Value::Null))
            .collect())
    }

    async fn length(&self) -> Result<usize> {
        Ok(self.data().await?.len())
    }

    async fn data(&self) -> Result<Vec<Datum>> {
        let all = self.blocking(|p| p.load_all()).await?;
        let now = now_millis();
        Ok(all.into_iter().filter(|d| !d.is_expired(now)).collect())
    }
}

impl PersistEngine for LocalStorage {
    fn options(&self) -> &StoreOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InitOptions;
    use serde_json::json;
    use tempfile::tempdir;

    fn options(dir: &Path, custom: InitOptions) -> StoreOptions {
        StoreOptions::default().merged(&custom.dir(dir))
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();

        store.set_item("k1", Some(json!("v1")), None).await.unwrap();
        assert_eq!(store.get_item("k1").await.unwrap(), Some(json!("v1")));
        assert_eq!(store.length().await.unwrap(), 1);

        let removed = store.remove_item("k1").await.unwrap();
        assert!(removed.existed);
        assert_eq!(store.get_item("k1").await.unwrap(), None);
        assert!(!store.remove_item("k1").await.unwrap().existed);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        assert!(matches!(store.set_item("", Some(json!(1)), None).await, Err(Error::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_no_timers_by_default() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        assert!(!store.is_write_queue_interval_running());
        assert!(!store.is_expired_keys_interval_running());
    }

    #[tokio::test]
    async fn test_init_rejects_zero_interval() {
        let dir = tempdir().unwrap();
        let res = LocalStorage::init(options(dir.path(), InitOptions::new().expired_interval(Duration::ZERO))).await;
        assert!(matches!(res, Err(Error::InvalidOption(_))));
    }

    #[tokio::test]
    async fn test_ttl_expires_lazily() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();

        store.set_item("short", Some(json!(1)), Some(Duration::from_millis(20))).await.unwrap();
        store.set_item("long", Some(json!(2)), None).await.unwrap();
        assert_eq!(store.get_item("short").await.unwrap(), Some(json!(1)));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.keys().await.unwrap(), vec!["long".to_string()]);
        assert_eq!(store.get_item("short").await.unwrap(), None);
        assert!(!store.persistence.file_for("short").exists());
    }

    #[tokio::test]
    async fn test_expiry_sweep_removes_files() {
        let dir = tempdir().unwrap();
        let opts = options(dir.path(), InitOptions::new().expired_interval(Duration::from_millis(20)));
        let store = LocalStorage::init(opts).await.unwrap();
        assert!(store.is_expired_keys_interval_running());

        store.set_item("short", Some(json!(1)), Some(Duration::from_millis(10))).await.unwrap();
        let file = store.persistence.file_for("short");
        assert!(file.exists());

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(!file.exists());

        store.close().await.unwrap();
        assert!(!store.is_expired_keys_interval_running());
    }

    #[tokio::test]
    async fn test_remove_expired_items() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        store.set_item("a", Some(json!(1)), Some(Duration::from_millis(5))).await.unwrap();
        store.set_item("b", Some(json!(1)), Some(Duration::from_millis(5))).await.unwrap();
        store.set_item("c", Some(json!(1)), None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.remove_expired_items().await.unwrap(), 2);
        assert_eq!(store.length().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_queue_resolves_on_flush() {
        let dir = tempdir().unwrap();
        let opts = options(
            dir.path(),
            InitOptions::new().write_queue(true).write_queue_interval(Duration::from_millis(20)),
        );
        let store = LocalStorage::init(opts).await.unwrap();
        assert!(store.is_write_queue_interval_running());

        let written = store.set_item("k", Some(json!("Abc")), None).await.unwrap();
        assert_eq!(written.file, store.persistence.file_for("k"));
        assert_eq!(store.queued_writes(), 0);
        assert_eq!(store.get_item("k").await.unwrap(), Some(json!("Abc")));

        store.close().await.unwrap();
        assert!(!store.is_write_queue_interval_running());
    }

    #[tokio::test]
    async fn test_write_queue_flushes_inline_after_close() {
        let dir = tempdir().unwrap();
        let opts = options(
            dir.path(),
            InitOptions::new().write_queue(true).write_queue_interval(Duration::from_millis(10)),
        );
        let store = LocalStorage::init(opts).await.unwrap();
        store.close().await.unwrap();

        store.set_item("late", Some(json!(1)), None).await.unwrap();
        assert!(!store.is_write_queue_interval_running());
        assert_eq!(store.queued_writes(), 0);
        assert_eq!(store.get_item("late").await.unwrap(), Some(json!(1)));
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_set_pending_across_stop_resolves() {
        let dir = tempdir().unwrap();
        let opts = options(
            dir.path(),
            InitOptions::new().write_queue(true).write_queue_interval(Duration::from_millis(200)),
        );
        let store = Arc::new(LocalStorage::init(opts).await.unwrap());

        let s = store.clone();
        let pending = tokio::spawn(async move { s.set_item("k", Some(json!(1)), None).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.queued_writes(), 1);

        store.stop_write_queue_interval().await.unwrap();
        assert!(!store.is_write_queue_interval_running());
        let written = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("set still pending after stop")
            .unwrap()
            .unwrap();
        assert_eq!(written.file, store.persistence.file_for("k"));
        assert_eq!(store.get_item("k").await.unwrap(), Some(json!(1)));

        // Stopping again, and with nothing queued, is harmless.
        store.stop_write_queue_interval().await.unwrap();
    }

    #[tokio::test]
    async fn test_close_during_flushes_answers_every_set() {
        let dir = tempdir().unwrap();
        let opts = options(
            dir.path(),
            InitOptions::new().write_queue(true).write_queue_interval(Duration::from_millis(1)),
        );
        let store = Arc::new(LocalStorage::init(opts).await.unwrap());

        for round in 0..20 {
            store.start_write_queue_interval();
            let sets: Vec<_> = (0..20)
                .map(|i| {
                    let s = store.clone();
                    let key = format!("r{}k{}", round, i);
                    tokio::spawn(async move { s.set_item(&key, Some(json!(i)), None).await })
                })
                .collect();
            tokio::task::yield_now().await;
            store.close().await.unwrap();

            for set in sets {
                set.await.unwrap().unwrap();
            }
        }
        assert_eq!(store.length().await.unwrap(), 400);
    }

    #[tokio::test]
    async fn test_expired_read_removes_file() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        store.set_item("k", Some(json!(1)), Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get_datum("k").await.unwrap().is_none());
        assert!(!store.persistence.file_for("k").exists());

        store.set_item("k", Some(json!(2)), None).await.unwrap();
        assert_eq!(store.get_item("k").await.unwrap(), Some(json!(2)));
    }

    #[tokio::test]
    async fn test_clear_keeps_child_directories() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        store.set_item("a", Some(json!(1)), None).await.unwrap();
        std::fs::create_dir_all(dir.path().join(".child")).unwrap();

        store.clear().await.unwrap();
        assert_eq!(store.length().await.unwrap(), 0);
        assert!(dir.path().join(".child").is_dir());
    }

    #[tokio::test]
    async fn test_values_report_missing_payload_as_null() {
        let dir = tempdir().unwrap();
        let store = LocalStorage::init(options(dir.path(), InitOptions::new())).await.unwrap();
        store.set_item("none", None, None).await.unwrap();

        let datum = store.get_datum("none").await.unwrap().unwrap();
        assert_eq!(datum.value, None);
        assert_eq!(store.values().await.unwrap(), vec![Value::Null]);
    }
}
