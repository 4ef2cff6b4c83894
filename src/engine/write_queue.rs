use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::engine::datum::WriteResult;
use crate::engine::Persistence;
use crate::{Error, Result};

struct QueuedWrite {
    key: String,
    file: PathBuf,
    content: Vec<u8>,
    bytes: usize,
    waiter: oneshot::Sender<Result<WriteResult>>,
}

/// Writes waiting for the next flush.
///
/// Each queued write hands back a receiver that resolves once the write reached disk (or was
/// superseded). With `write_only_last`, only the newest write per key of a batch is performed.
pub struct WriteQueue {
    pending: Mutex<Vec<QueuedWrite>>,
    write_only_last: bool,
}

impl WriteQueue {
    /// An empty queue. `write_only_last` coalesces writes to the same key within a batch.
    pub fn new(write_only_last: bool) -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            write_only_last,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<QueuedWrite>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues serialized `content` for `file`. The receiver resolves when the write is flushed
    /// or discarded.
    pub fn push(&self, key: &str, file: PathBuf, content: Vec<u8>) -> oneshot::Receiver<Result<WriteResult>> {
        let (waiter, receiver) = oneshot::channel();
        self.lock().push(QueuedWrite {
            key: key.to_string(),
            file,
            bytes: content.len(),
            content,
            waiter,
        });
        receiver
    }

    /// Number of queued writes.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops queued writes for `key` (all keys when `None`) without touching disk.
    /// Their callers are acknowledged, since a later removal overrides them anyway.
    pub fn discard(&self, key: Option<&str>) -> usize {
        let dropped: Vec<QueuedWrite> = {
            let mut pending = self.lock();
            let (dropped, kept): (Vec<QueuedWrite>, Vec<QueuedWrite>) = std::mem::take(&mut *pending)
                .into_iter()
                .partition(|w| key.map_or(true, |k| w.key == k));
            *pending = kept;
            dropped
        };

        let count = dropped.len();
        for w in dropped {
            let _ = w.waiter.send(Ok(WriteResult {
                file: w.file,
                bytes: w.bytes,
            }));
        }
        count
    }

    /// Writes everything queued so far. Returns the number of files written.
    ///
    /// The batch, waiters included, moves onto the blocking pool, so every waiter is answered
    /// even if the future returned here is dropped before it completes.
    pub async fn flush(&self, persistence: &Arc<Persistence>) -> Result<usize> {
        let batch = std::mem::take(&mut *self.lock());
        if batch.is_empty() {
            return Ok(0);
        }

        let p = persistence.clone();
        let write_only_last = self.write_only_last;
        tokio::task::spawn_blocking(move || write_batch(&p, batch, write_only_last))
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }
}

fn write_batch(persistence: &Persistence, batch: Vec<QueuedWrite>, write_only_last: bool) -> usize {
    let mut newest = HashMap::new();
    if write_only_last {
        for (i, w) in batch.iter().enumerate() {
            newest.insert(w.key.clone(), i);
        }
    }

    let results: Vec<Option<Result<WriteResult>>> = batch
        .iter()
        .enumerate()
        .map(|(i, w)| {
            let run = !write_only_last || newest.get(&w.key) == Some(&i);
            run.then(|| persistence.write_file(&w.file, &w.content))
        })
        .collect();

    let mut failed = HashMap::new();
    for (w, result) in batch.iter().zip(&results) {
        if let Some(Err(e)) = result {
            failed.insert(w.key.clone(), e.to_string());
        }
    }

    let mut written = 0;
    for (w, result) in batch.into_iter().zip(results) {
        let result = match result {
            Some(result) => {
                if result.is_ok() {
                    written += 1;
                }
                result
            }
            // Superseded by a newer write of the same key in this batch.
            None => match failed.get(&w.key) {
                Some(msg) => Err(Error::Internal(format!("queued write failed: {}", msg))),
                None => Ok(WriteResult {
                    file: w.file,
                    bytes: w.bytes,
                }),
            },
        };
        let _ = w.waiter.send(result);
    }
    written
}
