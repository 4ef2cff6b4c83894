//! Store options.
//!
//! [`StoreOptions`] is the fully resolved configuration every store runs with. Callers
//! describe only what they want to change with [`InitOptions`], whose fields stay unset until
//! a builder method touches them; [`StoreOptions::merged`] copies over exactly those fields.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::{Error, Result};

/// Directory name used below the working directory when no `dir` is given.
pub const DEFAULT_DIR_NAME: &str = "node_storage";

/// Default flush period of the write queue.
pub const DEFAULT_WRITE_QUEUE_INTERVAL: Duration = Duration::from_millis(1000);

/// Resolved configuration of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Directory holding the entry files.
    pub dir: PathBuf,
    /// Time-to-live applied by [`NodeStorage::set`](crate::NodeStorage::set).
    pub ttl: Option<Duration>,
    /// Period of the expiry sweep. `None` disables it.
    pub expired_interval: Option<Duration>,
    /// Coalesce writes and flush them on a timer.
    pub write_queue: bool,
    /// Period of the write queue flush.
    pub write_queue_interval: Duration,
    /// When several writes to one key are queued, only the last one hits disk.
    pub write_queue_write_only_last: bool,
    /// Skip entry files that cannot be parsed instead of failing the read.
    pub forgive_parse_errors: bool,
    /// Emit diagnostic lines through the `log` facade.
    pub logging: bool,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            dir: env::current_dir().unwrap_or_default().join(DEFAULT_DIR_NAME),
            ttl: None,
            expired_interval: None,
            write_queue: false,
            write_queue_interval: DEFAULT_WRITE_QUEUE_INTERVAL,
            write_queue_write_only_last: true,
            forgive_parse_errors: false,
            logging: false,
        }
    }
}

impl StoreOptions {
    /// Returns a copy with every field set in `overrides` replaced.
    pub fn merged(mut self, overrides: &InitOptions) -> Self {
        if let Some(dir) = &overrides.dir {
            self.dir = dir.clone();
        }
        if let Some(ttl) = overrides.ttl {
            self.ttl = ttl;
        }
        if let Some(interval) = overrides.expired_interval {
            self.expired_interval = interval;
        }
        if let Some(enabled) = overrides.write_queue {
            self.write_queue = enabled;
        }
        if let Some(interval) = overrides.write_queue_interval {
            self.write_queue_interval = interval;
        }
        if let Some(only_last) = overrides.write_queue_write_only_last {
            self.write_queue_write_only_last = only_last;
        }
        if let Some(forgive) = overrides.forgive_parse_errors {
            self.forgive_parse_errors = forgive;
        }
        if let Some(logging) = overrides.logging {
            self.logging = logging;
        }
        self
    }

    /// Options of the child store `name`: identical except for `dir = <dir>/.<name>`.
    pub fn child(&self, name: &str) -> Self {
        Self {
            dir: self.dir.join(format!(".{}", name)),
            ..self.clone()
        }
    }

    /// Rejects values the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.expired_interval == Some(Duration::ZERO) {
            return Err(Error::InvalidOption("expired_interval must be non-zero".to_string()));
        }
        if self.write_queue_interval.is_zero() {
            return Err(Error::InvalidOption("write_queue_interval must be non-zero".to_string()));
        }
        if self.ttl == Some(Duration::ZERO) {
            return Err(Error::InvalidOption("ttl must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Sparse options merged over [`StoreOptions::default`].
///
/// # Examples
///
/// ```
/// use node_storage::{InitOptions, StoreOptions};
/// use std::time::Duration;
///
/// let opts = InitOptions::new()
///     .dir("custom_dir")
///     .write_queue(true)
///     .expired_interval(Duration::from_secs(60));
/// let resolved = StoreOptions::default().merged(&opts);
/// assert!(resolved.write_queue);
/// assert!(!resolved.logging);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InitOptions {
    dir: Option<PathBuf>,
    ttl: Option<Option<Duration>>,
    expired_interval: Option<Option<Duration>>,
    write_queue: Option<bool>,
    write_queue_interval: Option<Duration>,
    write_queue_write_only_last: Option<bool>,
    forgive_parse_errors: Option<bool>,
    logging: Option<bool>,
}

impl InitOptions {
    /// Options with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root directory. Child storages live in hidden sub-directories of it.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    /// Default time-to-live applied by [`NodeStorage::set`](crate::NodeStorage::set).
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(Some(ttl));
        self
    }

    /// Explicitly store values without a default time-to-live.
    pub fn no_ttl(mut self) -> Self {
        self.ttl = Some(None);
        self
    }

    /// Period of the background sweep that deletes expired keys.
    pub fn expired_interval(mut self, interval: Duration) -> Self {
        self.expired_interval = Some(Some(interval));
        self
    }

    /// Explicitly disable the expiry sweep.
    pub fn no_expired_interval(mut self) -> Self {
        self.expired_interval = Some(None);
        self
    }

    /// Batch writes and let a background flusher perform them.
    pub fn write_queue(mut self, enabled: bool) -> Self {
        self.write_queue = Some(enabled);
        self
    }

    /// How often the flusher runs.
    pub fn write_queue_interval(mut self, interval: Duration) -> Self {
        self.write_queue_interval = Some(interval);
        self
    }

    /// Write only the newest queued value per key.
    pub fn write_queue_write_only_last(mut self, only_last: bool) -> Self {
        self.write_queue_write_only_last = Some(only_last);
        self
    }

    pub fn forgive_parse_errors(mut self, forgive: bool) -> Self {
        self.forgive_parse_errors = Some(forgive);
        self
    }

    /// Log writes, removals and failed health checks.
    pub fn logging(mut self, enabled: bool) -> Self {
        self.logging = Some(enabled);
        self
    }
}
