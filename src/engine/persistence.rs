use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use log::warn;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use crate::engine::datum::{Datum, DeleteResult, WriteResult};
use crate::Result;

#[allow(unused_imports)]
use crate::engine::LocalStorage;

const ENTRY_EXTENSION: &str = "json";

/// Handles disk I/O for the [`LocalStorage`].
///
/// Every key lives in its own file, `<hex(sha256(key))>.json`, holding the serialized
/// [`Datum`]. The digest gives every key, whatever its length or characters, a fixed 69 byte
/// file name; the key itself is read back from the datum.
///
/// Writes go to a temporary file in the same directory which is then renamed over the entry
/// file, so readers never observe a partially written entry.
pub struct Persistence {
    data_dir: PathBuf,
    forgive_parse_errors: bool,
}

impl Persistence {
    /// Initializes a new `Persistence` handler in the specified directory.
    ///
    /// If the directory does not exist, it will be created.
    pub fn new<P: AsRef<Path>>(dir: P, forgive_parse_errors: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        Ok(Self {
            data_dir: dir,
            forgive_parse_errors,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the entry file for `key`.
    pub fn file_for(&self, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        self.data_dir
            .join(format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION))
    }

    /// Serializes and writes a datum atomically.
    pub fn save_datum(&self, datum: &Datum) -> Result<WriteResult> {
        let bytes = serde_json::to_vec(datum)?;
        self.write_file(&self.file_for(&datum.key), &bytes)
    }

    /// Writes already serialized content to `file` through a temporary file and a rename.
    ///
    /// The data directory is never recreated here: once a storage has been removed, writes
    /// through a handle still open on it fail with [`Error::Io`](crate::Error::Io).
    pub fn write_file(&self, file: &Path, bytes: &[u8]) -> Result<WriteResult> {
        let mut temp = NamedTempFile::new_in(&self.data_dir)?;
        temp.write_all(bytes)?;
        temp.persist(file).map_err(|e| e.error)?;

        Ok(WriteResult {
            file: file.to_path_buf(),
            bytes: bytes.len(),
        })
    }

    /// Reads the datum stored for `key`, `None` if there is none.
    pub fn load_datum(&self, key: &str) -> Result<Option<Datum>> {
        let datum = self.read_entry(&self.file_for(key))?;
        Ok(datum.filter(|d| d.key == key))
    }

    /// Deletes the entry file of `key`.
    pub fn delete_datum(&self, key: &str) -> Result<DeleteResult> {
        let file = self.file_for(key);
        let existed = match fs::remove_file(&file) {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        Ok(DeleteResult {
            file,
            existed,
            removed: existed,
        })
    }

    /// Deletes the entry of `key` if the file still holds a datum that expired at `now`.
    ///
    /// The entry is read again first, so a fresh value written since the caller saw the expired
    /// one is kept. Returns whether a file was removed.
    pub fn delete_if_expired(&self, key: &str, now: u64) -> Result<bool> {
        match self.load_datum(key)? {
            Some(d) if d.is_expired(now) => Ok(self.delete_datum(key)?.removed),
            _ => Ok(false),
        }
    }

    /// Loads every datum found in the data directory, expired ones included.
    ///
    /// Sub-directories and temporary files are skipped.
    pub fn load_all(&self) -> Result<Vec<Datum>> {
        let mut all = Vec::new();
        for path in self.entry_files()? {
            if let Some(datum) = self.read_entry(&path)? {
                all.push(datum);
            }
        }
        Ok(all)
    }

    /// Deletes every entry file. Returns how many were removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    /// Deletes every datum that expired at or before `now` (epoch milliseconds).
    pub fn remove_expired(&self, now: u64) -> Result<usize> {
        let mut removed = 0;
        for path in self.entry_files()? {
            let expired = matches!(self.read_entry(&path)?, Some(d) if d.is_expired(now));
            if expired {
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let entries = match fs::read_dir(&self.data_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().and_then(|s| s.to_str()) == Some(ENTRY_EXTENSION) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn read_entry(&self, path: &Path) -> Result<Option<Datum>> {
        let content = match fs::read(path) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice::<Datum>(&content) {
            Ok(datum) => Ok(Some(datum)),
            Err(e) if self.forgive_parse_errors => {
                warn!("Could not parse entry file {:?}: {}", path, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
