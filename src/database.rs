use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use log::trace;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;

use crate::flock::{self, FileLock};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error on the usage store {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not decode the usage store {}: {source}", path.display())]
    Decode {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Could not encode the usage store: {0}")]
    Encode(#[from] toml::ser::Error),
    #[error(transparent)]
    Lock(#[from] flock::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Clones,
    Updates,
    MirrorUpdates,
}

/// Usage of one mirror, persisted across invocations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_ref: Option<String>,
    #[serde(default)]
    pub clones: u64,
    #[serde(default)]
    pub updates: u64,
    #[serde(default)]
    pub mirror_updates: u64,
    /// Seconds since the unix epoch.
    #[serde(default)]
    pub last_used: u64,
    #[serde(default)]
    pub last_mirror_update: u64,
}

impl UsageRecord {
    fn count(&mut self, counter: Counter) {
        match counter {
            Counter::Clones => self.clones += 1,
            Counter::Updates => self.updates += 1,
            Counter::MirrorUpdates => self.mirror_updates += 1,
        }
    }
}

/// The usage records of all mirrors, keyed by mirror path.
///
/// Every modification is a read-modify-write under `db.lock` that replaces
/// `db.toml` by renaming a fully written temporary file over it, so readers
/// never see a partial store and concurrent writers never lose an update.
#[derive(Debug, Clone)]
pub struct Database {
    path: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

type Records = BTreeMap<String, UsageRecord>;

impl Database {
    pub fn new(path: PathBuf, lock_path: PathBuf, lock_timeout: Duration) -> Self {
        Self {
            path,
            lock_path,
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, read without taking the lock.
    pub fn records(&self) -> Result<Records, StorageError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Records::new())
            }
            Err(source) => {
                return Err(StorageError::IO {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        toml::from_str(&content).map_err(|source| StorageError::Decode {
            path: self.path.clone(),
            source,
        })
    }

    pub fn get(&self, mirror_path: &Path) -> Result<Option<UsageRecord>, StorageError> {
        Ok(self.records()?.remove(&key(mirror_path)))
    }

    /// Creates the record of a new mirror, keeping the counters of an existing one.
    pub fn add(
        &self,
        mirror_path: &Path,
        url: &str,
        default_ref: Option<&str>,
    ) -> Result<(), StorageError> {
        self.modify(mirror_path, url, |record| {
            record.default_ref = default_ref.map(str::to_string);
        })
    }

    pub fn increment_counter(&self, mirror_path: &Path, counter: Counter) -> Result<(), StorageError> {
        self.modify(mirror_path, "", |record| {
            record.count(counter);
            if counter == Counter::MirrorUpdates {
                record.last_mirror_update = now();
            }
        })
    }

    fn modify(
        &self,
        mirror_path: &Path,
        url: &str,
        update: impl FnOnce(&mut UsageRecord),
    ) -> Result<(), StorageError> {
        let _lock = FileLock::new(&self.lock_path, self.lock_timeout)?;
        let mut records = self.records()?;
        let record = records.entry(key(mirror_path)).or_default();
        if !url.is_empty() {
            record.url = url.to_string();
        }
        update(record);
        record.last_used = now();
        trace!("Storing usage of {}: {:?}", mirror_path.display(), record);
        self.store(&records)
    }

    fn store(&self, records: &Records) -> Result<(), StorageError> {
        let content = toml::to_string_pretty(records)?;
        let io_error = |source| StorageError::IO {
            path: self.path.clone(),
            source,
        };
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut file = NamedTempFile::new_in(dir).map_err(io_error)?;
        file.write_all(content.as_bytes()).map_err(io_error)?;
        file.as_file().sync_all().map_err(io_error)?;
        file.persist(&self.path)
            .map_err(|error| io_error(error.error))?;
        Ok(())
    }
}

fn key(mirror_path: &Path) -> String {
    mirror_path.to_string_lossy().into_owned()
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
