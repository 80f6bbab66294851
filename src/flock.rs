use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::{debug, trace};
use thiserror::Error;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// An exclusive advisory lock on a file.
///
/// The lock lives as long as the value; the operating system releases it when
/// the file handle is closed, including when the owning process dies.
#[derive(Debug)]
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Timed out after {}s waiting for the lock {}", timeout.as_secs(), path.display())]
    Timeout { path: PathBuf, timeout: Duration },
    #[error("IO error on lock {}: {source}", path.display())]
    IO {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl FileLock {
    /// Acquires the lock, waiting at most `timeout` for a concurrent holder to release it.
    pub fn new(path: &Path, timeout: Duration) -> Result<Self, Error> {
        let io_error = |source| Error::IO {
            path: path.to_path_buf(),
            source,
        };
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .map_err(io_error)?;
        let start = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => {
                    trace!("Acquired the lock {}", path.display());
                    return Ok(Self { _file: file });
                }
                // Older fs4 releases report contention as an error.
                Err(error)
                    if error.raw_os_error() != fs4::lock_contended_error().raw_os_error() =>
                {
                    return Err(io_error(error));
                }
                Ok(false) | Err(_) => {}
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout {
                    path: path.to_path_buf(),
                    timeout,
                });
            }
            debug!("Failed to acquire a lock on {}, retrying", path.display());
            std::thread::sleep(POLL_INTERVAL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_lock_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let first = FileLock::new(&path, Duration::from_secs(1)).unwrap();
        let second = FileLock::new(&path, Duration::from_millis(250));
        assert!(matches!(second, Err(Error::Timeout { .. })));

        drop(first);
        FileLock::new(&path, Duration::from_millis(250)).unwrap();
    }

    #[test]
    fn waiter_acquires_after_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.lock");

        let first = FileLock::new(&path, Duration::from_secs(1)).unwrap();
        let waiter = {
            let path = path.clone();
            std::thread::spawn(move || FileLock::new(&path, Duration::from_secs(10)).is_ok())
        };
        std::thread::sleep(Duration::from_millis(300));
        drop(first);

        assert!(waiter.join().unwrap());
    }

    #[test]
    fn missing_parent_directory_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("test.lock");

        let result = FileLock::new(&path, Duration::from_millis(100));
        assert!(matches!(result, Err(Error::IO { .. })));
    }
}
