use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use git2::Repository;
use log::{debug, info, trace, warn};
use thiserror::Error;

use crate::{
    command::{RetryCommand, SpawnError},
    config::GitcacheConfig,
    database::{Counter, StorageError},
    flock::{self, FileLock},
    model::IdentityError,
};

use super::cache::MirrorRegistry;

const GIT_DIR: &str = "git";
const PARTIAL_GIT_DIR: &str = "git.partial";
const LOCK_FILE: &str = ".lock";

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("Creating the mirror of {url} failed with exit code {code}")]
    Create { url: String, code: i32 },
    #[error("Updating the mirror of {url} failed with exit code {code}")]
    Update { url: String, code: i32 },
    #[error("Fetching large objects of {git_ref} from {url} failed with exit code {code}")]
    LargeObjects {
        url: String,
        git_ref: String,
        code: i32,
    },
    #[error("Cache location {location} is not a directory")]
    BadLocation { location: String },
    #[error("Mirror lock cannot be acquired: {0}")]
    Lock(#[from] flock::Error),
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
}

impl MirrorError {
    /// The exit code of the failed git command, if the failure came from one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            MirrorError::Create { code, .. }
            | MirrorError::Update { code, .. }
            | MirrorError::LargeObjects { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// The cached bare copy of one remote repository.
pub struct GitMirror<'a> {
    registry: &'a MirrorRegistry,
    url: String,
    path: PathBuf,
}

impl<'a> GitMirror<'a> {
    pub(super) fn new(
        registry: &'a MirrorRegistry,
        url: String,
        path: PathBuf,
    ) -> GitMirror<'a> {
        GitMirror {
            registry,
            url,
            path,
        }
    }

    /// The url of the upstream repository, as the user gave it.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Where pushes go: always the upstream repository.
    pub fn push_url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn git_dir(&self) -> PathBuf {
        self.path.join(GIT_DIR)
    }

    pub fn config(&self) -> &GitcacheConfig {
        self.registry.config()
    }

    pub fn is_ready(&self) -> bool {
        self.git_dir().is_dir()
    }

    fn lock(&self) -> Result<FileLock, MirrorError> {
        std::fs::create_dir_all(&self.path)?;
        debug!("Acquiring the lock of the mirror {}", self.path.display());
        Ok(FileLock::new(
            &self.path.join(LOCK_FILE),
            self.config().lock_timeout,
        )?)
    }

    fn git(&self) -> RetryCommand {
        RetryCommand::new(&self.config().real_git).forward_output(true)
    }

    /// Clones the upstream repository into the mirror, unless another process already did.
    pub(super) fn create(&self) -> Result<(), MirrorError> {
        let _lock = self.lock()?;
        if self.is_ready() {
            debug!("Mirror {} was created concurrently", self.path.display());
            return Ok(());
        }

        let partial = self.path.join(PARTIAL_GIT_DIR);
        if partial.exists() {
            warn!("Removing the incomplete mirror {}", partial.display());
            std::fs::remove_dir_all(&partial)?;
        }

        info!("Creating the mirror of {} in {}", self.url, self.path.display());
        let output = self
            .git()
            .args(["clone", "--mirror"])
            .arg(&self.url)
            .arg(&partial)
            .current_dir(&self.path)
            .run(&self.config().clone)?;
        if !output.success() {
            if partial.exists() {
                std::fs::remove_dir_all(&partial)?;
            }
            return Err(MirrorError::Create {
                url: self.url.clone(),
                code: output.exit_code,
            });
        }
        std::fs::rename(&partial, self.git_dir())?;

        let default_ref = read_head_branch(&self.git_dir())?;
        trace!("Default ref of {} is {:?}", self.url, default_ref);
        self.registry
            .database()
            .add(&self.path, &self.url, default_ref.as_deref())?;

        if let Some(default_ref) = default_ref {
            if let Err(error) = self.fetch_lfs_locked(&default_ref) {
                warn!("{}", error);
            }
        }
        Ok(())
    }

    /// Fetches the upstream repository into the mirror.
    ///
    /// Returns `false` without touching the network if the last update is
    /// younger than the configured update interval.
    pub fn update(&self) -> Result<bool, MirrorError> {
        let _lock = self.lock()?;
        let database = self.registry.database();
        let record = database.get(&self.path)?;

        let interval = self.config().update_interval.as_secs();
        if interval > 0 {
            let last_update = record.as_ref().map_or(0, |r| r.last_mirror_update);
            if now().saturating_sub(last_update) < interval {
                info!(
                    "Mirror {} was updated less than {}s ago, skipping the update",
                    self.path.display(),
                    interval
                );
                return Ok(false);
            }
        }

        info!("Updating the mirror of {}", self.url);
        let output = self
            .git()
            .args(["fetch", "--prune", "origin"])
            .current_dir(self.git_dir())
            .run(&self.config().update)?;
        if !output.success() {
            return Err(MirrorError::Update {
                url: self.url.clone(),
                code: output.exit_code,
            });
        }

        if let Some(default_ref) = record.and_then(|r| r.default_ref) {
            if let Err(error) = self.fetch_lfs_locked(&default_ref) {
                warn!("{}", error);
            }
        }
        database.increment_counter(&self.path, Counter::MirrorUpdates)?;
        Ok(true)
    }

    /// Fetches refs or commit ids that the last update did not bring in.
    pub fn fetch_refs<S: AsRef<str>>(&self, refs: &[S]) -> Result<(), MirrorError> {
        let _lock = self.lock()?;
        debug!("Fetching {} refs into the mirror of {}", refs.len(), self.url);
        let output = self
            .git()
            .args(["fetch", "origin"])
            .args(refs.iter().map(|git_ref| git_ref.as_ref()))
            .current_dir(self.git_dir())
            .run(&self.config().update)?;
        if !output.success() {
            return Err(MirrorError::Update {
                url: self.url.clone(),
                code: output.exit_code,
            });
        }
        Ok(())
    }

    /// Fetches the large objects of `git_ref` if the repository uses them at that ref.
    pub fn fetch_lfs(&self, git_ref: &str) -> Result<(), MirrorError> {
        let _lock = self.lock()?;
        self.fetch_lfs_locked(git_ref)
    }

    fn fetch_lfs_locked(&self, git_ref: &str) -> Result<(), MirrorError> {
        if !self.uses_lfs(git_ref) {
            trace!("{} does not use large objects at {}", self.url, git_ref);
            return Ok(());
        }
        info!("Fetching large objects of {} at {}", self.url, git_ref);
        let output = self
            .git()
            .args(["lfs", "fetch", "origin", git_ref])
            .current_dir(self.git_dir())
            .run(&self.config().lfs)?;
        if !output.success() {
            return Err(MirrorError::LargeObjects {
                url: self.url.clone(),
                git_ref: git_ref.to_string(),
                code: output.exit_code,
            });
        }
        Ok(())
    }

    /// Whether the `.gitattributes` at `git_ref` routes any path through the lfs filter.
    pub fn uses_lfs(&self, git_ref: &str) -> bool {
        let repository = match Repository::open_bare(self.git_dir()) {
            Ok(repository) => repository,
            Err(error) => {
                debug!("Cannot open {}: {}", self.git_dir().display(), error);
                return false;
            }
        };
        let result = repository.revparse_single(&format!("{git_ref}:.gitattributes"));
        let uses_lfs = match result.and_then(|object| object.peel_to_blob()) {
            Ok(blob) => String::from_utf8_lossy(blob.content()).contains("filter=lfs"),
            Err(error) if error.code() == git2::ErrorCode::NotFound => false,
            Err(error) => {
                debug!("Cannot read .gitattributes at {}: {}", git_ref, error);
                false
            }
        };
        uses_lfs
    }

    /// The branch recorded as the upstream default when the mirror was created.
    pub fn get_default_ref(&self) -> Result<Option<String>, MirrorError> {
        Ok(self
            .registry
            .database()
            .get(&self.path)?
            .and_then(|record| record.default_ref))
    }
}

/// The branch `HEAD` of a bare repository points to.
fn read_head_branch(git_dir: &Path) -> Result<Option<String>, git2::Error> {
    let repository = Repository::open_bare(git_dir)?;
    let head = repository.find_reference("HEAD")?;
    Ok(head
        .symbolic_target()
        .map(|target| target.strip_prefix("refs/heads/").unwrap_or(target).to_string()))
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or_default()
}
