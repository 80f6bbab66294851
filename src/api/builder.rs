use std::path::PathBuf;

use crate::{config::GitcacheConfig, git::cache::MirrorRegistry, Gitcache};

#[derive(Default)]
pub struct GitcacheBuilder {
    cache_directory_path: Option<PathBuf>,
    real_git: Option<PathBuf>,
    config: Option<GitcacheConfig>,
}

impl GitcacheBuilder {
    /// Location of the cache directory.
    ///
    /// Defaults to `$GITCACHE_DIR`, or `$HOME/.gitcache`.
    pub fn cache_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_directory_path = Some(path.into());
        self
    }

    /// The git executable that does the actual work.
    ///
    /// Defaults to `/usr/bin/git`.
    pub fn real_git(mut self, path: impl Into<PathBuf>) -> Self {
        self.real_git = Some(path.into());
        self
    }

    /// Use `config` instead of loading the configuration file and environment.
    pub fn config(mut self, config: GitcacheConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn try_build(self) -> anyhow::Result<Gitcache> {
        let Self {
            cache_directory_path,
            real_git,
            config,
        } = self;

        let mut config = match config {
            Some(config) => config,
            None => GitcacheConfig::load_with_cache_dir(cache_directory_path.as_deref())?,
        };
        if let Some(cache_directory) = cache_directory_path {
            config.cache_dir = cache_directory;
        }
        if let Some(real_git) = real_git {
            config.real_git = real_git;
        }

        let registry = MirrorRegistry::new(config)?;
        Ok(Gitcache { registry })
    }
}
