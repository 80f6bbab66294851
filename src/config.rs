use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{anyhow, Context};
use config::{Config, ConfigError, Environment, File};
use log::debug;
use regex_lite::Regex;
use serde::Deserialize;

use crate::command::RetryPolicy;

const DEFAULT_REAL_GIT: &str = "/usr/bin/git";
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_COMMAND_TIMEOUT: u64 = 60 * 60;
const DEFAULT_OUTPUT_TIMEOUT: u64 = 5 * 60;
const DEFAULT_LOCK_TIMEOUT: u64 = 5 * 60;

/// Resolved configuration, passed by reference to everything that needs it.
#[derive(Debug, Clone)]
pub struct GitcacheConfig {
    pub cache_dir: PathBuf,
    pub real_git: PathBuf,
    pub clone: RetryPolicy,
    pub update: RetryPolicy,
    pub lfs: RetryPolicy,
    /// Minimum age of the last mirror update before the network is asked again.
    pub update_interval: Duration,
    pub lock_timeout: Duration,
    pub url_patterns: UrlPatterns,
}

impl GitcacheConfig {
    /// Loads `<cache>/config.toml` and the `GITCACHE_*` environment.
    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(None, None)
    }

    /// Like [`GitcacheConfig::load`] with an explicit cache directory taking precedence.
    pub fn load_with_cache_dir(cache_dir: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_from(cache_dir, None)
    }

    fn load_from(
        cache_dir: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> anyhow::Result<Self> {
        let cache_dir = match cache_dir {
            Some(dir) => dir.to_path_buf(),
            None => match RawConfig::load(None, env.clone())?.dir {
                Some(dir) => dir,
                None => default_cache_dir()?,
            },
        };
        let raw_config = RawConfig::load(Some(&cache_dir), env)?;
        debug!("Loaded configuration {:?}", raw_config);
        Self::from_raw(cache_dir, raw_config)
    }

    /// Default settings for a cache at `cache_dir`.
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        Self::from_raw(cache_dir.into(), RawConfig::default())
    }

    fn from_raw(cache_dir: PathBuf, raw: RawConfig) -> anyhow::Result<Self> {
        let include = raw.urlpatterns.include.regex.as_deref().unwrap_or(".*");
        let exclude = raw
            .urlpatterns
            .exclude
            .regex
            .as_deref()
            .filter(|regex| !regex.is_empty());
        let url_patterns = UrlPatterns::new(include, exclude)?;

        Ok(Self {
            cache_dir,
            real_git: raw
                .system
                .realgit
                .unwrap_or_else(|| PathBuf::from(DEFAULT_REAL_GIT)),
            clone: raw.clone.policy(),
            update: RetryPolicy::new(
                raw.update.retries.unwrap_or(DEFAULT_RETRIES),
                seconds(raw.update.commandtimeout, DEFAULT_COMMAND_TIMEOUT),
                seconds(raw.update.outputtimeout, DEFAULT_OUTPUT_TIMEOUT),
            ),
            lfs: raw.lfs.policy(),
            update_interval: seconds(raw.update.interval, 0),
            lock_timeout: seconds(raw.lock.timeout, DEFAULT_LOCK_TIMEOUT),
            url_patterns,
        })
    }

    pub fn mirrors_dir(&self) -> PathBuf {
        self.cache_dir.join("mirrors")
    }

    pub fn database_path(&self) -> PathBuf {
        self.cache_dir.join("db.toml")
    }

    pub fn database_lock_path(&self) -> PathBuf {
        self.cache_dir.join("db.lock")
    }
}

fn default_cache_dir() -> anyhow::Result<PathBuf> {
    let mut dir = home::home_dir()
        .ok_or_else(|| anyhow!("Could not find home dir. Please define $HOME env variable."))?;
    dir.push(".gitcache");
    Ok(dir)
}

fn seconds(value: Option<u64>, default: u64) -> Duration {
    Duration::from_secs(value.unwrap_or(default))
}

/// Include and exclude regular expressions deciding which urls go through the cache.
#[derive(Debug, Clone)]
pub struct UrlPatterns {
    include: Regex,
    exclude: Option<Regex>,
}

impl UrlPatterns {
    pub fn new(include: &str, exclude: Option<&str>) -> anyhow::Result<Self> {
        let include = Regex::new(include)
            .with_context(|| format!("Invalid url include pattern `{include}`"))?;
        let exclude = exclude
            .map(|exclude| {
                Regex::new(exclude)
                    .with_context(|| format!("Invalid url exclude pattern `{exclude}`"))
            })
            .transpose()?;
        Ok(Self { include, exclude })
    }

    pub fn matches(&self, url: &str) -> bool {
        self.include.is_match(url)
            && !self
                .exclude
                .as_ref()
                .is_some_and(|exclude| exclude.is_match(url))
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    dir: Option<PathBuf>,
    #[serde(default)]
    system: SystemConfig,
    #[serde(default)]
    clone: RetryConfig,
    #[serde(default)]
    update: UpdateConfig,
    #[serde(default)]
    lfs: RetryConfig,
    #[serde(default)]
    lock: LockConfig,
    #[serde(default)]
    urlpatterns: UrlPatternsConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct SystemConfig {
    realgit: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RetryConfig {
    retries: Option<u32>,
    commandtimeout: Option<u64>,
    outputtimeout: Option<u64>,
}

impl RetryConfig {
    fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries.unwrap_or(DEFAULT_RETRIES),
            seconds(self.commandtimeout, DEFAULT_COMMAND_TIMEOUT),
            seconds(self.outputtimeout, DEFAULT_OUTPUT_TIMEOUT),
        )
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct UpdateConfig {
    retries: Option<u32>,
    commandtimeout: Option<u64>,
    outputtimeout: Option<u64>,
    interval: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct LockConfig {
    timeout: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct UrlPatternsConfig {
    #[serde(default)]
    include: PatternConfig,
    #[serde(default)]
    exclude: PatternConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct PatternConfig {
    regex: Option<String>,
}

impl RawConfig {
    fn load(
        cache_dir: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(cache_dir) = cache_dir {
            builder = builder.add_source(File::from(cache_dir.join("config.toml")).required(false));
        }
        builder
            .add_source(
                Environment::with_prefix("GITCACHE")
                    .separator("_")
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
