use std::path::{Path, PathBuf};

use log::{debug, trace};

use crate::{
    config::GitcacheConfig,
    database::{Database, UsageRecord},
    model::{identity::RepositoryIdentity, IdentityError},
};

use super::mirror::{GitMirror, MirrorError};

/// Maps repository urls to their mirrors below `<cache>/mirrors`.
pub struct MirrorRegistry {
    config: GitcacheConfig,
    database: Database,
    mirrors_dir: PathBuf,
}

impl MirrorRegistry {
    pub fn new(config: GitcacheConfig) -> Result<MirrorRegistry, MirrorError> {
        let location = &config.cache_dir;
        if location.exists() {
            if !location.is_dir() {
                return Err(MirrorError::BadLocation {
                    location: location.display().to_string(),
                });
            }
        } else {
            std::fs::create_dir_all(location)?;
        }

        let database = Database::new(
            config.database_path(),
            config.database_lock_path(),
            config.lock_timeout,
        );
        let mirrors_dir = config.mirrors_dir();
        Ok(MirrorRegistry {
            config,
            database,
            mirrors_dir,
        })
    }

    pub fn config(&self) -> &GitcacheConfig {
        &self.config
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn mirrors_dir(&self) -> &Path {
        &self.mirrors_dir
    }

    pub fn mirror_path(&self, url: &str) -> Result<PathBuf, IdentityError> {
        Ok(self
            .mirrors_dir
            .join(RepositoryIdentity::parse(url)?.to_path()))
    }

    fn mirror(&self, url: &str) -> Result<GitMirror<'_>, IdentityError> {
        let identity = RepositoryIdentity::parse(url)?;
        let path = self.mirrors_dir.join(identity.to_path());
        Ok(GitMirror::new(self, url.trim().to_string(), path))
    }

    /// The mirror of `url`, cloning the upstream repository if there is none yet.
    pub fn resolve(&self, url: &str) -> Result<GitMirror<'_>, MirrorError> {
        let mirror = self.mirror(url)?;
        if mirror.is_ready() {
            trace!("Using the existing mirror {}", mirror.path().display());
        } else {
            mirror.create()?;
        }
        Ok(mirror)
    }

    /// The mirror of `url` if it already exists.
    pub fn find(&self, url: &str) -> Result<Option<GitMirror<'_>>, MirrorError> {
        let mirror = self.mirror(url)?;
        Ok(mirror.is_ready().then_some(mirror))
    }

    /// Whether `url` points into the mirror storage, as the origin of a clone made through the cache does.
    pub fn is_mirror_path(&self, url: &str) -> bool {
        let path = Path::new(url.strip_prefix("file://").unwrap_or(url));
        if !path.is_absolute() {
            return false;
        }
        if path.starts_with(&self.mirrors_dir) {
            return true;
        }
        match (path.canonicalize(), self.mirrors_dir.canonicalize()) {
            (Ok(path), Ok(mirrors_dir)) => path.starts_with(mirrors_dir),
            _ => false,
        }
    }

    /// The mirror whose bare repository `url` points to.
    pub fn find_by_mirror_url(&self, url: &str) -> Result<Option<GitMirror<'_>>, MirrorError> {
        if !self.is_mirror_path(url) {
            return Ok(None);
        }
        let git_dir = Path::new(url.strip_prefix("file://").unwrap_or(url));
        let Some(mirror_path) = git_dir.parent() else {
            return Ok(None);
        };
        let record = self.database.get(mirror_path)?.or_else(|| {
            let canonical = mirror_path.canonicalize().ok()?;
            self.database.get(&canonical).ok().flatten()
        });
        match record {
            Some(record) => {
                debug!("{} is the mirror of {}", url, record.url);
                self.find(&record.url)
            }
            None => Ok(None),
        }
    }

    /// Whether git operations on `url` should go through the cache.
    pub fn is_cacheable(&self, url: &str) -> bool {
        RepositoryIdentity::parse(url).is_ok() && self.config.url_patterns.matches(url)
    }

    /// All mirrors with a usage record, keyed by mirror path.
    pub fn mirrors(&self) -> Result<Vec<(PathBuf, UsageRecord)>, MirrorError> {
        Ok(self
            .database
            .records()?
            .into_iter()
            .map(|(path, record)| (PathBuf::from(path), record))
            .collect())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::UrlPatterns;
    use crate::testing::FakeGit;

    use pretty_assertions::assert_eq;

    #[test]
    fn paths_are_deterministic() {
        let git = FakeGit::new();
        let first = MirrorRegistry::new(git.config()).unwrap();
        let second = MirrorRegistry::new(git.config()).unwrap();
        assert_eq!(
            first.mirror_path("https://github.com/org/repo").unwrap(),
            second.mirror_path("git@github.com:org/repo.git").unwrap()
        );
        assert_eq!(
            first.mirror_path("https://github.com:8443/org/repo").unwrap(),
            git.cache_dir().join("mirrors/github.com_8443/org/repo")
        );
    }

    #[test]
    fn find_does_not_create() {
        let git = FakeGit::new();
        let registry = MirrorRegistry::new(git.config()).unwrap();
        assert!(registry
            .find("https://github.com/org/repo")
            .unwrap()
            .is_none());
        assert!(git.calls().is_empty());
    }

    #[test]
    fn local_urls_are_not_cacheable() {
        let git = FakeGit::new();
        let registry = MirrorRegistry::new(git.config()).unwrap();
        assert!(registry.is_cacheable("https://github.com/org/repo"));
        assert!(!registry.is_cacheable("/srv/git/repo"));
        assert!(!registry.is_cacheable(""));
        assert!(matches!(
            registry.resolve("./repo"),
            Err(MirrorError::Identity(IdentityError::LocalPath(_)))
        ));
    }

    #[test]
    fn url_patterns_limit_caching() {
        let git = FakeGit::new();
        let mut config = git.config();
        config.url_patterns = UrlPatterns::new(".*", Some(".*/github\\.com/.*")).unwrap();
        let registry = MirrorRegistry::new(config).unwrap();
        assert!(!registry.is_cacheable("https://github.com/org/repo"));
        assert!(registry.is_cacheable("https://gitlab.com/org/repo"));
    }

    #[test]
    fn mirror_urls_lead_back_to_the_mirror() {
        let git = FakeGit::new();
        let registry = MirrorRegistry::new(git.config()).unwrap();
        let url = "https://github.com/org/repo.git";
        let git_dir = registry.resolve(url).unwrap().git_dir();
        let git_dir = git_dir.to_str().unwrap();

        assert!(registry.is_mirror_path(git_dir));
        assert!(!registry.is_mirror_path(url));
        assert!(!registry.is_mirror_path("/srv/git/repo"));

        let mirror = registry.find_by_mirror_url(git_dir).unwrap().unwrap();
        assert_eq!(mirror.url(), url);
        assert!(registry.find_by_mirror_url(url).unwrap().is_none());

        let mirrors = registry.mirrors().unwrap();
        assert_eq!(mirrors.len(), 1);
        assert_eq!(mirrors[0].1.url, url);
    }
}
