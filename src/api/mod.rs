use std::path::{Path, PathBuf};

use crate::{
    cli::command_handlers::{do_info, do_update_mirrors, handle_git_command},
    config::GitcacheConfig,
    database::UsageRecord,
    git::cache::MirrorRegistry,
};

mod builder;

pub use builder::GitcacheBuilder;

pub struct Gitcache {
    registry: MirrorRegistry,
}

impl Gitcache {
    pub fn builder() -> GitcacheBuilder {
        GitcacheBuilder::default()
    }

    /// Runs one git invocation through the cache and returns the exit code git reported
    pub fn run(&self, args: &[String], cwd: impl AsRef<Path>) -> anyhow::Result<i32> {
        handle_git_command(&self.registry, args, cwd.as_ref())
    }

    /// Updates every recorded mirror
    pub fn update_mirrors(&self) -> anyhow::Result<i32> {
        do_update_mirrors(&self.registry)
    }

    /// Usage records of all mirrors
    pub fn info(&self) -> anyhow::Result<Vec<(PathBuf, UsageRecord)>> {
        do_info(&self.registry)
    }

    pub fn config(&self) -> &GitcacheConfig {
        self.registry.config()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testing::FakeGit;

    use pretty_assertions::assert_eq;

    #[test]
    fn run_through_the_api() {
        let git = FakeGit::new();
        let gitcache = Gitcache::builder().config(git.config()).try_build().unwrap();
        let cwd = tempfile::tempdir().unwrap();

        let args = ["clone", "https://github.com/org/repo", "work"].map(String::from);
        assert_eq!(gitcache.run(&args, cwd.path()).unwrap(), 0);
        assert_eq!(gitcache.update_mirrors().unwrap(), 0);

        let info = gitcache.info().unwrap();
        assert_eq!(info.len(), 1);
        assert_eq!(info[0].1.clones, 1);
        assert_eq!(info[0].1.mirror_updates, 1);
    }

    #[test]
    fn builder_overrides() {
        let git = FakeGit::new();
        let other = tempfile::tempdir().unwrap();
        let gitcache = Gitcache::builder()
            .config(git.config())
            .cache_directory(other.path())
            .real_git("/opt/git/bin/git")
            .try_build()
            .unwrap();
        assert_eq!(gitcache.config().cache_dir, other.path());
        assert_eq!(gitcache.config().real_git, PathBuf::from("/opt/git/bin/git"));
    }
}
