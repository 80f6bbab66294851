//! Test helpers: a fake `git` executable backed by a template bare repository.

use std::{
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
};

use git2::{Repository, Signature};
use tempfile::TempDir;

use crate::config::GitcacheConfig;

/// A shell script standing in for git.
///
/// Every call is appended to `calls.log` as `<cwd>|<args>`. `clone --mirror`
/// copies the template repository to the destination, any other clone creates
/// an empty destination directory and `config -f <file>` prints the file. A
/// file `fail-<word>` in the fake's directory makes every call containing
/// `<word>` exit with 3.
pub struct FakeGit {
    pub dir: TempDir,
}

impl FakeGit {
    pub fn new() -> Self {
        Self::with_template_files(&[("README.md", "hello\n")])
    }

    pub fn with_template_files(files: &[(&str, &str)]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template.git");
        create_template(&template, files);

        let script = format!(
            r#"#!/bin/sh
echo "$(pwd)|$*" >> "{root}/calls.log"
for marker in "{root}"/fail-*; do
  [ -e "$marker" ] || continue
  word="${{marker##*/fail-}}"
  case " $* " in
    *" $word "*) exit 3 ;;
  esac
done
for last; do :; done
if [ "$1" = "clone" ] && [ "$2" = "--mirror" ]; then
  cp -R "{template}" "$last"
elif [ "$1" = "config" ] && [ "$2" = "-f" ]; then
  cat "$3"
else
  case " $* " in
    *" clone "*) mkdir -p "$last" ;;
  esac
fi
exit 0
"#,
            root = dir.path().display(),
            template = template.display(),
        );
        let path = dir.path().join("git");
        std::fs::write(&path, script).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        std::fs::create_dir(dir.path().join("cache")).unwrap();
        Self { dir }
    }

    pub fn program(&self) -> PathBuf {
        self.dir.path().join("git")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.dir.path().join("cache")
    }

    pub fn config(&self) -> GitcacheConfig {
        let mut config = GitcacheConfig::with_cache_dir(self.cache_dir()).unwrap();
        config.real_git = self.program();
        config
    }

    pub fn fail(&self, word: &str) {
        std::fs::write(self.dir.path().join(format!("fail-{word}")), "").unwrap();
    }

    /// Arguments of every call, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls_with_cwd()
            .into_iter()
            .map(|(_, args)| args)
            .collect()
    }

    pub fn calls_with_cwd(&self) -> Vec<(PathBuf, String)> {
        std::fs::read_to_string(self.dir.path().join("calls.log"))
            .unwrap_or_default()
            .lines()
            .filter_map(|line| line.split_once('|'))
            .map(|(cwd, args)| (PathBuf::from(cwd), args.to_string()))
            .collect()
    }
}

/// A bare repository whose `HEAD` is `refs/heads/trunk` with one commit of `files`.
pub fn create_template(path: &Path, files: &[(&str, &str)]) {
    let repository = Repository::init_bare(path).unwrap();
    let mut builder = repository.treebuilder(None).unwrap();
    for (name, content) in files {
        let blob = repository.blob(content.as_bytes()).unwrap();
        builder.insert(name, blob, 0o100644).unwrap();
    }
    let tree_id = builder.write().unwrap();
    let tree = repository.find_tree(tree_id).unwrap();
    let signature = Signature::now("Test", "test@example.com").unwrap();
    repository
        .commit(
            Some("refs/heads/trunk"),
            &signature,
            &signature,
            "Initial commit",
            &tree,
            &[],
        )
        .unwrap();
    repository.set_head("refs/heads/trunk").unwrap();
}
