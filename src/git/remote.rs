use std::path::Path;

use git2::Repository;
use log::{debug, trace};

use super::cache::MirrorRegistry;

const ORIGIN: &str = "origin";

fn open(run_path: &Path) -> Option<Repository> {
    match Repository::discover(run_path) {
        Ok(repository) => Some(repository),
        Err(error) => {
            trace!("No repository at {}: {}", run_path.display(), error);
            None
        }
    }
}

/// The fetch url of the remote `name` of the repository at `run_path`.
pub fn remote_url(run_path: &Path, name: &str) -> Option<String> {
    let repository = open(run_path)?;
    let remote = repository.find_remote(name).ok()?;
    remote.url().map(str::to_string)
}

/// The push url of the remote `name`, which defaults to its fetch url.
pub fn remote_push_url(run_path: &Path, name: &str) -> Option<String> {
    let repository = open(run_path)?;
    let remote = repository.find_remote(name).ok()?;
    remote.pushurl().or(remote.url()).map(str::to_string)
}

/// The url `origin` pulls from.
pub fn pull_url(run_path: &Path) -> Option<String> {
    remote_url(run_path, ORIGIN)
}

/// The upstream url behind the remote `name` if that remote points into the mirror storage.
///
/// The push url of the remote is the upstream url; without one the usage
/// record of the mirror tells.
pub fn upstream_url(registry: &MirrorRegistry, run_path: &Path, name: &str) -> Option<String> {
    let url = remote_url(run_path, name)?;
    if !registry.is_mirror_path(&url) {
        return None;
    }
    match remote_push_url(run_path, name) {
        Some(push_url) if !registry.is_mirror_path(&push_url) => Some(push_url),
        _ => match registry.find_by_mirror_url(&url) {
            Ok(mirror) => mirror.map(|mirror| mirror.url().to_string()),
            Err(error) => {
                debug!("Cannot find the mirror of {}: {}", url, error);
                None
            }
        },
    }
}

/// The upstream url of a checkout whose `origin` points into the mirror storage.
pub fn mirror_url(registry: &MirrorRegistry, run_path: &Path) -> Option<String> {
    upstream_url(registry, run_path, ORIGIN)
}

/// The short name of the branch checked out at `run_path`.
pub fn current_branch(run_path: &Path) -> Option<String> {
    let repository = open(run_path)?;
    let head = repository.head().ok()?;
    if !head.is_branch() {
        return None;
    }
    head.shorthand().map(str::to_string)
}
