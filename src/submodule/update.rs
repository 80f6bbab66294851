use std::path::{Component, Path, PathBuf};

use log::{debug, info, warn};
#[cfg(test)]
use mockall::automock;

use crate::command::CommandOutput;

use super::{
    recovery::missing_commit, resolve_submodule_url, SubmoduleDeclaration, SubmoduleError,
};

/// The git operations a submodule update is made of.
#[cfg_attr(test, automock)]
pub trait SubmoduleTransport {
    /// Runs the real `submodule init` for `paths` (all when empty).
    fn init(&self, workdir: &Path, paths: &[PathBuf]) -> anyhow::Result<i32>;

    fn read_manifest(&self, workdir: &Path) -> Result<Vec<SubmoduleDeclaration>, SubmoduleError>;

    /// The upstream url of the repository checked out in `workdir`.
    fn parent_url(&self, workdir: &Path) -> Option<String>;

    /// Clones `url` through the cache into `path` below `workdir`.
    fn clone_into(&self, url: &str, workdir: &Path, path: &str) -> anyhow::Result<i32>;

    /// Fetches through the cache inside an existing submodule checkout.
    fn fetch_in(&self, checkout: &Path) -> anyhow::Result<i32>;

    /// Runs the real `submodule update [--remote] -- <path>` once.
    fn update_checkout(
        &self,
        workdir: &Path,
        path: &str,
        remote: bool,
    ) -> anyhow::Result<CommandOutput>;

    /// Fetches one commit from `url` into the checkout, bypassing the cache.
    fn fetch_commit(&self, checkout: &Path, url: &str, commit: &str) -> anyhow::Result<i32>;

    fn checkout_commit(&self, checkout: &Path, commit: &str) -> anyhow::Result<i32>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmoduleUpdate {
    pub init: bool,
    pub recursive: bool,
    pub remote: bool,
    /// Submodule paths to update, all when empty.
    pub paths: Vec<PathBuf>,
}

/// Checkouts of submodules, by outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub updated: Vec<PathBuf>,
    pub recovered: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
    /// Checkouts whose own submodules could not be initialized or listed.
    pub incomplete: Vec<PathBuf>,
}

impl UpdateReport {
    fn merge(&mut self, other: UpdateReport) {
        self.updated.extend(other.updated);
        self.recovered.extend(other.recovered);
        self.failed.extend(other.failed);
        self.incomplete.extend(other.incomplete);
    }
}

/// Brings the submodules of the checkout in `workdir` up to date through the cache.
///
/// A failing submodule is recorded in the report and does not stop its
/// siblings. Only a failing init or an unreadable manifest is an error.
pub fn update_submodules<T: SubmoduleTransport + ?Sized>(
    transport: &T,
    workdir: &Path,
    request: &SubmoduleUpdate,
) -> Result<UpdateReport, SubmoduleError> {
    let targets: Vec<PathBuf> = request
        .paths
        .iter()
        .map(|path| relative_to(path, workdir))
        .collect();

    if request.init {
        let code = transport.init(workdir, &targets)?;
        if code != 0 {
            return Err(SubmoduleError::Init { code });
        }
    }

    let declarations = transport.read_manifest(workdir)?;
    let parent_url = transport.parent_url(workdir);
    debug!(
        "Parent url of {} is {:?}",
        workdir.display(),
        parent_url.as_deref()
    );

    let mut report = UpdateReport::default();
    for declaration in declarations {
        if !targets.is_empty() && !targets.contains(&PathBuf::from(&declaration.path)) {
            debug!("Skipping submodule {}", declaration.path);
            continue;
        }
        let checkout = workdir.join(&declaration.path);
        match update_submodule(
            transport,
            workdir,
            &declaration,
            parent_url.as_deref(),
            request,
        ) {
            Ok(nested) => report.merge(nested),
            Err(error) => {
                warn!("Updating the submodule {} failed: {}", declaration.path, error);
                report.failed.push(checkout);
            }
        }
    }
    Ok(report)
}

fn update_submodule<T: SubmoduleTransport + ?Sized>(
    transport: &T,
    workdir: &Path,
    declaration: &SubmoduleDeclaration,
    parent_url: Option<&str>,
    request: &SubmoduleUpdate,
) -> Result<UpdateReport, SubmoduleError> {
    let url = resolve_submodule_url(parent_url, &declaration.url)?;
    let checkout = workdir.join(&declaration.path);
    let mut report = UpdateReport::default();

    let code = if checkout.join(".git").exists() {
        info!("Fetching submodule {} from {}", declaration.path, url);
        transport.fetch_in(&checkout)?
    } else {
        info!("Cloning submodule {} from {}", declaration.path, url);
        transport.clone_into(&url, workdir, &declaration.path)?
    };
    if code != 0 {
        warn!(
            "Getting submodule {} through the cache failed with exit code {}",
            declaration.path, code
        );
    }

    let output = transport.update_checkout(workdir, &declaration.path, request.remote)?;
    if let Some(commit) = missing_commit(&output.stdout, &output.stderr) {
        info!(
            "Fetching the missing commit {} of {} directly from {}",
            commit, declaration.path, url
        );
        if transport.fetch_commit(&checkout, &url, &commit)? == 0
            && transport.checkout_commit(&checkout, &commit)? == 0
        {
            let retried = transport.update_checkout(workdir, &declaration.path, request.remote)?;
            if retried.success() {
                report.recovered.push(checkout.clone());
            } else {
                report.failed.push(checkout.clone());
            }
        } else {
            report.failed.push(checkout.clone());
        }
    } else if output.success() {
        report.updated.push(checkout.clone());
    } else {
        warn!(
            "Updating the checkout of submodule {} failed with exit code {}",
            declaration.path, output.exit_code
        );
        report.failed.push(checkout.clone());
    }

    if request.recursive && checkout.join(".gitmodules").exists() {
        let nested = SubmoduleUpdate {
            paths: Vec::new(),
            ..request.clone()
        };
        match update_submodules(transport, &checkout, &nested) {
            Ok(nested) => report.merge(nested),
            Err(error) => {
                warn!(
                    "Updating the submodules of {} failed: {}",
                    declaration.path, error
                );
                report.incomplete.push(checkout.clone());
            }
        }
    }
    Ok(report)
}

fn relative_to(path: &Path, workdir: &Path) -> PathBuf {
    let path = path.strip_prefix(workdir).unwrap_or(path);
    path.components()
        .filter(|component| *component != Component::CurDir)
        .collect()
}
