use std::path::{Path, PathBuf};

use anyhow::Context;
use log::{debug, error, info, warn};

use crate::{
    command::{call_command, CommandOutput, RetryCommand},
    database::{Counter, UsageRecord},
    git::{
        cache::MirrorRegistry,
        mirror::{GitMirror, MirrorError},
        remote::{current_branch, mirror_url, pull_url, upstream_url},
    },
    model::options::{GitCommand, GitOptions},
    submodule::{
        parse_manifest_listing, resolve_submodule_url,
        update::{update_submodules, SubmoduleTransport, SubmoduleUpdate},
        SubmoduleDeclaration, SubmoduleError,
    },
};

const DEFAULT_REMOTE: &str = "origin";
const UPDATE_MIRRORS_COMMAND: &str = "update-mirrors";

/// Handles one invocation of git and returns the exit code to report.
pub fn handle_git_command(
    registry: &MirrorRegistry,
    args: &[String],
    cwd: &Path,
) -> anyhow::Result<i32> {
    let options = GitOptions::parse(args.iter().cloned());
    debug!(
        "Global options {:?}, command {:?}, command options {:?}, arguments {:?}",
        options.global_options, options.command, options.command_options, options.command_args
    );

    let result = match options.command() {
        None => call_real_git(registry, options.all_args(), cwd),
        Some(GitCommand::Clone) => do_clone(registry, &options, cwd),
        Some(GitCommand::Fetch) => do_fetch(registry, &options, cwd),
        Some(GitCommand::Pull) => do_pull(registry, &options, cwd),
        Some(GitCommand::SubmoduleUpdate) => do_submodule_update(registry, options.clone(), cwd),
        Some(GitCommand::SubmoduleInit) => do_submodule_init(registry, &options, cwd),
        Some(GitCommand::RemoteAdd) => do_remote_add(registry, &options, cwd),
        Some(GitCommand::LsRemote) => do_ls_remote(registry, &options, cwd),
        Some(GitCommand::Checkout) => do_checkout(registry, &options, cwd),
        Some(GitCommand::LfsFetch) | Some(GitCommand::LfsPull) => do_lfs(registry, &options, cwd),
        Some(GitCommand::Other(command)) if command == UPDATE_MIRRORS_COMMAND => {
            do_update_mirrors(registry)
        }
        Some(GitCommand::Other(command)) => {
            debug!("Command {} is not handled by the cache", command);
            call_real_git(registry, options.all_args(), cwd)
        }
    };

    match result {
        Err(error) => match failure_exit_code(&error) {
            Some(code) => {
                error!("{:#}", error);
                Ok(code)
            }
            None => Err(error),
        },
        result => result,
    }
}

fn failure_exit_code(error: &anyhow::Error) -> Option<i32> {
    error
        .downcast_ref::<MirrorError>()
        .and_then(MirrorError::exit_code)
        .or_else(|| {
            error
                .downcast_ref::<SubmoduleError>()
                .and_then(SubmoduleError::exit_code)
        })
}

fn call_real_git<S: AsRef<std::ffi::OsStr>>(
    registry: &MirrorRegistry,
    args: &[S],
    cwd: &Path,
) -> anyhow::Result<i32> {
    Ok(call_command(&registry.config().real_git, args, cwd)?)
}

fn real_git(registry: &MirrorRegistry) -> RetryCommand {
    RetryCommand::new(&registry.config().real_git).forward_output(true)
}

/// The mirror of `url`, updated if it existed before.
fn updated_mirror<'a>(registry: &'a MirrorRegistry, url: &str) -> anyhow::Result<GitMirror<'a>> {
    match registry.find(url)? {
        Some(mirror) => {
            mirror.update()?;
            Ok(mirror)
        }
        None => Ok(registry.resolve(url)?),
    }
}

/// Handler to clone command
///
/// Clones from the mirror of the url and points pushes and large objects at the upstream repository.
/// Submodules requested with `--recursive` are cloned through the cache afterwards.
pub fn do_clone(registry: &MirrorRegistry, options: &GitOptions, cwd: &Path) -> anyhow::Result<i32> {
    let Some(url) = options.command_args.first() else {
        return call_real_git(registry, options.all_args(), cwd);
    };
    if !registry.is_cacheable(url) {
        debug!("{} is not cached", url);
        return call_real_git(registry, options.all_args(), cwd);
    }

    let run_path = options.run_path(cwd);
    let mirror = updated_mirror(registry, url)?;
    registry
        .database()
        .increment_counter(mirror.path(), Counter::Clones)?;

    // Relative submodule urls would resolve against the mirror directory.
    let recurse_paths = options
        .option_value(&["--recurse-submodules"])
        .filter(|_| !options.has_flag("recurse-submodules"))
        .map(|pathspec| vec![pathspec.to_string()]);
    let recurse = options.has_flag("recursive")
        || options.has_flag("recurse-submodules")
        || recurse_paths.is_some();
    let mut options = options.clone();
    options.strip_option("--recursive");
    options.strip_option("--recurse-submodules");

    let lfs_url = format!("{}/info/lfs", mirror.url());
    let git_dir = mirror.git_dir().to_string_lossy().into_owned();
    let mut args = options.global_options.clone();
    args.push("-c".to_string());
    args.push(format!("lfs.url={lfs_url}"));
    args.extend(
        options
            .command_line
            .iter()
            .map(|arg| if arg == url { git_dir.clone() } else { arg.clone() }),
    );

    info!("Cloning {} from the mirror {}", url, mirror.path().display());
    let output = real_git(registry)
        .args(&args)
        .current_dir(&run_path)
        .run(&registry.config().clone)?;
    if !output.success() {
        return Ok(output.exit_code);
    }

    let checkout = run_path.join(match options.command_args.get(1) {
        Some(directory) => directory.clone(),
        None => default_clone_directory(url),
    });
    if !checkout.is_dir() {
        warn!("Cannot find the clone of {} in {}", url, checkout.display());
        return Ok(0);
    }
    let remote = options
        .option_value(&["-o", "--origin"])
        .unwrap_or(DEFAULT_REMOTE);
    let code = call_real_git(
        registry,
        &["remote", "set-url", "--push", remote, mirror.push_url()],
        &checkout,
    )?;
    if code != 0 {
        warn!("Could not set the push url of {} in {}", remote, checkout.display());
    }
    let code = call_real_git(
        registry,
        &["config", "--local", "lfs.url", lfs_url.as_str()],
        &checkout,
    )?;
    if code != 0 {
        warn!("Could not configure lfs.url in {}", checkout.display());
    }

    if !recurse {
        return Ok(0);
    }
    let mut submodule_args = args_of(&["submodule", "update", "--init", "--recursive"]);
    if let Some(paths) = recurse_paths {
        submodule_args.push("--".to_string());
        submodule_args.extend(paths);
    }
    do_submodule_update(registry, GitOptions::parse(submodule_args), &checkout)
}

fn args_of(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

/// The directory git clones `url` into when none is given.
fn default_clone_directory(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let url = url.strip_suffix("/.git").unwrap_or(url);
    let url = url.strip_suffix(".git").unwrap_or(url);
    url.rsplit(['/', ':']).next().unwrap_or(url).to_string()
}

/// Handler to fetch command
pub fn do_fetch(registry: &MirrorRegistry, options: &GitOptions, cwd: &Path) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let update_policy = registry.config().update;

    let explicit_url = options
        .command_args
        .first()
        .filter(|arg| registry.is_cacheable(arg));
    let upstream = match explicit_url {
        Some(url) => Some(url.clone()),
        None => {
            let remote = options
                .command_args
                .first()
                .map(String::as_str)
                .unwrap_or(DEFAULT_REMOTE);
            upstream_url(registry, &run_path, remote)
        }
    };

    let Some(upstream) = upstream else {
        debug!("Fetching without the cache");
        let output = real_git(registry)
            .args(options.args_without_run_paths())
            .current_dir(&run_path)
            .run(&update_policy)?;
        return Ok(output.exit_code);
    };

    let mirror = updated_mirror(registry, &upstream)?;
    registry
        .database()
        .increment_counter(mirror.path(), Counter::Updates)?;

    let args = match explicit_url {
        Some(url) => options.args_with_replaced_arg(url, &mirror.git_dir().to_string_lossy()),
        None => options.args_without_run_paths(),
    };

    let lfs_url = format!("{}/info/lfs", mirror.url());
    if call_real_git(
        registry,
        &["config", "--local", "lfs.url", lfs_url.as_str()],
        &run_path,
    )? != 0
    {
        debug!("Could not configure lfs.url in {}", run_path.display());
    }

    let output = real_git(registry)
        .args(&args)
        .current_dir(&run_path)
        .run(&update_policy.without_retries())?;
    if output.success() {
        return Ok(0);
    }

    let refs = options.command_args.iter().skip(1).collect::<Vec<_>>();
    if !refs.is_empty() {
        info!("Fetching the requested refs into the mirror {}", mirror.path().display());
        if let Err(error) = mirror.fetch_refs(&refs) {
            warn!("{}", error);
        }
    }
    let output = real_git(registry)
        .args(&args)
        .current_dir(&run_path)
        .run(&update_policy)?;
    Ok(output.exit_code)
}

/// Handler to pull command
pub fn do_pull(registry: &MirrorRegistry, options: &GitOptions, cwd: &Path) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let Some(upstream) = mirror_url(registry, &run_path) else {
        debug!("Repository at {} is not managed by the cache", run_path.display());
        return call_real_git(registry, options.all_args(), cwd);
    };

    let mirror = updated_mirror(registry, &upstream)?;
    registry
        .database()
        .increment_counter(mirror.path(), Counter::Updates)?;

    if let Some(branch) = current_branch(&run_path) {
        if Some(&branch) != mirror.get_default_ref()?.as_ref() {
            if let Err(error) = mirror.fetch_lfs(&branch) {
                warn!("{}", error);
            }
        }
    }

    let output = real_git(registry)
        .args(options.args_without_run_paths())
        .current_dir(&run_path)
        .run(&registry.config().update)?;
    Ok(output.exit_code)
}

/// Handler to submodule update command
///
/// Every selected submodule is cloned or fetched through the cache before
/// the real `submodule update` fixes up the checkouts.
pub fn do_submodule_update(
    registry: &MirrorRegistry,
    mut options: GitOptions,
    cwd: &Path,
) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let request = SubmoduleUpdate {
        init: options.has_flag("init"),
        recursive: options.has_flag("recursive"),
        remote: options.has_flag("remote"),
        paths: options.command_args.iter().map(PathBuf::from).collect(),
    };

    let transport = CachedTransport { registry };
    let report = update_submodules(&transport, &run_path, &request)?;
    debug!("Submodule update report: {:?}", report);
    for failed in &report.failed {
        warn!("Submodule {} was not updated through the cache", failed.display());
    }
    for incomplete in &report.incomplete {
        warn!("Nested submodules of {} were not updated through the cache", incomplete.display());
    }

    options.strip_option("--init");
    call_real_git(registry, options.all_args(), cwd)
}

/// Handler to remote add command
pub fn do_remote_add(
    registry: &MirrorRegistry,
    options: &GitOptions,
    cwd: &Path,
) -> anyhow::Result<i32> {
    let (Some(name), Some(url)) = (options.command_args.first(), options.command_args.get(1))
    else {
        return call_real_git(registry, options.all_args(), cwd);
    };
    if !registry.is_cacheable(url) {
        return call_real_git(registry, options.all_args(), cwd);
    }

    let run_path = options.run_path(cwd);
    let mirror = registry.resolve(url)?;
    let args = options.args_with_replaced_arg(url, &mirror.git_dir().to_string_lossy());
    let code = call_real_git(registry, &args, &run_path)?;
    if code != 0 {
        return Ok(code);
    }
    call_real_git(
        registry,
        &["remote", "set-url", "--push", name.as_str(), mirror.push_url()],
        &run_path,
    )
}

/// Handler to submodule init command
///
/// In a checkout cloned through the cache, relative submodule urls are
/// registered against the upstream url instead of the mirror directory.
pub fn do_submodule_init(
    registry: &MirrorRegistry,
    options: &GitOptions,
    cwd: &Path,
) -> anyhow::Result<i32> {
    let code = call_real_git(registry, options.all_args(), cwd)?;
    if code != 0 {
        return Ok(code);
    }

    let run_path = options.run_path(cwd);
    let Some(upstream) = mirror_url(registry, &run_path) else {
        return Ok(0);
    };
    let transport = CachedTransport { registry };
    let paths: Vec<&str> = options.command_args.iter().map(String::as_str).collect();
    for declaration in transport.read_manifest(&run_path)? {
        if !paths.is_empty() && !paths.contains(&declaration.path.as_str()) {
            continue;
        }
        let url = resolve_submodule_url(Some(upstream.as_str()), &declaration.url)?;
        if url == declaration.url {
            continue;
        }
        debug!("Registering submodule {} with url {}", declaration.name, url);
        let key = format!("submodule.{}.url", declaration.name);
        let code = call_real_git(registry, &["config", key.as_str(), url.as_str()], &run_path)?;
        if code != 0 {
            return Ok(code);
        }
    }
    Ok(0)
}

/// Handler to ls-remote command
pub fn do_ls_remote(
    registry: &MirrorRegistry,
    options: &GitOptions,
    cwd: &Path,
) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let explicit_url = options
        .command_args
        .first()
        .filter(|arg| registry.is_cacheable(arg));
    let upstream = match explicit_url {
        Some(url) => Some(url.clone()),
        None => {
            let remote = options
                .command_args
                .first()
                .map(String::as_str)
                .unwrap_or(DEFAULT_REMOTE);
            upstream_url(registry, &run_path, remote)
        }
    };
    let Some(upstream) = upstream else {
        return call_real_git(registry, options.all_args(), cwd);
    };

    let mirror = updated_mirror(registry, &upstream)?;
    let args = match explicit_url {
        Some(url) => options.args_with_replaced_arg(url, &mirror.git_dir().to_string_lossy()),
        None => options.args_without_run_paths(),
    };
    call_real_git(registry, &args, &run_path)
}

/// Handler to checkout command
///
/// A checkout of a ref the checkout does not know yet fetches it into the
/// mirror and from there, then tries again.
pub fn do_checkout(
    registry: &MirrorRegistry,
    options: &GitOptions,
    cwd: &Path,
) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let Some(upstream) = mirror_url(registry, &run_path) else {
        return call_real_git(registry, options.all_args(), cwd);
    };

    let args = options.args_without_run_paths();
    let update_policy = registry.config().update;
    let output = real_git(registry)
        .args(&args)
        .current_dir(&run_path)
        .run(&update_policy.without_retries())?;
    if output.success() {
        return Ok(0);
    }

    let mirror = updated_mirror(registry, &upstream)?;
    registry
        .database()
        .increment_counter(mirror.path(), Counter::Updates)?;
    if let Some(git_ref) = options.command_args.first() {
        let remote_prefix = format!("{DEFAULT_REMOTE}/");
        let git_ref = git_ref.strip_prefix(&remote_prefix).unwrap_or(git_ref);
        if let Err(error) = mirror.fetch_refs(&[git_ref]) {
            warn!("{}", error);
        }
    }
    let output = real_git(registry)
        .args(["fetch", DEFAULT_REMOTE])
        .current_dir(&run_path)
        .run(&update_policy)?;
    if !output.success() {
        warn!("Fetching from the mirror into {} failed", run_path.display());
    }

    let output = real_git(registry)
        .args(&args)
        .current_dir(&run_path)
        .run(&update_policy.without_retries())?;
    Ok(output.exit_code)
}

/// Handler to lfs fetch and lfs pull commands
///
/// The mirror gets the large objects of the requested refs, or of the
/// current branch, before the real command runs.
pub fn do_lfs(registry: &MirrorRegistry, options: &GitOptions, cwd: &Path) -> anyhow::Result<i32> {
    let run_path = options.run_path(cwd);
    let Some(upstream) = mirror_url(registry, &run_path) else {
        return call_real_git(registry, options.all_args(), cwd);
    };

    let mirror = updated_mirror(registry, &upstream)?;
    registry
        .database()
        .increment_counter(mirror.path(), Counter::Updates)?;
    let mut refs: Vec<String> = options.command_args.iter().skip(1).cloned().collect();
    if refs.is_empty() {
        refs.extend(current_branch(&run_path));
    }
    for git_ref in &refs {
        if let Err(error) = mirror.fetch_lfs(git_ref) {
            warn!("{}", error);
        }
    }

    let output = real_git(registry)
        .args(options.args_without_run_paths())
        .current_dir(&run_path)
        .run(&registry.config().lfs)?;
    Ok(output.exit_code)
}

/// Handler to update-mirrors command
///
/// Returns the exit code of the last failed update, 0 when all succeed.
pub fn do_update_mirrors(registry: &MirrorRegistry) -> anyhow::Result<i32> {
    let mut exit_code = 0;
    for (path, record) in registry.mirrors()? {
        let mirror = match registry.find(&record.url) {
            Ok(Some(mirror)) => mirror,
            Ok(None) => {
                warn!("Mirror {} of {} is missing", path.display(), record.url);
                continue;
            }
            Err(error) => {
                warn!("{}", error);
                exit_code = 1;
                continue;
            }
        };
        if let Err(error) = mirror.update() {
            error!("{}", error);
            exit_code = error.exit_code().unwrap_or(1);
        }
    }
    Ok(exit_code)
}

/// Handler to info command
pub fn do_info(registry: &MirrorRegistry) -> anyhow::Result<Vec<(PathBuf, UsageRecord)>> {
    registry
        .mirrors()
        .context("Could not read the usage records")
}

/// Submodule operations that go through the cache handlers.
struct CachedTransport<'a> {
    registry: &'a MirrorRegistry,
}

impl SubmoduleTransport for CachedTransport<'_> {
    fn init(&self, workdir: &Path, paths: &[PathBuf]) -> anyhow::Result<i32> {
        let mut args = args_of(&["submodule", "init"]);
        args.extend(paths.iter().map(|path| path.to_string_lossy().into_owned()));
        do_submodule_init(self.registry, &GitOptions::parse(args), workdir)
    }

    fn read_manifest(&self, workdir: &Path) -> Result<Vec<SubmoduleDeclaration>, SubmoduleError> {
        if !workdir.join(".gitmodules").is_file() {
            return Ok(Vec::new());
        }
        let output = RetryCommand::new(&self.registry.config().real_git)
            .args(["config", "-f", ".gitmodules", "-l"])
            .current_dir(workdir)
            .run(&self.registry.config().update.without_retries())
            .map_err(anyhow::Error::from)?;
        if !output.success() {
            return Err(SubmoduleError::Manifest {
                workdir: workdir.display().to_string(),
                code: output.exit_code,
            });
        }
        Ok(parse_manifest_listing(&output.stdout_lossy()))
    }

    fn parent_url(&self, workdir: &Path) -> Option<String> {
        mirror_url(self.registry, workdir).or_else(|| pull_url(workdir))
    }

    fn clone_into(&self, url: &str, workdir: &Path, path: &str) -> anyhow::Result<i32> {
        do_clone(self.registry, &GitOptions::parse(["clone", url, path]), workdir)
    }

    fn fetch_in(&self, checkout: &Path) -> anyhow::Result<i32> {
        do_fetch(self.registry, &GitOptions::parse(["fetch"]), checkout)
    }

    fn update_checkout(
        &self,
        workdir: &Path,
        path: &str,
        remote: bool,
    ) -> anyhow::Result<CommandOutput> {
        let mut args = vec!["submodule", "update"];
        if remote {
            args.push("--remote");
        }
        args.extend(["--", path]);
        Ok(real_git(self.registry)
            .args(args)
            .current_dir(workdir)
            .run(&self.registry.config().update.without_retries())?)
    }

    fn fetch_commit(&self, checkout: &Path, url: &str, commit: &str) -> anyhow::Result<i32> {
        call_real_git(self.registry, &["fetch", url, commit], checkout)
    }

    fn checkout_commit(&self, checkout: &Path, commit: &str) -> anyhow::Result<i32> {
        call_real_git(self.registry, &["checkout", commit], checkout)
    }
}
