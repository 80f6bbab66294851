use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
};

/// Global options of git that take their value from the next argument.
const GLOBAL_OPTIONS_WITH_VALUE: &[&str] = &[
    "-c",
    "--git-dir",
    "--work-tree",
    "--namespace",
    "--super-prefix",
    "--config-env",
];

/// Invocations that only print information about git itself.
const BAIL_OUT_OPTIONS: &[&str] = &[
    "-h",
    "--help",
    "-v",
    "--version",
    "--exec-path",
    "--html-path",
    "--man-path",
    "--info-path",
];

const CLONE_OPTIONS_WITH_VALUE: &[&str] = &[
    "-o",
    "--origin",
    "-b",
    "--branch",
    "-u",
    "--upload-pack",
    "--reference",
    "--reference-if-able",
    "--separate-git-dir",
    "--depth",
    "--shallow-since",
    "--shallow-exclude",
    "-c",
    "--config",
    "-j",
    "--jobs",
    "--template",
    "--filter",
    "--server-option",
    "--bundle-uri",
    "--ref-format",
];

const FETCH_OPTIONS_WITH_VALUE: &[&str] = &[
    "--depth",
    "--deepen",
    "--shallow-since",
    "--shallow-exclude",
    "-j",
    "--jobs",
    "--upload-pack",
    "-o",
    "--server-option",
    "--refmap",
    "--negotiation-tip",
    "--recurse-submodules-default",
    "--filter",
];

const PULL_OPTIONS_WITH_VALUE: &[&str] = &[
    "--depth",
    "--deepen",
    "--shallow-since",
    "--shallow-exclude",
    "-j",
    "--jobs",
    "--upload-pack",
    "-o",
    "--server-option",
    "--negotiation-tip",
    "-s",
    "--strategy",
    "-X",
    "--strategy-option",
];

const SUBMODULE_UPDATE_OPTIONS_WITH_VALUE: &[&str] =
    &["--reference", "--depth", "-j", "--jobs", "--filter"];

const REMOTE_ADD_OPTIONS_WITH_VALUE: &[&str] = &["-t", "-m"];

const LS_REMOTE_OPTIONS_WITH_VALUE: &[&str] =
    &["--upload-pack", "-o", "--server-option", "--sort"];

const CHECKOUT_OPTIONS_WITH_VALUE: &[&str] = &[
    "-b",
    "-B",
    "--orphan",
    "--conflict",
    "--pathspec-from-file",
];

const LFS_OPTIONS_WITH_VALUE: &[&str] = &["-I", "--include", "-X", "--exclude"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GitCommand {
    Clone,
    Fetch,
    Pull,
    SubmoduleUpdate,
    SubmoduleInit,
    RemoteAdd,
    LsRemote,
    Checkout,
    LfsFetch,
    LfsPull,
    Other(String),
}

/// A git invocation split into global options, command, command options and arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitOptions {
    /// Global options without `-C`, in the order given.
    pub global_options: Vec<String>,
    /// The values of all `-C` options, in the order given.
    pub run_paths: Vec<PathBuf>,
    pub command: Option<GitCommand>,
    /// The command word(s) and everything following them, verbatim.
    pub command_line: Vec<String>,
    pub command_options: Vec<String>,
    pub command_args: Vec<String>,
    /// Names of the options without value given to the command, without leading dashes.
    pub flags: BTreeSet<String>,
    all_args: Vec<String>,
}

impl GitOptions {
    pub fn parse<I, S>(args: I) -> GitOptions
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let all_args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut options = GitOptions {
            all_args: all_args.clone(),
            ..Default::default()
        };

        let mut index = 0;
        while index < all_args.len() {
            let arg = all_args[index].as_str();
            if arg == "-C" {
                match all_args.get(index + 1) {
                    Some(path) => options.run_paths.push(PathBuf::from(path)),
                    None => return options,
                }
                index += 2;
            } else if GLOBAL_OPTIONS_WITH_VALUE.contains(&arg) {
                options.global_options.push(arg.to_string());
                match all_args.get(index + 1) {
                    Some(value) => options.global_options.push(value.clone()),
                    None => return options,
                }
                index += 2;
            } else if BAIL_OUT_OPTIONS.contains(&arg) {
                return options;
            } else if arg.starts_with('-') {
                options.global_options.push(arg.to_string());
                index += 1;
            } else {
                break;
            }
        }

        let rest = &all_args[index..];
        let Some(word) = rest.first() else {
            return options;
        };
        options.command_line = rest.to_vec();

        let (command, tail, value_options) = match word.as_str() {
            "clone" => (GitCommand::Clone, &rest[1..], CLONE_OPTIONS_WITH_VALUE),
            "fetch" => (GitCommand::Fetch, &rest[1..], FETCH_OPTIONS_WITH_VALUE),
            "pull" => (GitCommand::Pull, &rest[1..], PULL_OPTIONS_WITH_VALUE),
            "submodule" => match first_word_after(&rest[1..]) {
                Some((position, "update")) => (
                    GitCommand::SubmoduleUpdate,
                    &rest[position + 2..],
                    SUBMODULE_UPDATE_OPTIONS_WITH_VALUE,
                ),
                Some((position, "init")) => {
                    (GitCommand::SubmoduleInit, &rest[position + 2..], &[][..])
                }
                _ => (GitCommand::Other(word.clone()), &rest[1..], &[][..]),
            },
            "remote" => match first_word_after(&rest[1..]) {
                Some((position, "add")) => (
                    GitCommand::RemoteAdd,
                    &rest[position + 2..],
                    REMOTE_ADD_OPTIONS_WITH_VALUE,
                ),
                _ => (GitCommand::Other(word.clone()), &rest[1..], &[][..]),
            },
            "ls-remote" => (GitCommand::LsRemote, &rest[1..], LS_REMOTE_OPTIONS_WITH_VALUE),
            "checkout" => (GitCommand::Checkout, &rest[1..], CHECKOUT_OPTIONS_WITH_VALUE),
            "lfs" => match first_word_after(&rest[1..]) {
                Some((position, "fetch")) => (
                    GitCommand::LfsFetch,
                    &rest[position + 2..],
                    LFS_OPTIONS_WITH_VALUE,
                ),
                Some((position, "pull")) => (
                    GitCommand::LfsPull,
                    &rest[position + 2..],
                    LFS_OPTIONS_WITH_VALUE,
                ),
                _ => (GitCommand::Other(word.clone()), &rest[1..], &[][..]),
            },
            other => (GitCommand::Other(other.to_string()), &rest[1..], &[][..]),
        };
        options.command = Some(command);
        options.parse_command_arguments(tail, value_options);
        options
    }

    fn parse_command_arguments(&mut self, tokens: &[String], value_options: &[&str]) {
        let mut positional_only = false;
        let mut index = 0;
        while index < tokens.len() {
            let token = &tokens[index];
            index += 1;
            if positional_only || token == "-" || !token.starts_with('-') {
                self.command_args.push(token.clone());
            } else if token == "--" {
                positional_only = true;
            } else if token.contains('=') && token.starts_with("--") {
                self.command_options.push(token.clone());
            } else if value_options.contains(&token.as_str()) {
                self.command_options.push(token.clone());
                if let Some(value) = tokens.get(index) {
                    self.command_options.push(value.clone());
                    index += 1;
                }
            } else {
                self.command_options.push(token.clone());
                self.flags.insert(token.trim_start_matches('-').to_string());
            }
        }
    }

    pub fn command(&self) -> Option<&GitCommand> {
        self.command.as_ref()
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    /// Value of a command option given either as `--name value`, `--name=value` or `-n value`.
    pub fn option_value(&self, names: &[&str]) -> Option<&str> {
        let mut iter = self.command_options.iter();
        while let Some(option) = iter.next() {
            if names.contains(&option.as_str()) {
                return iter.next().map(String::as_str);
            }
            if let Some((name, value)) = option.split_once('=') {
                if names.contains(&name) {
                    return Some(value);
                }
            }
        }
        None
    }

    /// The directory the command operates in: `cwd` with all `-C` options applied.
    pub fn run_path(&self, cwd: &Path) -> PathBuf {
        self.run_paths
            .iter()
            .fold(cwd.to_path_buf(), |path, run_path| path.join(run_path))
    }

    /// The arguments exactly as given.
    pub fn all_args(&self) -> &[String] {
        &self.all_args
    }

    /// The arguments to use when running from [`GitOptions::run_path`].
    pub fn args_without_run_paths(&self) -> Vec<String> {
        self.global_options
            .iter()
            .chain(self.command_line.iter())
            .cloned()
            .collect()
    }

    /// Like [`GitOptions::args_without_run_paths`], with the argument `from` replaced by `to`.
    pub fn args_with_replaced_arg(&self, from: &str, to: &str) -> Vec<String> {
        self.global_options
            .iter()
            .cloned()
            .chain(self.command_line.iter().map(|arg| {
                if arg == from {
                    to.to_string()
                } else {
                    arg.clone()
                }
            }))
            .collect()
    }

    /// Removes a command option without value from every view of the invocation.
    /// Removes the command option `option`, given with or without `=value`.
    pub fn strip_option(&mut self, option: &str) {
        let matches = |arg: &String| {
            arg == option
                || arg
                    .strip_prefix(option)
                    .is_some_and(|rest| rest.starts_with('='))
        };
        let command_start = self.all_args.len() - self.command_line.len();
        let mut position = 0;
        self.all_args.retain(|arg| {
            position += 1;
            position <= command_start || !matches(arg)
        });
        self.command_line.retain(|arg| !matches(arg));
        self.command_options.retain(|arg| !matches(arg));
        self.flags.remove(option.trim_start_matches('-'));
    }
}

fn first_word_after(tokens: &[String]) -> Option<(usize, &str)> {
    tokens
        .iter()
        .enumerate()
        .find(|(_, token)| !token.starts_with('-'))
        .map(|(position, token)| (position, token.as_str()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    #[test]
    fn global_options_and_run_paths() {
        let options = GitOptions::parse([
            "-C",
            "/work",
            "-c",
            "core.autocrlf=false",
            "-C",
            "submodules",
            "--no-pager",
            "fetch",
            "origin",
        ]);
        assert_eq!(
            options.run_paths,
            vec![PathBuf::from("/work"), PathBuf::from("submodules")]
        );
        assert_eq!(
            options.global_options,
            vec!["-c", "core.autocrlf=false", "--no-pager"]
        );
        assert_eq!(options.command, Some(GitCommand::Fetch));
        assert_eq!(options.command_args, vec!["origin"]);
        assert_eq!(
            options.run_path(Path::new("/home")),
            PathBuf::from("/work/submodules")
        );
        assert_eq!(
            options.args_without_run_paths(),
            vec!["-c", "core.autocrlf=false", "--no-pager", "fetch", "origin"]
        );
    }

    #[test]
    fn clone_options_with_values_are_not_arguments() {
        let options = GitOptions::parse([
            "clone",
            "--branch",
            "main",
            "-o",
            "upstream",
            "--depth=1",
            "--recurse-submodules",
            "https://github.com/org/repo",
            "checkout",
        ]);
        assert_eq!(options.command, Some(GitCommand::Clone));
        assert_eq!(
            options.command_args,
            vec!["https://github.com/org/repo", "checkout"]
        );
        assert_eq!(options.option_value(&["-o", "--origin"]), Some("upstream"));
        assert_eq!(options.option_value(&["--depth"]), Some("1"));
        assert!(options.has_flag("recurse-submodules"));
    }

    #[test]
    fn submodule_update_flags_and_paths() {
        let options = GitOptions::parse([
            "submodule",
            "update",
            "--init",
            "--recursive",
            "--jobs",
            "4",
            "--",
            "lib/a",
            "lib/b",
        ]);
        assert_eq!(options.command, Some(GitCommand::SubmoduleUpdate));
        assert!(options.has_flag("init"));
        assert!(options.has_flag("recursive"));
        assert!(!options.has_flag("remote"));
        assert_eq!(options.command_args, vec!["lib/a", "lib/b"]);
    }

    #[test]
    fn other_submodule_commands() {
        let options = GitOptions::parse(["submodule", "--quiet", "sync"]);
        assert_eq!(
            options.command,
            Some(GitCommand::Other("submodule".to_string()))
        );
        let options = GitOptions::parse(["submodule", "--quiet", "update"]);
        assert_eq!(options.command, Some(GitCommand::SubmoduleUpdate));
    }

    #[test]
    fn cached_commands_besides_update() {
        let options = GitOptions::parse(["submodule", "init", "lib"]);
        assert_eq!(options.command, Some(GitCommand::SubmoduleInit));
        assert_eq!(options.command_args, vec!["lib"]);

        let options = GitOptions::parse(["ls-remote", "--sort", "version:refname", "--tags", "origin"]);
        assert_eq!(options.command, Some(GitCommand::LsRemote));
        assert_eq!(options.command_args, vec!["origin"]);

        let options = GitOptions::parse(["checkout", "-b", "topic", "origin/topic"]);
        assert_eq!(options.command, Some(GitCommand::Checkout));
        assert_eq!(options.command_args, vec!["origin/topic"]);

        let options = GitOptions::parse(["lfs", "fetch", "-I", "*.bin", "origin", "main"]);
        assert_eq!(options.command, Some(GitCommand::LfsFetch));
        assert_eq!(options.command_args, vec!["origin", "main"]);

        let options = GitOptions::parse(["lfs", "pull"]);
        assert_eq!(options.command, Some(GitCommand::LfsPull));

        let options = GitOptions::parse(["lfs", "install"]);
        assert_eq!(options.command, Some(GitCommand::Other("lfs".to_string())));
    }

    #[test]
    fn strip_option_with_value() {
        let mut options = GitOptions::parse([
            "clone",
            "--recurse-submodules=lib",
            "https://github.com/org/repo",
        ]);
        options.strip_option("--recurse-submodules");
        assert_eq!(options.all_args(), ["clone", "https://github.com/org/repo"]);
        assert!(options.command_options.is_empty());
    }

    #[test]
    fn remote_add() {
        let options = GitOptions::parse([
            "remote",
            "add",
            "-t",
            "main",
            "origin",
            "https://github.com/org/repo",
        ]);
        assert_eq!(options.command, Some(GitCommand::RemoteAdd));
        assert_eq!(
            options.command_args,
            vec!["origin", "https://github.com/org/repo"]
        );
        let options = GitOptions::parse(["remote", "-v"]);
        assert_eq!(
            options.command,
            Some(GitCommand::Other("remote".to_string()))
        );
    }

    #[test]
    fn informational_invocations_have_no_command() {
        assert_eq!(GitOptions::parse(["--version"]).command, None);
        assert_eq!(GitOptions::parse(["-C", "dir", "--help"]).command, None);
        assert_eq!(GitOptions::parse(Vec::<String>::new()).command, None);
    }

    #[test]
    fn strip_option_only_touches_the_command() {
        let mut options =
            GitOptions::parse(["-C", "dir", "submodule", "update", "--init", "--recursive"]);
        options.strip_option("--init");
        assert!(!options.has_flag("init"));
        assert_eq!(
            options.all_args(),
            ["-C", "dir", "submodule", "update", "--recursive"]
        );
        assert_eq!(
            options.args_without_run_paths(),
            vec!["submodule", "update", "--recursive"]
        );
    }

    #[test]
    fn replace_argument() {
        let options = GitOptions::parse(["fetch", "https://github.com/org/repo", "main"]);
        assert_eq!(
            options.args_with_replaced_arg("https://github.com/org/repo", "/cache/repo/git"),
            vec!["fetch", "/cache/repo/git", "main"]
        );
    }
}
