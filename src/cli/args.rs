use clap::{Parser, Subcommand};

/// Transparent cache for git clone, fetch, pull and submodule update.
///
/// Installed or linked under the name `git`, every invocation is treated as
/// a git command line.
#[derive(Debug, Parser)]
#[clap(version)]
pub struct CliArgs {
    #[clap(subcommand)]
    pub cmd: Command,
    /// Location of the cache directory.
    /// Defaults to $GITCACHE_DIR, or $HOME/.gitcache
    #[clap(short, long)]
    pub cache_directory: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Runs a git command line through the cache
    #[clap(disable_help_flag = true)]
    Git {
        #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Updates all mirrors in the cache
    UpdateMirrors,
    /// Prints the usage records of all mirrors
    Info,
}
