use std::{env, ffi::OsString, path::Path};

use clap::Parser;
use log::error;

use gitcache::{
    cli::args::{CliArgs, Command},
    Gitcache,
};

/// Name under which every command line is a git command line.
const GIT_BINARY_NAME: &str = "git";

fn called_as_git(program: Option<&OsString>) -> bool {
    program
        .and_then(|program| Path::new(program).file_stem())
        .is_some_and(|stem| stem == GIT_BINARY_NAME)
}

fn run() -> anyhow::Result<i32> {
    let argv: Vec<OsString> = env::args_os().collect();
    let cwd = env::current_dir()?;

    if called_as_git(argv.first()) {
        let args: Vec<String> = argv
            .iter()
            .skip(1)
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();
        return Gitcache::builder().try_build()?.run(&args, &cwd);
    }

    let cli_args = CliArgs::parse_from(argv);
    let mut builder = Gitcache::builder();
    if let Some(cache_directory) = &cli_args.cache_directory {
        builder = builder.cache_directory(cache_directory);
    }
    let gitcache = builder.try_build()?;

    match cli_args.cmd {
        Command::Git { args } => gitcache.run(&args, &cwd),
        Command::UpdateMirrors => gitcache.update_mirrors(),
        Command::Info => {
            for (path, record) in gitcache.info()? {
                println!("{}", path.display());
                println!("  url:            {}", record.url);
                if let Some(default_ref) = &record.default_ref {
                    println!("  default ref:    {default_ref}");
                }
                println!("  clones:         {}", record.clones);
                println!("  updates:        {}", record.updates);
                println!("  mirror updates: {}", record.mirror_updates);
            }
            Ok(0)
        }
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            std::process::exit(1);
        }
    }
}
