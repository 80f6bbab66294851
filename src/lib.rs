pub mod cli;
pub mod command;
pub mod config;
pub mod database;
pub mod flock;
pub mod git;
pub mod model;
pub mod submodule;

mod api;
#[cfg(all(test, unix))]
mod testing;

pub use api::{Gitcache, GitcacheBuilder};
