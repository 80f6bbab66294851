pub mod cache;
pub mod mirror;
pub mod remote;
