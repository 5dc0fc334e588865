#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod cli;
pub mod client;
pub mod config;
pub mod holo;
pub mod logging;
pub mod session;
pub mod storage;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
