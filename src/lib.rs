//! Flowbox - sandboxed flow-step execution
//!
//! Runs engine operations inside a fixed pool of isolation slots. Each slot
//! is bound to a shared, read-only dependency cache entry that is built at
//! most once per distinct set of packages.

pub mod audit;
pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod install;
pub mod lock;
pub mod sandbox;
pub mod ui;

#[cfg(test)]
mod test_support;

pub use error::{FlowboxError, FlowboxResult};
