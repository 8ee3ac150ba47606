//! arcsync library
//!
//! Adaptive-granularity reconciliation between a local directory tree and
//! a hierarchically organized dataset archive (project -> subject ->
//! experiment -> scan -> resource -> file). Subtrees move as single tar
//! archives when possible; on failure the engine splits one rank deeper
//! and retries per child.

pub mod archive;
pub mod cli;
pub mod config;
pub mod dir_remote;
pub mod engine;
pub mod hierarchy;
pub mod ledger;
pub mod logger;
pub mod probe;
pub mod remote;
pub mod session;
pub mod testutil;
pub mod transfer;
pub mod translate;
