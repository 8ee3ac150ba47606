//! Shared CLI fragments used by the arcsync subcommands

use clap::{Parser, ValueEnum};
use std::fmt;
use std::path::PathBuf;

use crate::engine::Granularity;

/// Where the remote store lives and which project to talk to. Values
/// missing here fall back to the config file.
#[derive(Clone, Debug, Parser)]
pub struct RemoteOpts {
    /// Staged remote root directory
    #[arg(long)]
    pub remote: Option<PathBuf>,

    /// Project identifier
    #[arg(short = 'x', long)]
    pub project: Option<String>,

    /// JSON config file with defaults for the options above
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Options common to the tree-reconciling subcommands.
#[derive(Clone, Debug, Parser)]
pub struct SyncOpts {
    /// Local tree root
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// How deep the download-side descent may go
    #[arg(long, value_enum, default_value_t = GranularityArg::Resources)]
    pub granularity: GranularityArg,

    /// Subject-level workers (1 = sequential, 0 = one per CPU)
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,

    /// Directory for timestamped log files
    #[arg(long)]
    pub logs_dir: Option<PathBuf>,

    /// List what would transfer without moving anything
    #[arg(short = 'l', long)]
    pub dry_run: bool,

    /// Print per-subtree outcomes as they resolve
    #[arg(short, long)]
    pub verbose: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GranularityArg {
    /// Stop splitting at resource rank
    Resources,
    /// Fall back all the way to per-file transfers
    Files,
}

impl fmt::Display for GranularityArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GranularityArg::Resources => f.write_str("resources"),
            GranularityArg::Files => f.write_str("files"),
        }
    }
}

impl From<GranularityArg> for Granularity {
    fn from(arg: GranularityArg) -> Self {
        match arg {
            GranularityArg::Resources => Granularity::Resources,
            GranularityArg::Files => Granularity::Files,
        }
    }
}
