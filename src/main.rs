//! arcsync - reconcile a local directory tree with a hierarchical dataset
//! archive
//!
//! Subtrees move as single tar archives when possible; on failure the
//! engine splits one rank deeper and retries per child. Exit codes follow
//! the conventions of the site's transfer scripts:
//!   0  ok
//!   1  project does not exist on the remote
//!   2  local path or required option missing
//!   3  session already exists / download error / unresolved subtrees
//!   4  upload error
//!   9  remote connection failure
//!   130  interrupted

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use arcsync::cli::{RemoteOpts, SyncOpts};
use arcsync::config::Config;
use arcsync::dir_remote::DirRemote;
use arcsync::engine::{SyncError, SyncReport, Syncer};
use arcsync::logger::{NoopLogger, SyncLogger, TextLogger};
use arcsync::remote::RemoteError;
use arcsync::session;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Adaptive-granularity sync between a local tree and a hierarchical dataset archive"
)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download everything the local tree is missing
    Pull {
        #[command(flatten)]
        remote: RemoteOpts,
        #[command(flatten)]
        sync: SyncOpts,
    },
    /// Upload local subtrees the remote does not have yet (append-only)
    Push {
        #[command(flatten)]
        remote: RemoteOpts,
        #[command(flatten)]
        sync: SyncOpts,
    },
    /// Download one session's subtree as a tar archive
    Grab {
        #[command(flatten)]
        remote: RemoteOpts,
        /// Session (experiment) label to grab
        #[arg(short, long)]
        session: String,
        /// Where to write <session>.tar
        #[arg(long, default_value = ".")]
        dest: PathBuf,
    },
    /// Upload one session directory, refusing to touch existing sessions
    Put {
        #[command(flatten)]
        remote: RemoteOpts,
        /// Subject label the session belongs to
        #[arg(long)]
        subject: String,
        /// Session directory to upload
        #[arg(short, long)]
        session: PathBuf,
    },
}

fn main() {
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let c = cancel.clone();
        ctrlc::set_handler(move || {
            if c.swap(true, Ordering::SeqCst) {
                // second interrupt: stop waiting for the current node
                std::process::exit(130);
            }
            eprintln!("\nInterrupted; finishing current node (Ctrl-C again to abort)...");
        })
        .expect("Error setting Ctrl-C handler");
    }

    let args = Args::parse();
    let code = match args.command {
        Command::Pull { remote, sync } => run_sync(Direction::Pull, &remote, &sync, &cancel),
        Command::Push { remote, sync } => run_sync(Direction::Push, &remote, &sync, &cancel),
        Command::Grab {
            remote,
            session,
            dest,
        } => run_grab(&remote, &session, &dest),
        Command::Put {
            remote,
            subject,
            session,
        } => run_put(&remote, &subject, &session),
    };
    std::process::exit(code);
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Pull,
    Push,
}

impl Direction {
    fn name(self) -> &'static str {
        match self {
            Direction::Pull => "pull",
            Direction::Push => "push",
        }
    }
}

fn run_sync(
    direction: Direction,
    remote_opts: &RemoteOpts,
    sync: &SyncOpts,
    cancel: &Arc<AtomicBool>,
) -> i32 {
    let (cfg, remote_dir, project) = match resolve_remote(remote_opts) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e:#}");
            return 2;
        }
    };
    let Some(root) = sync.root.clone().or(cfg.root) else {
        eprintln!("--root required (or set \"root\" in the config file)");
        return 2;
    };

    // Log to a timestamped file when a logs dir is known; otherwise the
    // engine runs silent and only the summary prints.
    let logs_dir = sync.logs_dir.clone().or(cfg.logs_dir);
    let logger: Box<dyn SyncLogger> = match logs_dir {
        Some(dir) => match TextLogger::timestamped(&dir, direction.name()) {
            Ok((l, _)) => Box::new(l),
            Err(e) => {
                eprintln!(
                    "warning: cannot open log file under {}: {e:#}; continuing without logs",
                    dir.display()
                );
                Box::new(NoopLogger)
            }
        },
        None => Box::new(NoopLogger),
    };

    let remote = DirRemote::new(remote_dir);
    let syncer = Syncer::new(&remote, &root, logger.as_ref())
        .with_granularity(sync.granularity.into())
        .with_threads(sync.threads)
        .with_cancel(cancel.clone());

    if sync.dry_run {
        return match syncer.plan(&project) {
            Ok(pending) => {
                if pending.is_empty() {
                    println!("Nothing to transfer.");
                } else {
                    for local in &pending {
                        println!("WOULD TRANSFER {local}");
                    }
                    println!("{} subtree(s) would transfer", pending.len());
                }
                0
            }
            Err(e) => report_fatal(&e),
        };
    }

    let spinner = if sync.verbose {
        None
    } else {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap(),
        );
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("{}ing {project}...", direction.name()));
        Some(pb)
    };

    let result = match direction {
        Direction::Pull => syncer.pull(&project),
        Direction::Push => syncer.push(&project),
    };
    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    match result {
        Ok(report) => {
            print_summary(&report, sync.verbose);
            if report.cancelled {
                130
            } else if report.has_failures() {
                if direction == Direction::Push {
                    4
                } else {
                    3
                }
            } else {
                0
            }
        }
        Err(e) => report_fatal(&e),
    }
}

fn print_summary(report: &SyncReport, verbose: bool) {
    println!(
        "{} transferred, {} satisfied, {} skipped, {} failed",
        report.transferred, report.satisfied, report.skipped, report.failed
    );
    if verbose {
        for status in &report.statuses {
            println!("{:<22} {} ({})", status.outcome.as_str(), status.local, status.rank);
        }
    } else {
        for status in report.statuses.iter().filter(|s| s.outcome.is_failure()) {
            println!("FAILED {} ({})", status.local, status.rank);
        }
    }
    if report.cancelled {
        println!("Run interrupted; remaining subtrees were not visited.");
    }
}

fn report_fatal(err: &SyncError) -> i32 {
    eprintln!("{err}");
    match err {
        SyncError::Remote(RemoteError::NotFound(_)) => 1,
        SyncError::Remote(RemoteError::Fatal(_)) => 9,
        SyncError::Remote(RemoteError::Transfer { .. }) => 3,
        SyncError::MissingLocal(_) | SyncError::Io(_) => 2,
    }
}

fn run_grab(remote_opts: &RemoteOpts, session_label: &str, dest: &Path) -> i32 {
    let (_, remote_dir, project) = match resolve_remote(remote_opts) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e:#}");
            return 2;
        }
    };
    let remote = DirRemote::new(remote_dir);
    match session::grab(&remote, &project, session_label, dest) {
        Ok(path) => {
            println!("Successfully downloaded: {}", path.display());
            0
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn run_put(remote_opts: &RemoteOpts, subject: &str, session_dir: &Path) -> i32 {
    let (_, remote_dir, project) = match resolve_remote(remote_opts) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("{e:#}");
            return 2;
        }
    };
    let remote = DirRemote::new(remote_dir);
    match session::put(&remote, &project, subject, session_dir) {
        Ok(label) => {
            println!("Successfully uploaded: {label}");
            0
        }
        Err(e) => {
            eprintln!("{e}");
            e.exit_code()
        }
    }
}

fn resolve_remote(opts: &RemoteOpts) -> Result<(Config, PathBuf, String)> {
    let cfg = match &opts.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let remote = opts
        .remote
        .clone()
        .or_else(|| cfg.remote.clone())
        .context("--remote required (or set \"remote\" in the config file)")?;
    let project = opts
        .project
        .clone()
        .or_else(|| cfg.project.clone())
        .context("--project required (or set \"project\" in the config file)")?;
    Ok((cfg, remote, project))
}
