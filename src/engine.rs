//! Adaptive-granularity reconciliation engine
//!
//! The engine walks the remote listing top-down. At each node it probes
//! the local side; if work is needed it tries to move the whole subtree as
//! one archive, and only on failure does it split one rank deeper and
//! repeat per child. A run-scoped ledger keeps overlapping checks from
//! revisiting subtrees that already resolved.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use rayon::prelude::*;
use thiserror::Error;

use crate::hierarchy::{LocalPath, Rank, RemoteAddress};
use crate::ledger::{SubtreeKey, TransferLedger};
use crate::logger::SyncLogger;
use crate::probe;
use crate::remote::{
    ExperimentEntry, FileEntry, ProjectListing, RemoteError, RemoteStore, ResourceEntry,
    ScanEntry, SubjectEntry,
};
use crate::transfer;
use crate::translate;

/// How deep the download-side descent may go before giving up on a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Stop splitting at resource rank; individual files are never
    /// enumerated.
    Resources,
    /// Fine mode: fall back all the way to per-file transfers.
    Files,
}

impl Granularity {
    pub fn max_rank(self) -> Rank {
        match self {
            Granularity::Resources => Rank::Resource,
            Granularity::Files => Rank::File,
        }
    }
}

/// Terminal state of one node. Write-once per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The local side already satisfied the probe; children never visited.
    AlreadyPresent,
    /// Whole subtree landed in one archive operation.
    TransferredInBulk,
    /// Resolved by splitting into children after a failed bulk attempt.
    TransferredByDescent,
    /// No remote counterpart for this node; skipped, not an error.
    Skipped,
    /// Unresolved even at the finest permitted granularity.
    Failed,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::AlreadyPresent => "already-present",
            Outcome::TransferredInBulk => "transferred-in-bulk",
            Outcome::TransferredByDescent => "transferred-by-descent",
            Outcome::Skipped => "skipped",
            Outcome::Failed => "failed",
        }
    }

    pub fn is_failure(self) -> bool {
        self == Outcome::Failed
    }
}

/// Per-subtree terminal status, surfaced in the run summary.
#[derive(Debug, Clone)]
pub struct SubtreeStatus {
    pub local: LocalPath,
    pub rank: Rank,
    pub outcome: Outcome,
}

/// What one run did. Failures are listed, never silently discarded.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub statuses: Vec<SubtreeStatus>,
    pub satisfied: u64,
    pub transferred: u64,
    pub skipped: u64,
    pub failed: u64,
    /// Existence probes issued (local on pull, remote on push).
    pub probes: u64,
    pub cancelled: bool,
}

impl SyncReport {
    fn note(&mut self, local: &LocalPath, outcome: Outcome) {
        match outcome {
            Outcome::AlreadyPresent => self.satisfied += 1,
            Outcome::TransferredInBulk | Outcome::TransferredByDescent => self.transferred += 1,
            Outcome::Skipped => self.skipped += 1,
            Outcome::Failed => self.failed += 1,
        }
        // Per-file successes would swamp the list; failures always surface.
        if local.rank() == Rank::File && !outcome.is_failure() {
            return;
        }
        self.statuses.push(SubtreeStatus {
            local: local.clone(),
            rank: local.rank(),
            outcome,
        });
    }

    fn merge(&mut self, other: SyncReport) {
        self.statuses.extend(other.statuses);
        self.satisfied += other.satisfied;
        self.transferred += other.transferred;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.probes += other.probes;
        self.cancelled |= other.cancelled;
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }
}

/// Run-fatal conditions. Per-node trouble is recovered by descent and
/// reported in the `SyncReport` instead.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("local path does not exist: {}", .0.display())]
    MissingLocal(PathBuf),
}

/// A position in the remote listing, tagged by rank. Children come from
/// the per-rank table here rather than any runtime type inspection.
enum NodeRef<'a> {
    Subject(&'a SubjectEntry),
    Experiment(&'a ExperimentEntry),
    // scan and resource nodes carry the owning experiment: local file
    // names are relabeled with its display label
    Scan {
        scan: &'a ScanEntry,
        exp: &'a ExperimentEntry,
    },
    Resource {
        res: &'a ResourceEntry,
        exp: &'a ExperimentEntry,
    },
    File(&'a FileEntry),
}

impl<'a> NodeRef<'a> {
    fn rank(&self) -> Rank {
        match self {
            NodeRef::Subject(_) => Rank::Subject,
            NodeRef::Experiment(_) => Rank::Experiment,
            NodeRef::Scan { .. } => Rank::Scan,
            NodeRef::Resource { .. } => Rank::Resource,
            NodeRef::File(_) => Rank::File,
        }
    }

    /// Children one rank down with their identifier and local label.
    fn children(&self) -> Vec<(NodeRef<'a>, &'a str, String)> {
        match self {
            NodeRef::Subject(s) => s
                .experiments
                .iter()
                .map(|e| (NodeRef::Experiment(e), e.id.as_str(), e.label.clone()))
                .collect(),
            NodeRef::Experiment(e) => e
                .scans
                .iter()
                .map(|sc| {
                    (
                        NodeRef::Scan { scan: sc, exp: e },
                        sc.id.as_str(),
                        translate::scan_dir_name(&sc.id, &sc.scan_type),
                    )
                })
                .collect(),
            NodeRef::Scan { scan, exp } => scan
                .resources
                .iter()
                .map(|r| (NodeRef::Resource { res: r, exp }, r.id.as_str(), r.label.clone()))
                .collect(),
            NodeRef::Resource { res, exp } => res
                .files
                .iter()
                .map(|f| {
                    (
                        NodeRef::File(f),
                        f.id.as_str(),
                        translate::file_local_name(&f.name, &exp.id, &exp.label),
                    )
                })
                .collect(),
            NodeRef::File(_) => Vec::new(),
        }
    }
}

/// One sync invocation: remote handle, local root, depth policy,
/// cancellation flag and a fresh ledger. Nothing here outlives the run.
pub struct Syncer<'a> {
    remote: &'a dyn RemoteStore,
    root: PathBuf,
    granularity: Granularity,
    logger: &'a dyn SyncLogger,
    cancel: Arc<AtomicBool>,
    threads: usize,
    ledger: TransferLedger,
}

impl<'a> Syncer<'a> {
    pub fn new(remote: &'a dyn RemoteStore, root: &Path, logger: &'a dyn SyncLogger) -> Self {
        Self {
            remote,
            root: root.to_path_buf(),
            granularity: Granularity::Resources,
            logger,
            cancel: Arc::new(AtomicBool::new(false)),
            threads: 1,
            ledger: TransferLedger::new(),
        }
    }

    pub fn with_granularity(mut self, granularity: Granularity) -> Self {
        self.granularity = granularity;
        self
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Subject-level worker count. 1 = sequential, 0 = one per CPU.
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn ledger(&self) -> &TransferLedger {
        &self.ledger
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Reconcile the local root with the remote project, downloading
    /// whatever is missing.
    pub fn pull(&self, project_id: &str) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let report = self.pull_inner(project_id)?;
        self.logger.done(
            report.transferred,
            report.satisfied,
            report.failed,
            start.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    fn pull_inner(&self, project_id: &str) -> Result<SyncReport, SyncError> {
        let listing = self.remote.project(project_id)?;
        fs::create_dir_all(&self.root)?;

        let mut report = SyncReport::default();
        let project_addr = RemoteAddress::project(&listing.id);
        let project_local = LocalPath::project(&listing.id);
        let project_path = project_local.to_path(&self.root);

        report.probes += 1;
        let needs = probe::needs_transfer(&project_path, Rank::Project)?;
        self.logger.probe(&project_path, needs);
        if needs {
            self.logger.bulk_start(&project_addr.uri(), &project_path);
            match transfer::pull_subtree(self.remote, &project_addr, &project_local, &self.root) {
                Ok(()) => {
                    self.logger.bulk_done(&project_addr.uri(), &project_path);
                    report.note(&project_local, Outcome::TransferredInBulk);
                    return Ok(report);
                }
                Err(RemoteError::Fatal(e)) => return Err(RemoteError::Fatal(e).into()),
                Err(RemoteError::NotFound(uri)) => {
                    self.logger.error("bulk", &project_path, &uri);
                    report.note(&project_local, Outcome::Skipped);
                    return Ok(report);
                }
                Err(e) => self.logger.descend(&project_path, &e.to_string()),
            }
        }
        // The project node is the traversal root: a populated root
        // directory says nothing about individual subjects, so the walk
        // always continues into them.

        if self.threads == 1 {
            for subject in &listing.subjects {
                if self.cancelled() {
                    report.cancelled = true;
                    break;
                }
                self.visit(
                    NodeRef::Subject(subject),
                    project_addr.child(&subject.id),
                    project_local.child(&subject.label),
                    &mut report,
                )?;
            }
            return Ok(report);
        }

        // Subject subtrees are independent; split them across a bounded
        // pool. Each subject's own traversal stays sequential.
        let workers = if self.threads == 0 {
            num_cpus::get()
        } else {
            self.threads
        };
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .build()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let shared = Mutex::new(SyncReport::default());
        let result: Result<(), SyncError> = pool.install(|| {
            listing.subjects.par_iter().try_for_each(|subject| {
                if self.cancelled() {
                    return Ok(());
                }
                let mut part = SyncReport::default();
                let res = self.visit(
                    NodeRef::Subject(subject),
                    project_addr.child(&subject.id),
                    project_local.child(&subject.label),
                    &mut part,
                );
                shared.lock().merge(part);
                match res {
                    Ok(_) => Ok(()),
                    Err(e) => {
                        // a fatal error stops the remaining workers after
                        // their current node
                        self.cancel.store(true, Ordering::Relaxed);
                        Err(e)
                    }
                }
            })
        });
        report.merge(shared.into_inner());
        result?;
        if self.cancelled() {
            report.cancelled = true;
        }
        Ok(report)
    }

    fn visit(
        &self,
        node: NodeRef<'_>,
        addr: RemoteAddress,
        local: LocalPath,
        report: &mut SyncReport,
    ) -> Result<Outcome, SyncError> {
        let path = local.to_path(&self.root);

        // An ancestor (or this node) already resolved earlier in the run.
        if self.ledger.covers(&local) {
            self.logger.resolved(&path, "ledger");
            report.note(&local, Outcome::AlreadyPresent);
            return Ok(Outcome::AlreadyPresent);
        }

        report.probes += 1;
        let needs = match probe::needs_transfer(&path, node.rank()) {
            Ok(b) => b,
            Err(e) => {
                self.logger.error("probe", &path, &e.to_string());
                report.note(&local, Outcome::Failed);
                return Ok(Outcome::Failed);
            }
        };
        self.logger.probe(&path, needs);
        if !needs {
            if let Some(key) = SubtreeKey::for_node(&local) {
                self.ledger.mark_resolved(key);
            }
            self.logger.resolved(&path, Outcome::AlreadyPresent.as_str());
            report.note(&local, Outcome::AlreadyPresent);
            return Ok(Outcome::AlreadyPresent);
        }

        if node.rank() == Rank::File {
            return self.pull_one_file(&addr, &local, report);
        }

        self.logger.bulk_start(&addr.uri(), &path);
        let cause = match transfer::pull_subtree(self.remote, &addr, &local, &self.root) {
            Ok(()) => {
                self.logger.bulk_done(&addr.uri(), &path);
                if let Some(key) = SubtreeKey::for_node(&local) {
                    self.ledger.mark_resolved(key);
                }
                report.note(&local, Outcome::TransferredInBulk);
                return Ok(Outcome::TransferredInBulk);
            }
            Err(RemoteError::Fatal(e)) => return Err(RemoteError::Fatal(e).into()),
            Err(RemoteError::NotFound(_)) => {
                self.logger.error("bulk", &path, "no remote counterpart");
                report.note(&local, Outcome::Skipped);
                return Ok(Outcome::Skipped);
            }
            Err(e) => e.to_string(),
        };

        if node.rank() >= self.granularity.max_rank() {
            // the finest permitted granularity could not resolve this node
            self.logger.error("bulk", &path, &cause);
            report.note(&local, Outcome::Failed);
            return Ok(Outcome::Failed);
        }
        self.logger.descend(&path, &cause);

        let mut all_ok = true;
        let mut visited_any = false;
        for (child, id, label) in node.children() {
            if self.cancelled() {
                report.cancelled = true;
                all_ok = false;
                break;
            }
            visited_any = true;
            let outcome = self.visit(child, addr.child(id), local.child(label), report)?;
            if outcome.is_failure() {
                all_ok = false;
            }
        }

        let outcome = if all_ok && visited_any {
            Outcome::TransferredByDescent
        } else {
            Outcome::Failed
        };
        if outcome == Outcome::TransferredByDescent {
            if let Some(key) = SubtreeKey::for_node(&local) {
                self.ledger.mark_resolved(key);
            }
        }
        report.note(&local, outcome);
        Ok(outcome)
    }

    fn pull_one_file(
        &self,
        addr: &RemoteAddress,
        local: &LocalPath,
        report: &mut SyncReport,
    ) -> Result<Outcome, SyncError> {
        let path = local.to_path(&self.root);
        match transfer::pull_file(self.remote, addr, local, &self.root) {
            Ok(()) => {
                self.logger.resolved(&path, Outcome::TransferredInBulk.as_str());
                report.note(local, Outcome::TransferredInBulk);
                Ok(Outcome::TransferredInBulk)
            }
            Err(RemoteError::Fatal(e)) => Err(RemoteError::Fatal(e).into()),
            Err(RemoteError::NotFound(_)) => {
                report.note(local, Outcome::Skipped);
                Ok(Outcome::Skipped)
            }
            Err(e) => {
                self.logger.error("file", &path, &e.to_string());
                report.note(local, Outcome::Failed);
                Ok(Outcome::Failed)
            }
        }
    }

    /// Probe-only walk: which subtrees a pull would bulk-transfer, without
    /// touching the remote beyond the listing.
    pub fn plan(&self, project_id: &str) -> Result<Vec<LocalPath>, SyncError> {
        let listing = self.remote.project(project_id)?;
        let project_local = LocalPath::project(&listing.id);
        let mut out = Vec::new();
        if probe::needs_transfer(&project_local.to_path(&self.root), Rank::Project)? {
            out.push(project_local);
            return Ok(out);
        }
        for subject in &listing.subjects {
            let local = project_local.child(&subject.label);
            if probe::needs_transfer(&local.to_path(&self.root), Rank::Subject)? {
                out.push(local);
            }
        }
        Ok(out)
    }

    /// Upload direction: import local subtrees the remote does not have
    /// yet, append-only. Descends at most to experiment rank.
    pub fn push(&self, project_id: &str) -> Result<SyncReport, SyncError> {
        let start = Instant::now();
        let listing = self.remote.project(project_id)?;
        let project_addr = RemoteAddress::project(&listing.id);
        let project_local = LocalPath::project(&listing.id);
        let project_dir = project_local.to_path(&self.root);
        if !project_dir.is_dir() {
            return Err(SyncError::MissingLocal(project_dir));
        }

        let mut report = SyncReport::default();
        for dir in child_dirs(&project_dir)? {
            if self.cancelled() {
                report.cancelled = true;
                break;
            }
            self.push_subject(&listing, &project_addr, &project_local, &dir, &mut report)?;
        }
        self.logger.done(
            report.transferred,
            report.satisfied,
            report.failed,
            start.elapsed().as_secs_f64(),
        );
        Ok(report)
    }

    fn push_subject(
        &self,
        listing: &ProjectListing,
        project_addr: &RemoteAddress,
        project_local: &LocalPath,
        dir: &Path,
        report: &mut SyncReport,
    ) -> Result<(), SyncError> {
        let Some(label) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return Ok(());
        };
        let local = project_local.child(&label);
        let key = SubtreeKey::Subject(label.clone());
        if self.ledger.is_resolved(&key) {
            self.logger.resolved(dir, "ledger");
            report.note(&local, Outcome::AlreadyPresent);
            return Ok(());
        }

        // New local subjects are unknown to the listing; their label
        // doubles as the minted identifier on import.
        let sid = listing
            .subject_by_label(&label)
            .map(|s| s.id.clone())
            .unwrap_or_else(|| label.clone());
        let addr = project_addr.child(&sid);

        report.probes += 1;
        match self.remote.exists(&addr) {
            Ok(true) => {
                // verified present this run; descendants skipped wholesale
                self.ledger.mark_resolved(key);
                self.logger.resolved(dir, Outcome::AlreadyPresent.as_str());
                report.note(&local, Outcome::AlreadyPresent);
                return Ok(());
            }
            Ok(false) => {}
            Err(RemoteError::Fatal(e)) => return Err(RemoteError::Fatal(e).into()),
            Err(e) => {
                // a degraded remote is never read as "safe to upload"
                self.logger.error("exists", dir, &e.to_string());
                report.note(&local, Outcome::Failed);
                return Ok(());
            }
        }

        self.logger.bulk_start(&addr.uri(), dir);
        let cause = match transfer::push_subtree(self.remote, dir, project_addr) {
            Ok(()) => {
                self.logger.bulk_done(&addr.uri(), dir);
                self.ledger.mark_resolved(key);
                report.note(&local, Outcome::TransferredInBulk);
                return Ok(());
            }
            Err(RemoteError::Fatal(e)) => return Err(RemoteError::Fatal(e).into()),
            Err(e) => e.to_string(),
        };
        self.logger.descend(dir, &cause);

        let mut all_ok = true;
        let mut visited_any = false;
        for exp_dir in child_dirs(dir)? {
            if self.cancelled() {
                report.cancelled = true;
                all_ok = false;
                break;
            }
            visited_any = true;
            let ok = self.push_experiment(listing, &addr, &local, &label, &exp_dir, report)?;
            all_ok &= ok;
        }
        let outcome = if all_ok && visited_any {
            Outcome::TransferredByDescent
        } else {
            Outcome::Failed
        };
        if outcome == Outcome::TransferredByDescent {
            self.ledger.mark_resolved(SubtreeKey::Subject(label));
        }
        report.note(&local, outcome);
        Ok(())
    }

    fn push_experiment(
        &self,
        listing: &ProjectListing,
        subject_addr: &RemoteAddress,
        subject_local: &LocalPath,
        subject_label: &str,
        dir: &Path,
        report: &mut SyncReport,
    ) -> Result<bool, SyncError> {
        let Some(elabel) = dir.file_name().and_then(|n| n.to_str()).map(str::to_string) else {
            return Ok(true);
        };
        let local = subject_local.child(&elabel);

        // consult the parent subtree's key before our own
        let parent_key = SubtreeKey::Subject(subject_label.to_string());
        let own_key = SubtreeKey::Experiment(subject_label.to_string(), elabel.clone());
        if self.ledger.is_resolved(&parent_key) || self.ledger.is_resolved(&own_key) {
            self.logger.resolved(dir, "ledger");
            report.note(&local, Outcome::AlreadyPresent);
            return Ok(true);
        }

        let eid = listing
            .subject_by_label(subject_label)
            .and_then(|s| s.experiments.iter().find(|e| e.label == elabel))
            .map(|e| e.id.clone())
            .unwrap_or_else(|| elabel.clone());
        let addr = subject_addr.child(&eid);

        report.probes += 1;
        match self.remote.exists(&addr) {
            Ok(true) => {
                self.ledger.mark_resolved(own_key);
                self.logger.resolved(dir, Outcome::AlreadyPresent.as_str());
                report.note(&local, Outcome::AlreadyPresent);
                Ok(true)
            }
            Ok(false) => {
                self.logger.bulk_start(&addr.uri(), dir);
                match transfer::push_subtree(self.remote, dir, subject_addr) {
                    Ok(()) => {
                        self.logger.bulk_done(&addr.uri(), dir);
                        self.ledger.mark_resolved(own_key);
                        report.note(&local, Outcome::TransferredInBulk);
                        Ok(true)
                    }
                    Err(RemoteError::Fatal(e)) => Err(RemoteError::Fatal(e).into()),
                    Err(e) => {
                        self.logger.error("import", dir, &e.to_string());
                        report.note(&local, Outcome::Failed);
                        Ok(false)
                    }
                }
            }
            Err(RemoteError::Fatal(e)) => Err(RemoteError::Fatal(e).into()),
            Err(e) => {
                self.logger.error("exists", dir, &e.to_string());
                report.note(&local, Outcome::Failed);
                Ok(false)
            }
        }
    }
}

/// Immediate subdirectories, name-sorted, dotfiles skipped.
fn child_dirs(path: &Path) -> io::Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        out.push(entry.path());
    }
    out.sort();
    Ok(out)
}
