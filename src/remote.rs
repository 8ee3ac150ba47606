//! Remote archive contract
//!
//! The engine only ever talks to the remote store through this trait.
//! Session/auth lifecycle belongs to the implementation; the engine treats
//! a store handle as valid for the duration of one run.

use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hierarchy::RemoteAddress;

/// Remote failure taxonomy. `NotFound` skips a node, `Transfer` triggers
/// descent to finer granularity, `Fatal` aborts the whole run.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("no remote object at {0}")]
    NotFound(String),

    #[error("transfer failed for {addr}: {cause}")]
    Transfer { addr: String, cause: String },

    #[error("remote service unavailable: {0}")]
    Fatal(String),
}

impl RemoteError {
    pub fn transfer(addr: &RemoteAddress, cause: impl ToString) -> Self {
        RemoteError::Transfer {
            addr: addr.uri(),
            cause: cause.to_string(),
        }
    }
}

/// Conflict policy for subtree imports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportPolicy {
    /// Add missing objects only; pre-existing remote content is never
    /// replaced or removed.
    Append,
    /// Replace files that already exist. The sync engine never uses this;
    /// it exists for explicit administrative repair.
    Overwrite,
}

/// Full listing of one project: identifiers, display labels and scan
/// acquisition types for every level of the hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectListing {
    pub id: String,
    #[serde(default)]
    pub subjects: Vec<SubjectEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectEntry {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub experiments: Vec<ExperimentEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentEntry {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub scans: Vec<ScanEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanEntry {
    pub id: String,
    /// Acquisition type, e.g. "T1 weighted". May contain whitespace.
    #[serde(rename = "type")]
    pub scan_type: String,
    #[serde(default)]
    pub resources: Vec<ResourceEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceEntry {
    pub id: String,
    pub label: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    /// Name as generated by the remote store. May be prefixed with the
    /// owning experiment's raw identifier.
    pub name: String,
}

impl ProjectListing {
    pub fn subject(&self, id: &str) -> Option<&SubjectEntry> {
        self.subjects.iter().find(|s| s.id == id)
    }

    pub fn subject_by_label(&self, label: &str) -> Option<&SubjectEntry> {
        self.subjects.iter().find(|s| s.label == label)
    }

    /// Walk the listing along an identifier chain; `None` when any segment
    /// is unknown.
    pub fn contains(&self, addr: &RemoteAddress) -> bool {
        let ids = addr.ids();
        if ids[0] != self.id {
            return false;
        }
        let Some(sid) = ids.get(1) else { return true };
        let Some(subject) = self.subject(sid) else { return false };
        let Some(eid) = ids.get(2) else { return true };
        let Some(exp) = subject.experiment(eid) else { return false };
        let Some(scid) = ids.get(3) else { return true };
        let Some(scan) = exp.scan(scid) else { return false };
        let Some(rid) = ids.get(4) else { return true };
        let Some(res) = scan.resource(rid) else { return false };
        let Some(fid) = ids.get(5) else { return true };
        res.file(fid).is_some()
    }
}

impl SubjectEntry {
    pub fn experiment(&self, id: &str) -> Option<&ExperimentEntry> {
        self.experiments.iter().find(|e| e.id == id)
    }
}

impl ExperimentEntry {
    pub fn scan(&self, id: &str) -> Option<&ScanEntry> {
        self.scans.iter().find(|s| s.id == id)
    }
}

impl ScanEntry {
    pub fn resource(&self, id: &str) -> Option<&ResourceEntry> {
        self.resources.iter().find(|r| r.id == id)
    }
}

impl ResourceEntry {
    pub fn file(&self, id: &str) -> Option<&FileEntry> {
        self.files.iter().find(|f| f.id == id)
    }
}

/// Contract for the hierarchical remote store.
pub trait RemoteStore: Send + Sync {
    /// Existence check plus children collection for a whole project.
    fn project(&self, project_id: &str) -> Result<ProjectListing, RemoteError>;

    /// Explicit existence query for any address. Absence is a normal
    /// `Ok(false)`, never an error.
    fn exists(&self, addr: &RemoteAddress) -> Result<bool, RemoteError>;

    /// Materialize the subtree at `addr` as a single tar stream whose
    /// entries are label-named paths relative to the node's parent
    /// directory.
    fn fetch_archive(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// Body of a single file-rank object.
    fn fetch_file(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError>;

    /// Import a local subtree directory as a new child of `parent`.
    fn import_dir(
        &self,
        parent: &RemoteAddress,
        dir: &Path,
        policy: ImportPolicy,
    ) -> Result<(), RemoteError>;
}
