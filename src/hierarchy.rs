//! Fixed hierarchy model: ranks, remote addresses, local paths
//!
//! The archive organizes data as project -> subject -> experiment -> scan
//! -> resource -> file. A node is addressed remotely by a chain of stable
//! identifiers and locally by a chain of human-readable labels; the two
//! chains always have the same length (one segment per rank).

use std::fmt;
use std::path::{Component, Path, PathBuf};

/// A level in the fixed hierarchy chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Project,
    Subject,
    Experiment,
    Scan,
    Resource,
    File,
}

impl Rank {
    pub const CHAIN: [Rank; 6] = [
        Rank::Project,
        Rank::Subject,
        Rank::Experiment,
        Rank::Scan,
        Rank::Resource,
        Rank::File,
    ];

    /// The next rank down, if any. Children of a node always belong to
    /// exactly this rank.
    pub fn child(self) -> Option<Rank> {
        match self {
            Rank::Project => Some(Rank::Subject),
            Rank::Subject => Some(Rank::Experiment),
            Rank::Experiment => Some(Rank::Scan),
            Rank::Scan => Some(Rank::Resource),
            Rank::Resource => Some(Rank::File),
            Rank::File => None,
        }
    }

    pub fn depth(self) -> usize {
        self as usize
    }

    pub fn from_depth(depth: usize) -> Option<Rank> {
        Rank::CHAIN.get(depth).copied()
    }

    /// Collection segment used in wire addresses ("/data/projects/P/...").
    pub fn wire_segment(self) -> &'static str {
        match self {
            Rank::Project => "projects",
            Rank::Subject => "subjects",
            Rank::Experiment => "experiments",
            Rank::Scan => "scans",
            Rank::Resource => "resources",
            Rank::File => "files",
        }
    }

    /// Container folder inserted above this rank in the local layout.
    /// Project, subject and experiment folders nest directly; scan,
    /// resource and file folders live under a named container.
    pub fn container_dir(self) -> Option<&'static str> {
        match self {
            Rank::Scan => Some("scans"),
            Rank::Resource => Some("resources"),
            Rank::File => Some("files"),
            _ => None,
        }
    }

    /// Whether a subtree rooted at this rank can be moved as one archive.
    pub fn bulk_transferable(self) -> bool {
        self != Rank::File
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Rank::Project => "project",
            Rank::Subject => "subject",
            Rank::Experiment => "experiment",
            Rank::Scan => "scan",
            Rank::Resource => "resource",
            Rank::File => "file",
        };
        f.write_str(name)
    }
}

/// Ordered identifier chain from project down to the node's own rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteAddress {
    ids: Vec<String>,
}

impl RemoteAddress {
    pub fn project(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
        }
    }

    /// Address of a child one rank down.
    pub fn child(&self, id: impl Into<String>) -> Self {
        debug_assert!(self.rank().child().is_some(), "file rank has no children");
        let mut ids = self.ids.clone();
        ids.push(id.into());
        Self { ids }
    }

    pub fn rank(&self) -> Rank {
        Rank::from_depth(self.ids.len() - 1).expect("address deeper than hierarchy")
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// The node's own identifier (last segment).
    pub fn id(&self) -> &str {
        self.ids.last().expect("address is never empty")
    }

    /// Wire form, e.g. `/data/projects/P/subjects/S/experiments/E`.
    pub fn uri(&self) -> String {
        let mut out = String::from("/data");
        for (rank, id) in Rank::CHAIN.iter().zip(&self.ids) {
            out.push('/');
            out.push_str(rank.wire_segment());
            out.push('/');
            out.push_str(id);
        }
        out
    }

    /// True if `self` is `other` or one of its descendants.
    pub fn starts_with(&self, other: &RemoteAddress) -> bool {
        self.ids.len() >= other.ids.len() && self.ids[..other.ids.len()] == other.ids[..]
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Ordered label chain relative to a local root, one label per rank.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LocalPath {
    labels: Vec<String>,
}

impl LocalPath {
    pub fn project(label: impl Into<String>) -> Self {
        Self {
            labels: vec![label.into()],
        }
    }

    pub fn child(&self, label: impl Into<String>) -> Self {
        debug_assert!(self.rank().child().is_some(), "file rank has no children");
        let mut labels = self.labels.clone();
        labels.push(label.into());
        Self { labels }
    }

    pub fn rank(&self) -> Rank {
        Rank::from_depth(self.labels.len() - 1).expect("path deeper than hierarchy")
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// The node's own folder or file name (last segment).
    pub fn label(&self) -> &str {
        self.labels.last().expect("path is never empty")
    }

    /// Render under `root`, inserting the container folders:
    /// `root/P/S/E/scans/SC/resources/R/files/F`.
    pub fn to_path(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for (rank, label) in Rank::CHAIN.iter().zip(&self.labels) {
            if let Some(container) = rank.container_dir() {
                out.push(container);
            }
            out.push(label);
        }
        out
    }

    /// Directory the node's own folder lives in: `to_path` minus the last
    /// label, container folder included. This is the anchor a subtree
    /// archive is extracted under.
    pub fn parent_dir(&self, root: &Path) -> PathBuf {
        let mut out = root.to_path_buf();
        for (i, (rank, label)) in Rank::CHAIN.iter().zip(&self.labels).enumerate() {
            if let Some(container) = rank.container_dir() {
                out.push(container);
            }
            if i + 1 < self.labels.len() {
                out.push(label);
            }
        }
        out
    }

    /// Parse a path under `root` back into a label chain. `None` when the
    /// layout does not correspond to any rank (wrong container folder or
    /// too many segments) -- the caller treats that as "skip".
    pub fn from_path(root: &Path, path: &Path) -> Option<LocalPath> {
        let rel = path.strip_prefix(root).ok()?;
        let mut components = rel.components().filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_str()),
            _ => None,
        });
        let mut labels = Vec::new();
        for rank in Rank::CHAIN {
            if let Some(container) = rank.container_dir() {
                match components.next() {
                    Some(Some(c)) if c == container => {}
                    Some(_) => return None,
                    None => break,
                }
            }
            match components.next() {
                Some(Some(label)) => labels.push(label.to_string()),
                Some(None) => return None,
                None => {
                    if rank.container_dir().is_some() {
                        // container folder without a member below it
                        return None;
                    }
                    break;
                }
            }
        }
        if labels.is_empty() || components.next().is_some() {
            return None;
        }
        Some(LocalPath { labels })
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.labels.join("/"))
    }
}
