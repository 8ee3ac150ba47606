//! Run-scoped memo of resolved subtrees
//!
//! One ledger per sync invocation; nothing survives the process. Keys are
//! coarse on purpose: subject, or (subject, experiment). Once a key is
//! marked, no descendant of that subtree is independently revisited.

use std::collections::HashSet;

use parking_lot::Mutex;

use crate::hierarchy::LocalPath;

/// Subtree identity at ledger granularity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubtreeKey {
    Subject(String),
    Experiment(String, String),
}

impl SubtreeKey {
    /// Key for the node itself, when the node sits at a ledger rank.
    pub fn for_node(local: &LocalPath) -> Option<SubtreeKey> {
        let labels = local.labels();
        match labels.len() {
            2 => Some(SubtreeKey::Subject(labels[1].clone())),
            3 => Some(SubtreeKey::Experiment(labels[1].clone(), labels[2].clone())),
            _ => None,
        }
    }

    /// Keys of every ledger-rank ancestor covering this node, outermost
    /// first.
    pub fn ancestors(local: &LocalPath) -> Vec<SubtreeKey> {
        let labels = local.labels();
        let mut out = Vec::new();
        if labels.len() > 2 {
            out.push(SubtreeKey::Subject(labels[1].clone()));
        }
        if labels.len() > 3 {
            out.push(SubtreeKey::Experiment(labels[1].clone(), labels[2].clone()));
        }
        out
    }
}

/// Guarded so subject-level workers can share one instance.
#[derive(Debug, Default)]
pub struct TransferLedger {
    resolved: Mutex<HashSet<SubtreeKey>>,
}

impl TransferLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_resolved(&self, key: &SubtreeKey) -> bool {
        self.resolved.lock().contains(key)
    }

    pub fn mark_resolved(&self, key: SubtreeKey) {
        self.resolved.lock().insert(key);
    }

    /// True when the node or any ledger-rank ancestor is already resolved.
    pub fn covers(&self, local: &LocalPath) -> bool {
        let resolved = self.resolved.lock();
        if let Some(key) = SubtreeKey::for_node(local) {
            if resolved.contains(&key) {
                return true;
            }
        }
        SubtreeKey::ancestors(local)
            .iter()
            .any(|k| resolved.contains(k))
    }
}
