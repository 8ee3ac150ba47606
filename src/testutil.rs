//! In-memory remote store for the test suite
//!
//! Counts every contract call, can be scripted to fail bulk fetches for
//! chosen subtrees or to go down entirely, and records any mutation of
//! pre-existing content so tests can prove the append policy held.

use std::collections::{BTreeMap, HashSet};
use std::io::{Cursor, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::archive;
use crate::hierarchy::RemoteAddress;
use crate::remote::{ImportPolicy, ProjectListing, RemoteError, RemoteStore};
use crate::translate;

#[derive(Debug, Default)]
pub struct CallCounts {
    pub project: AtomicUsize,
    pub exists: AtomicUsize,
    pub fetch_archive: AtomicUsize,
    pub fetch_file: AtomicUsize,
    pub import_dir: AtomicUsize,
}

impl CallCounts {
    pub fn archives(&self) -> usize {
        self.fetch_archive.load(Ordering::Relaxed)
    }
    pub fn files(&self) -> usize {
        self.fetch_file.load(Ordering::Relaxed)
    }
    pub fn existence_queries(&self) -> usize {
        self.exists.load(Ordering::Relaxed)
    }
    pub fn imports(&self) -> usize {
        self.import_dir.load(Ordering::Relaxed)
    }
}

pub struct FakeRemote {
    listing: Mutex<ProjectListing>,
    bodies: Mutex<BTreeMap<String, Vec<u8>>>,
    failing_bulk: Mutex<HashSet<String>>,
    failing_exact: Mutex<HashSet<String>>,
    down: AtomicBool,
    mutated: Mutex<Vec<String>>,
    pub calls: CallCounts,
}

impl FakeRemote {
    pub fn new(listing: ProjectListing) -> Self {
        Self {
            listing: Mutex::new(listing),
            bodies: Mutex::new(BTreeMap::new()),
            failing_bulk: Mutex::new(HashSet::new()),
            failing_exact: Mutex::new(HashSet::new()),
            down: AtomicBool::new(false),
            mutated: Mutex::new(Vec::new()),
            calls: CallCounts::default(),
        }
    }

    pub fn stage_file(&self, addr: &RemoteAddress, body: &[u8]) {
        self.bodies.lock().insert(addr.uri(), body.to_vec());
    }

    /// Script bulk operations at or under `addr` to fail with a transfer
    /// error, forcing the engine to descend.
    pub fn fail_bulk_under(&self, addr: &RemoteAddress) {
        self.failing_bulk.lock().insert(addr.uri());
    }

    /// Like `fail_bulk_under`, but only for `addr` itself: one rank of
    /// descent is enough to get past it.
    pub fn fail_bulk_at(&self, addr: &RemoteAddress) {
        self.failing_exact.lock().insert(addr.uri());
    }

    pub fn clear_bulk_failures(&self) {
        self.failing_bulk.lock().clear();
        self.failing_exact.lock().clear();
    }

    /// Simulate the whole service becoming unreachable.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::Relaxed);
    }

    /// Remote-side writes that replaced or removed pre-existing content.
    /// Stays empty under the append policy.
    pub fn mutations(&self) -> Vec<String> {
        self.mutated.lock().clone()
    }

    pub fn stored_uris(&self) -> Vec<String> {
        self.bodies.lock().keys().cloned().collect()
    }

    fn check_up(&self) -> Result<(), RemoteError> {
        if self.down.load(Ordering::Relaxed) {
            Err(RemoteError::Fatal("connection refused".into()))
        } else {
            Ok(())
        }
    }

    fn bulk_scripted_to_fail(&self, addr: &RemoteAddress) -> bool {
        let uri = addr.uri();
        if self.failing_exact.lock().contains(&uri) {
            return true;
        }
        let failing = self.failing_bulk.lock();
        failing.iter().any(|prefix| uri.starts_with(prefix.as_str()))
    }
}

impl RemoteStore for FakeRemote {
    fn project(&self, project_id: &str) -> Result<ProjectListing, RemoteError> {
        self.calls.project.fetch_add(1, Ordering::Relaxed);
        self.check_up()?;
        let listing = self.listing.lock();
        if listing.id != project_id {
            return Err(RemoteError::NotFound(
                RemoteAddress::project(project_id).uri(),
            ));
        }
        Ok(listing.clone())
    }

    fn exists(&self, addr: &RemoteAddress) -> Result<bool, RemoteError> {
        self.calls.exists.fetch_add(1, Ordering::Relaxed);
        self.check_up()?;
        Ok(self.listing.lock().contains(addr))
    }

    fn fetch_archive(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError> {
        self.calls.fetch_archive.fetch_add(1, Ordering::Relaxed);
        self.check_up()?;
        if self.bulk_scripted_to_fail(addr) {
            return Err(RemoteError::transfer(addr, "simulated archive failure"));
        }
        let listing = self.listing.lock().clone();
        let bodies = self.bodies.lock();
        let cursor = archive::build_archive(&listing, addr, |file_addr| {
            Ok(bodies.get(&file_addr.uri()).cloned().unwrap_or_default())
        })?;
        Ok(Box::new(cursor))
    }

    fn fetch_file(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError> {
        self.calls.fetch_file.fetch_add(1, Ordering::Relaxed);
        self.check_up()?;
        match self.bodies.lock().get(&addr.uri()) {
            Some(body) => Ok(Box::new(Cursor::new(body.clone()))),
            None => Err(RemoteError::NotFound(addr.uri())),
        }
    }

    fn import_dir(
        &self,
        parent: &RemoteAddress,
        dir: &Path,
        policy: ImportPolicy,
    ) -> Result<(), RemoteError> {
        self.calls.import_dir.fetch_add(1, Ordering::Relaxed);
        self.check_up()?;
        if self.bulk_scripted_to_fail(parent) {
            return Err(RemoteError::transfer(parent, "simulated import failure"));
        }
        let items = translate::scan_import_tree(parent.rank(), dir)
            .map_err(|e| RemoteError::transfer(parent, e))?;

        let mut listing = self.listing.lock();
        let mut bodies = self.bodies.lock();
        for item in &items {
            let (addr, existed) = crate::dir_remote::mint_import_entry(&mut listing, parent, &item.labels)?;
            let uri = addr.uri();
            if existed && policy == ImportPolicy::Append {
                continue;
            }
            if bodies.contains_key(&uri) {
                self.mutated.lock().push(uri.clone());
            }
            let body = std::fs::read(&item.src).map_err(|e| RemoteError::transfer(parent, e))?;
            bodies.insert(uri, body);
        }
        Ok(())
    }
}
