//! Directory-backed remote store
//!
//! Serves a staged archive tree on disk (a mounted export, a rehearsal
//! copy) through the `RemoteStore` contract. Objects are stored under
//! their identifier chain, `<root>/<project>/<subject>/<experiment>/...`,
//! and a `manifest.json` per project carries the identifier-to-label and
//! scan-type metadata the wire listing would normally provide.

use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::archive;
use crate::hierarchy::{Rank, RemoteAddress};
use crate::remote::{
    ExperimentEntry, FileEntry, ImportPolicy, ProjectListing, RemoteError, RemoteStore,
    ResourceEntry, ScanEntry, SubjectEntry,
};
use crate::translate;

const MANIFEST: &str = "manifest.json";

pub struct DirRemote {
    root: PathBuf,
    // serializes import_dir manifest read-modify-write cycles
    write_lock: Mutex<()>,
}

impl DirRemote {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Stage a new project: storage directory plus manifest. Used by
    /// tooling and the test suite; the sync engine never creates projects.
    pub fn create_project(&self, listing: &ProjectListing) -> Result<(), RemoteError> {
        fs::create_dir_all(self.root.join(&listing.id))
            .map_err(|e| RemoteError::Fatal(e.to_string()))?;
        self.save_manifest(listing)
    }

    /// Stage the body of a file-rank object already described by the
    /// manifest.
    pub fn put_file(&self, addr: &RemoteAddress, bytes: &[u8]) -> io::Result<()> {
        let path = self.storage_path(addr);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, bytes)
    }

    fn storage_path(&self, addr: &RemoteAddress) -> PathBuf {
        let mut out = self.root.clone();
        for id in addr.ids() {
            out.push(id);
        }
        out
    }

    fn manifest_path(&self, project_id: &str) -> PathBuf {
        self.root.join(project_id).join(MANIFEST)
    }

    fn load_manifest(&self, project_id: &str) -> Result<ProjectListing, RemoteError> {
        let path = self.manifest_path(project_id);
        if !path.is_file() {
            return Err(RemoteError::NotFound(
                RemoteAddress::project(project_id).uri(),
            ));
        }
        let body = fs::read_to_string(&path).map_err(|e| RemoteError::Fatal(e.to_string()))?;
        serde_json::from_str(&body)
            .map_err(|e| RemoteError::Fatal(format!("bad manifest for {project_id}: {e}")))
    }

    fn save_manifest(&self, listing: &ProjectListing) -> Result<(), RemoteError> {
        let body = serde_json::to_string_pretty(listing)
            .map_err(|e| RemoteError::Fatal(e.to_string()))?;
        fs::write(self.manifest_path(&listing.id), body)
            .map_err(|e| RemoteError::Fatal(e.to_string()))
    }
}

impl RemoteStore for DirRemote {
    fn project(&self, project_id: &str) -> Result<ProjectListing, RemoteError> {
        self.load_manifest(project_id)
    }

    fn exists(&self, addr: &RemoteAddress) -> Result<bool, RemoteError> {
        match self.load_manifest(&addr.ids()[0]) {
            Ok(listing) => Ok(listing.contains(addr)),
            Err(RemoteError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fetch_archive(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError> {
        let listing = self.load_manifest(&addr.ids()[0])?;
        let cursor = archive::build_archive(&listing, addr, |file_addr| {
            fs::read(self.storage_path(file_addr))
        })?;
        Ok(Box::new(cursor))
    }

    fn fetch_file(&self, addr: &RemoteAddress) -> Result<Box<dyn Read + Send>, RemoteError> {
        let listing = self.load_manifest(&addr.ids()[0])?;
        if !listing.contains(addr) {
            return Err(RemoteError::NotFound(addr.uri()));
        }
        let file = File::open(self.storage_path(addr))
            .map_err(|e| RemoteError::transfer(addr, format!("stored body missing: {e}")))?;
        Ok(Box::new(file))
    }

    fn import_dir(
        &self,
        parent: &RemoteAddress,
        dir: &Path,
        policy: ImportPolicy,
    ) -> Result<(), RemoteError> {
        let _guard = self.write_lock.lock();
        let mut listing = self.load_manifest(&parent.ids()[0])?;
        let items = translate::scan_import_tree(parent.rank(), dir)
            .map_err(|e| RemoteError::transfer(parent, e))?;

        for item in &items {
            let (addr, existed) = mint_import_entry(&mut listing, parent, &item.labels)?;
            if existed && policy == ImportPolicy::Append {
                // never overwrite pre-existing remote content
                continue;
            }
            let dst = self.storage_path(&addr);
            if let Some(dst_dir) = dst.parent() {
                fs::create_dir_all(dst_dir).map_err(|e| RemoteError::transfer(parent, e))?;
            }
            fs::copy(&item.src, &dst).map_err(|e| RemoteError::transfer(parent, e))?;
        }
        self.save_manifest(&listing)
    }
}

/// One segment of the label chain being imported. Ranks covered by the
/// parent address carry identifiers verbatim; deeper ranks arrive as
/// local folder labels.
#[derive(Clone, Copy)]
enum Seg<'a> {
    Id(&'a str),
    Label(&'a str),
}

impl<'a> Seg<'a> {
    fn raw(self) -> &'a str {
        match self {
            Seg::Id(s) | Seg::Label(s) => s,
        }
    }
}

/// Resolve one imported file's label chain to identifiers, minting any
/// missing listing entries along the way. Labels resolve against the
/// listing's display labels, so re-importing existing content matches the
/// original entries; new content uses its label as the minted identifier.
/// Returns the file's address and whether the listing already carried it.
pub(crate) fn mint_import_entry(
    listing: &mut ProjectListing,
    parent: &RemoteAddress,
    labels: &[String],
) -> Result<(RemoteAddress, bool), RemoteError> {
    let pids = parent.ids();
    let seg = |rank: Rank| -> Seg<'_> {
        let depth = rank.depth();
        if depth < pids.len() {
            Seg::Id(&pids[depth])
        } else {
            Seg::Label(&labels[depth - pids.len()])
        }
    };

    let sub = seg(Rank::Subject);
    let si = match listing.subjects.iter().position(|s| match sub {
        Seg::Id(id) => s.id == id,
        Seg::Label(label) => s.label == label,
    }) {
        Some(i) => i,
        None => {
            listing.subjects.push(SubjectEntry {
                id: sub.raw().to_string(),
                label: sub.raw().to_string(),
                experiments: Vec::new(),
            });
            listing.subjects.len() - 1
        }
    };
    let sub_id = listing.subjects[si].id.clone();
    let subject = &mut listing.subjects[si];

    let exp = seg(Rank::Experiment);
    let ei = match subject.experiments.iter().position(|e| match exp {
        Seg::Id(id) => e.id == id,
        Seg::Label(label) => e.label == label,
    }) {
        Some(i) => i,
        None => {
            subject.experiments.push(ExperimentEntry {
                id: exp.raw().to_string(),
                label: exp.raw().to_string(),
                scans: Vec::new(),
            });
            subject.experiments.len() - 1
        }
    };
    let exp_id = subject.experiments[ei].id.clone();
    let exp_label = subject.experiments[ei].label.clone();
    let experiment = &mut subject.experiments[ei];

    // scans have no display label; the folder slug carries id and type
    let scan_seg = seg(Rank::Scan);
    let slug_id = match scan_seg {
        Seg::Id(id) => id,
        Seg::Label(slug) => translate::parse_scan_dir_name(slug)
            .map(|(id, _)| id)
            .unwrap_or(slug),
    };
    let sci = match experiment.scans.iter().position(|s| s.id == slug_id) {
        Some(i) => i,
        None => {
            // the original whitespace of the type is not recoverable from
            // the folder slug; imports keep it normalized
            let scan_type = match scan_seg {
                Seg::Label(slug) => translate::parse_scan_dir_name(slug)
                    .map(|(_, t)| t.to_string())
                    .unwrap_or_default(),
                Seg::Id(_) => String::new(),
            };
            experiment.scans.push(ScanEntry {
                id: slug_id.to_string(),
                scan_type,
                resources: Vec::new(),
            });
            experiment.scans.len() - 1
        }
    };
    let scan_id = experiment.scans[sci].id.clone();
    let scan = &mut experiment.scans[sci];

    let res = seg(Rank::Resource);
    let ri = match scan.resources.iter().position(|r| match res {
        Seg::Id(id) => r.id == id,
        Seg::Label(label) => r.label == label,
    }) {
        Some(i) => i,
        None => {
            scan.resources.push(ResourceEntry {
                id: res.raw().to_string(),
                label: res.raw().to_string(),
                files: Vec::new(),
            });
            scan.resources.len() - 1
        }
    };
    let res_id = scan.resources[ri].id.clone();
    let resource = &mut scan.resources[ri];

    // a local file may carry either the remote name verbatim or the
    // relabeled form with the experiment's display label as prefix
    let file_seg = seg(Rank::File);
    let existing = resource.files.iter().find(|f| {
        f.id == file_seg.raw()
            || translate::file_local_name(&f.name, &exp_id, &exp_label) == file_seg.raw()
    });
    let (file_id, existed) = match existing {
        Some(f) => (f.id.clone(), true),
        None => {
            let name = match file_seg.raw().strip_prefix(exp_label.as_str()) {
                Some(rest) => format!("{exp_id}{rest}"),
                None => file_seg.raw().to_string(),
            };
            resource.files.push(FileEntry {
                id: name.clone(),
                name: name.clone(),
            });
            (name, false)
        }
    };

    let addr = RemoteAddress::project(&listing.id)
        .child(sub_id)
        .child(exp_id)
        .child(scan_id)
        .child(res_id)
        .child(file_id);
    Ok((addr, existed))
}
