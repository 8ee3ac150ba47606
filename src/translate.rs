//! Translation between remote identifier chains and local label chains
//!
//! Naming rules follow the archive's conventions: scan folders are named
//! `<id>-<type>` with whitespace in the type collapsed to underscores, and
//! file names carrying the owning experiment's raw identifier as a prefix
//! are relabeled with the experiment's display label.

use std::io;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::hierarchy::{LocalPath, Rank, RemoteAddress};
use crate::remote::ProjectListing;

/// Whitespace in an acquisition type becomes '_' so the composite scan
/// folder name stays filesystem-safe.
pub fn normalize_scan_type(scan_type: &str) -> String {
    scan_type
        .chars()
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect()
}

/// Local folder name for a scan: identifier plus normalized type.
pub fn scan_dir_name(id: &str, scan_type: &str) -> String {
    format!("{}-{}", id, normalize_scan_type(scan_type))
}

/// Local name for a remote file. A leading experiment-identifier prefix is
/// replaced with the experiment's display label; anything else is kept
/// as-is.
pub fn file_local_name(remote_name: &str, experiment_id: &str, experiment_label: &str) -> String {
    match remote_name.strip_prefix(experiment_id) {
        Some(rest) => format!("{}{}", experiment_label, rest),
        None => remote_name.to_string(),
    }
}

/// Translate a remote address into the corresponding local label chain.
/// `None` when any identifier segment is unknown to the listing.
pub fn to_local_path(project: &ProjectListing, addr: &RemoteAddress) -> Option<LocalPath> {
    let ids = addr.ids();
    if ids[0] != project.id {
        return None;
    }
    let mut local = LocalPath::project(&project.id);
    let Some(sid) = ids.get(1) else { return Some(local) };
    let subject = project.subject(sid)?;
    local = local.child(&subject.label);
    let Some(eid) = ids.get(2) else { return Some(local) };
    let exp = subject.experiment(eid)?;
    local = local.child(&exp.label);
    let Some(scid) = ids.get(3) else { return Some(local) };
    let scan = exp.scan(scid)?;
    local = local.child(scan_dir_name(&scan.id, &scan.scan_type));
    let Some(rid) = ids.get(4) else { return Some(local) };
    let resource = scan.resource(rid)?;
    local = local.child(&resource.label);
    let Some(fid) = ids.get(5) else { return Some(local) };
    let file = resource.file(fid)?;
    Some(local.child(file_local_name(&file.name, &exp.id, &exp.label)))
}

/// Translate a local label chain back into a remote address. `None` when
/// no addressable counterpart exists -- a skip signal, not an error.
pub fn to_remote_address(project: &ProjectListing, local: &LocalPath) -> Option<RemoteAddress> {
    let labels = local.labels();
    if labels[0] != project.id {
        return None;
    }
    let mut addr = RemoteAddress::project(&project.id);
    let Some(slabel) = labels.get(1) else { return Some(addr) };
    let subject = project.subject_by_label(slabel)?;
    addr = addr.child(&subject.id);
    let Some(elabel) = labels.get(2) else { return Some(addr) };
    let exp = subject.experiments.iter().find(|e| &e.label == elabel)?;
    addr = addr.child(&exp.id);
    let Some(sclabel) = labels.get(3) else { return Some(addr) };
    let scan = exp
        .scans
        .iter()
        .find(|s| &scan_dir_name(&s.id, &s.scan_type) == sclabel)?;
    addr = addr.child(&scan.id);
    let Some(rlabel) = labels.get(4) else { return Some(addr) };
    let resource = scan.resources.iter().find(|r| &r.label == rlabel)?;
    addr = addr.child(&resource.id);
    let Some(flabel) = labels.get(5) else { return Some(addr) };
    let file = resource
        .files
        .iter()
        .find(|f| &file_local_name(&f.name, &exp.id, &exp.label) == flabel)?;
    Some(addr.child(&file.id))
}

/// Every file-rank descendant of `addr`, paired with its local path
/// relative to the node's parent directory. This is the entry layout of a
/// subtree archive: extracting the result under the parent directory puts
/// every rank folder at the right relative position.
pub fn archive_layout(
    project: &ProjectListing,
    addr: &RemoteAddress,
) -> Option<Vec<(RemoteAddress, PathBuf)>> {
    let node_local = to_local_path(project, addr)?;
    let anchor = node_local.parent_dir(Path::new(""));

    let mut out = Vec::new();
    let project_addr = RemoteAddress::project(&project.id);
    let project_local = LocalPath::project(&project.id);
    for subject in &project.subjects {
        let s_addr = project_addr.child(&subject.id);
        let s_local = project_local.child(&subject.label);
        for exp in &subject.experiments {
            let e_addr = s_addr.child(&exp.id);
            let e_local = s_local.child(&exp.label);
            for scan in &exp.scans {
                let sc_addr = e_addr.child(&scan.id);
                let sc_local = e_local.child(scan_dir_name(&scan.id, &scan.scan_type));
                for resource in &scan.resources {
                    let r_addr = sc_addr.child(&resource.id);
                    let r_local = sc_local.child(&resource.label);
                    for file in &resource.files {
                        let f_addr = r_addr.child(&file.id);
                        if !f_addr.starts_with(addr) {
                            continue;
                        }
                        let f_local =
                            r_local.child(file_local_name(&file.name, &exp.id, &exp.label));
                        let full = f_local.to_path(Path::new(""));
                        let rel = full
                            .strip_prefix(&anchor)
                            .expect("descendant path extends the anchor")
                            .to_path_buf();
                        out.push((f_addr, rel));
                    }
                }
            }
        }
    }
    Some(out)
}

/// One file discovered inside a subtree directory staged for import:
/// its label chain below the import parent (container folders stripped)
/// and the source path on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportFile {
    pub labels: Vec<String>,
    pub src: PathBuf,
}

/// Walk a local subtree directory that is about to be imported under a
/// node of `parent_rank` and resolve every file to its label chain.
/// Layout violations (wrong container folder, files at directory rank)
/// are `InvalidData` errors.
pub fn scan_import_tree(parent_rank: Rank, dir: &Path) -> io::Result<Vec<ImportFile>> {
    let node_rank = parent_rank
        .child()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "cannot import under a file"))?;
    let node_label = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unnamed import directory"))?
        .to_string();

    let mut out = Vec::new();
    for entry in WalkDir::new(dir).follow_links(false) {
        let entry = entry.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .expect("walkdir yields paths under its root");
        let mut labels = vec![node_label.clone()];
        let mut components = rel.components().filter_map(|c| match c {
            std::path::Component::Normal(s) => s.to_str(),
            _ => None,
        });
        let mut rank = node_rank;
        loop {
            let Some(next) = rank.child() else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("path nests deeper than the hierarchy: {}", rel.display()),
                ));
            };
            if let Some(container) = next.container_dir() {
                match components.next() {
                    Some(c) if c == container => {}
                    Some(c) => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("expected {container}/ folder, found {c}: {}", rel.display()),
                        ))
                    }
                    None => {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("file at {} rank: {}", rank, rel.display()),
                        ))
                    }
                }
            }
            match components.next() {
                Some(label) => labels.push(label.to_string()),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("bare {}/ folder: {}", next.wire_segment(), rel.display()),
                    ))
                }
            }
            rank = next;
            if components.clone().next().is_none() {
                break;
            }
        }
        if rank != Rank::File {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("file at {} rank: {}", rank, rel.display()),
            ));
        }
        out.push(ImportFile {
            labels,
            src: entry.path().to_path_buf(),
        });
    }
    Ok(out)
}

/// Split a scan folder name back into (identifier, normalized type).
/// The original whitespace is not recoverable; imports keep the slug.
pub fn parse_scan_dir_name(name: &str) -> Option<(&str, &str)> {
    name.split_once('-')
}
