//! Bulk transfer attempts
//!
//! A pull stages the archive into a scratch directory first and only moves
//! the subtree into place once extraction finished cleanly, so a failed
//! attempt never leaves partially-extracted files that a later probe would
//! count as "complete". Success/failure is binary from the caller's view.

use std::fs;
use std::io;
use std::path::Path;

use crate::archive;
use crate::hierarchy::{LocalPath, RemoteAddress};
use crate::remote::{ImportPolicy, RemoteError, RemoteStore};

/// Download the whole subtree at `addr` as one archive and land it at the
/// node's local position under `root`.
pub fn pull_subtree(
    remote: &dyn RemoteStore,
    addr: &RemoteAddress,
    local: &LocalPath,
    root: &Path,
) -> Result<(), RemoteError> {
    let reader = remote.fetch_archive(addr)?;

    let anchor = local.parent_dir(root);
    fs::create_dir_all(&anchor).map_err(|e| RemoteError::transfer(addr, e))?;

    // Stage inside the root so the final move is a same-filesystem rename.
    let staging = tempfile::Builder::new()
        .prefix(".arcsync-stage-")
        .tempdir_in(root)
        .map_err(|e| RemoteError::transfer(addr, e))?;
    archive::extract_tar(reader, staging.path()).map_err(|e| RemoteError::transfer(addr, e))?;

    let staged = staging.path().join(local.label());
    let target = local.to_path(root);
    if staged.is_dir() {
        // The prober only sends us here for a missing or empty target.
        if target.is_dir() {
            fs::remove_dir(&target).map_err(|e| RemoteError::transfer(addr, e))?;
        }
        fs::rename(&staged, &target).map_err(|e| RemoteError::transfer(addr, e))?;
    }
    // A subtree with no files still resolves to a directory, so a rerun
    // probes it as satisfied.
    fs::create_dir_all(&target).map_err(|e| RemoteError::transfer(addr, e))?;
    Ok(())
}

/// Download a single file-rank object to its local name.
pub fn pull_file(
    remote: &dyn RemoteStore,
    addr: &RemoteAddress,
    local: &LocalPath,
    root: &Path,
) -> Result<(), RemoteError> {
    let mut reader = remote.fetch_file(addr)?;

    let dir = local.parent_dir(root);
    fs::create_dir_all(&dir).map_err(|e| RemoteError::transfer(addr, e))?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(|e| RemoteError::transfer(addr, e))?;
    io::copy(&mut reader, &mut tmp).map_err(|e| RemoteError::transfer(addr, e))?;
    tmp.persist(local.to_path(root))
        .map_err(|e| RemoteError::transfer(addr, e))?;
    Ok(())
}

/// Import a local subtree directory as a child of `parent`, append-only.
/// Pre-existing remote content is never overwritten.
pub fn push_subtree(
    remote: &dyn RemoteStore,
    dir: &Path,
    parent: &RemoteAddress,
) -> Result<(), RemoteError> {
    remote.import_dir(parent, dir, ImportPolicy::Append)
}
