//! Local existence probing
//!
//! Completeness is never diffed file-by-file at directory ranks: a
//! populated directory counts as synced at that granularity. File-rank
//! refinement only happens when the engine descends that far.

use std::io;
use std::path::Path;

use crate::hierarchy::Rank;

/// Whether the local side still needs a transfer for this node.
///
/// Directory ranks: true iff the path is missing or an empty directory.
/// File rank: true iff no file of that name exists; present files are
/// never size- or hash-verified.
pub fn needs_transfer(path: &Path, rank: Rank) -> io::Result<bool> {
    if rank == Rank::File {
        return Ok(!path.is_file());
    }
    if !path.is_dir() {
        return Ok(true);
    }
    Ok(path.read_dir()?.next().is_none())
}
