//! Tar plumbing for bulk subtree transfers

use std::io::{self, Cursor, Read};
use std::path::Path;

use tar::{Archive, Builder, EntryType, Header};

use crate::hierarchy::RemoteAddress;
use crate::remote::{ProjectListing, RemoteError};
use crate::translate;

/// Build an in-memory tar archive for the subtree at `addr`. Entry paths
/// come from the archive layout (label-named, relative to the node's
/// parent directory); entry bodies come from `read_file`.
pub fn build_archive<F>(
    project: &ProjectListing,
    addr: &RemoteAddress,
    mut read_file: F,
) -> Result<Cursor<Vec<u8>>, RemoteError>
where
    F: FnMut(&RemoteAddress) -> io::Result<Vec<u8>>,
{
    let layout = translate::archive_layout(project, addr)
        .ok_or_else(|| RemoteError::NotFound(addr.uri()))?;

    let mut builder = Builder::new(Vec::new());
    for (file_addr, rel) in layout {
        let body = read_file(&file_addr).map_err(|e| RemoteError::transfer(addr, e))?;
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, &rel, body.as_slice())
            .map_err(|e| RemoteError::transfer(addr, e))?;
    }
    let buf = builder
        .into_inner()
        .map_err(|e| RemoteError::transfer(addr, e))?;
    Ok(Cursor::new(buf))
}

/// Unpack a tar stream under `dest`. Entries that would escape `dest`
/// (absolute paths, `..` traversal) fail the whole extraction; a failed
/// extraction must not be mistaken for a complete one, so callers stage
/// into a scratch directory first.
pub fn extract_tar<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    let mut archive = Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let unpacked = entry.unpack_in(dest)?;
        if !unpacked {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "archive entry escapes destination: {}",
                    entry.path()?.display()
                ),
            ));
        }
    }
    Ok(())
}
