//! Single-session convenience operations
//!
//! `grab` pulls one experiment's subtree as a tar archive; `put` uploads
//! one session directory, refusing sessions the remote already has. Both
//! map their failures to the exit codes of the site's transfer scripts.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::hierarchy::RemoteAddress;
use crate::remote::{
    ExperimentEntry, ImportPolicy, ProjectListing, RemoteError, RemoteStore, SubjectEntry,
};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("project {0} does not exist")]
    UnknownProject(String),

    #[error("session {0} does not exist")]
    UnknownSession(String),

    #[error("local session {} does not exist", .0.display())]
    MissingLocal(PathBuf),

    #[error("session {0} already exists")]
    AlreadyExists(String),

    #[error("error downloading session data: {0}")]
    Download(RemoteError),

    #[error("error uploading session data: {0}")]
    Upload(RemoteError),

    #[error(transparent)]
    Unavailable(RemoteError),
}

impl SessionError {
    /// Process exit code for the single-session commands.
    pub fn exit_code(&self) -> i32 {
        match self {
            SessionError::UnknownProject(_) => 1,
            SessionError::UnknownSession(_) | SessionError::MissingLocal(_) => 2,
            SessionError::AlreadyExists(_) | SessionError::Download(_) => 3,
            SessionError::Upload(_) => 4,
            SessionError::Unavailable(_) => 9,
        }
    }
}

fn load_listing(remote: &dyn RemoteStore, project: &str) -> Result<ProjectListing, SessionError> {
    match remote.project(project) {
        Ok(listing) => Ok(listing),
        Err(RemoteError::NotFound(_)) => Err(SessionError::UnknownProject(project.to_string())),
        Err(e) => Err(SessionError::Unavailable(e)),
    }
}

/// Look a session up by its display label, across all subjects.
pub fn find_session<'a>(
    listing: &'a ProjectListing,
    label: &str,
) -> Option<(&'a SubjectEntry, &'a ExperimentEntry)> {
    listing.subjects.iter().find_map(|s| {
        s.experiments
            .iter()
            .find(|e| e.label == label)
            .map(|e| (s, e))
    })
}

/// Download one experiment's subtree as `<label>.tar` under `dest`.
/// Returns the path of the written archive.
pub fn grab(
    remote: &dyn RemoteStore,
    project: &str,
    label: &str,
    dest: &Path,
) -> Result<PathBuf, SessionError> {
    let listing = load_listing(remote, project)?;
    let (subject, exp) = find_session(&listing, label)
        .ok_or_else(|| SessionError::UnknownSession(label.to_string()))?;
    let addr = RemoteAddress::project(&listing.id)
        .child(&subject.id)
        .child(&exp.id);

    let out_path = dest.join(format!("{label}.tar"));
    let result = remote.fetch_archive(&addr).and_then(|mut reader| {
        let mut out = File::create(&out_path).map_err(|e| RemoteError::transfer(&addr, e))?;
        io::copy(&mut reader, &mut out).map_err(|e| RemoteError::transfer(&addr, e))
    });
    match result {
        Ok(_) => Ok(out_path),
        Err(RemoteError::Fatal(e)) => Err(SessionError::Unavailable(RemoteError::Fatal(e))),
        Err(e) => Err(SessionError::Download(e)),
    }
}

/// Upload one session directory as a child of `subject`, append-only.
/// Returns the session label on success.
pub fn put(
    remote: &dyn RemoteStore,
    project: &str,
    subject: &str,
    dir: &Path,
) -> Result<String, SessionError> {
    if !dir.is_dir() {
        return Err(SessionError::MissingLocal(dir.to_path_buf()));
    }
    let label = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| SessionError::MissingLocal(dir.to_path_buf()))?
        .to_string();

    let listing = load_listing(remote, project)?;
    if find_session(&listing, &label).is_some() {
        return Err(SessionError::AlreadyExists(label));
    }

    // new subjects are unknown to the listing; label doubles as the id
    let subject_id = listing
        .subject_by_label(subject)
        .map(|s| s.id.clone())
        .unwrap_or_else(|| subject.to_string());
    let parent = RemoteAddress::project(&listing.id).child(subject_id);
    match remote.import_dir(&parent, dir, ImportPolicy::Append) {
        Ok(()) => Ok(label),
        Err(RemoteError::Fatal(e)) => Err(SessionError::Unavailable(RemoteError::Fatal(e))),
        Err(e) => Err(SessionError::Upload(e)),
    }
}
