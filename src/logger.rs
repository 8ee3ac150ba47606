use anyhow::Result;
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Engine event sink. Default impls are no-ops so hot paths cost nothing
/// with the `NoopLogger`.
pub trait SyncLogger: Send + Sync {
    fn probe(&self, _path: &Path, _needs_transfer: bool) {}
    fn bulk_start(&self, _uri: &str, _path: &Path) {}
    fn bulk_done(&self, _uri: &str, _path: &Path) {}
    fn descend(&self, _path: &Path, _cause: &str) {}
    fn resolved(&self, _path: &Path, _how: &str) {}
    fn error(&self, _context: &str, _path: &Path, _msg: &str) {}
    fn done(&self, _transferred: u64, _satisfied: u64, _failed: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl SyncLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    /// Log file named after the operation and start time, under a logs
    /// directory: `<dir>/<name>_20260827-141503.log`.
    pub fn timestamped(dir: &Path, name: &str) -> Result<(Self, PathBuf)> {
        let stamp = Local::now().format("%Y%m%d-%H%M%S");
        let path = dir.join(format!("{name}_{stamp}.log"));
        Ok((Self::new(&path)?, path))
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), s);
        }
    }
}

impl SyncLogger for TextLogger {
    fn probe(&self, path: &Path, needs_transfer: bool) {
        self.line(&format!(
            "PROBE path={} needs_transfer={}",
            path.display(),
            needs_transfer
        ));
    }
    fn bulk_start(&self, uri: &str, path: &Path) {
        self.line(&format!("BULK uri={} dst={}", uri, path.display()));
    }
    fn bulk_done(&self, uri: &str, path: &Path) {
        self.line(&format!("BULK-OK uri={} dst={}", uri, path.display()));
    }
    fn descend(&self, path: &Path, cause: &str) {
        self.line(&format!("DESCEND path={} cause={}", path.display(), cause));
    }
    fn resolved(&self, path: &Path, how: &str) {
        self.line(&format!("RESOLVED path={} how={}", path.display(), how));
    }
    fn error(&self, context: &str, path: &Path, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path.display(), msg));
    }
    fn done(&self, transferred: u64, satisfied: u64, failed: u64, seconds: f64) {
        self.line(&format!(
            "DONE transferred={transferred} satisfied={satisfied} failed={failed} seconds={seconds:.3}"
        ));
    }
}
