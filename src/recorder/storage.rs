//! Storage retention: keeps the record directory under its size quota by
//! deleting the least valuable files first.

use crate::recorder::common::PipelineError;
use crate::recorder::naming::parse_chunk_name;
use chrono::NaiveDateTime;
use log::{debug, error, info, warn};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

const RW_PROBE_FILE: &str = "_rw_test_file";
const BYTES_PER_MB: u64 = 1024 * 1024;

/// One regular file found by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: PathBuf,
    pub file_name: String,
    pub size_bytes: u64,
    start: Option<NaiveDateTime>,
}

impl FileRef {
    pub fn new(path: PathBuf, size_bytes: u64) -> FileRef {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let start = parse_chunk_name(&file_name).map(|c| c.start);
        FileRef {
            path,
            file_name,
            size_bytes,
            start,
        }
    }

    pub fn is_chunk(&self) -> bool {
        self.start.is_some()
    }
}

/// Retention priority; `Greater` means `a` is kept longer than `b`.
///
/// Chunk files beat everything else and newer chunks beat older ones. Other
/// files are ordered by name. Full paths break the remaining ties so the order
/// is total.
pub fn priority(a: &FileRef, b: &FileRef) -> Ordering {
    match (&a.start, &b.start) {
        (Some(x), Some(y)) => x.cmp(y),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.file_name.cmp(&b.file_name),
    }
    .then_with(|| a.path.cmp(&b.path))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub files: usize,
    pub total_bytes: u64,
    pub remaining_bytes: u64,
    pub removed: Vec<PathBuf>,
}

fn collect_files(dir: &Path, files: &mut Vec<FileRef>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!("retention: cannot read {}: {e}", dir.display());
            return;
        }
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        let path = entry.path();
        if file_type.is_dir() {
            collect_files(&path, files);
        } else if file_type.is_file() {
            match entry.metadata() {
                Ok(meta) => files.push(FileRef::new(path, meta.len())),
                Err(e) => debug!("retention: cannot stat {}: {e}", path.display()),
            }
        }
    }
}

/// Enumerates every regular file under `root` and deletes the lowest priority
/// ones while the total is at or above `quota_bytes`.
pub fn scan(root: &Path, quota_bytes: u64) -> ScanReport {
    let mut files = Vec::new();
    collect_files(root, &mut files);
    files.sort_by(|a, b| priority(b, a));

    let total_bytes: u64 = files.iter().map(|f| f.size_bytes).sum();
    let mut report = ScanReport {
        files: files.len(),
        total_bytes,
        remaining_bytes: total_bytes,
        removed: Vec::new(),
    };
    while report.remaining_bytes >= quota_bytes {
        let Some(file) = files.pop() else {
            break;
        };
        match fs::remove_file(&file.path) {
            Ok(()) => {
                report.remaining_bytes -= file.size_bytes;
                info!("chunk removed due to file size limit: {}", file.path.display());
                report.removed.push(file.path);
            }
            Err(e) => warn!("failed to remove {}: {e}", file.path.display()),
        }
    }
    report
}

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct RetentionEngine {
    root: PathBuf,
    quota_mb: u64,
    interval_sec: i64,
    last_scan: Mutex<Option<i64>>,
    slot: Mutex<Option<JoinHandle<ScanReport>>>,
}

impl RetentionEngine {
    /// Creates the record directory and checks that it is writable.
    pub fn init(
        root: impl Into<PathBuf>,
        quota_mb: u64,
        interval_sec: u64,
    ) -> Result<RetentionEngine, PipelineError> {
        let root = root.into();
        let storage_err =
            |what: &str, e: std::io::Error| PipelineError::Storage(format!("{what} {}: {e}", root.display()));

        fs::create_dir_all(&root).map_err(|e| storage_err("cannot create", e))?;
        let probe = root.join(RW_PROBE_FILE);
        fs::write(&probe, b"rw").map_err(|e| storage_err("cannot write to", e))?;
        fs::remove_file(&probe).map_err(|e| storage_err("cannot delete from", e))?;

        info!(
            "record dir {} ready, quota {} MB, checked every {} s",
            root.display(),
            quota_mb,
            interval_sec
        );
        Ok(RetentionEngine {
            root,
            quota_mb,
            interval_sec: i64::try_from(interval_sec).unwrap_or(i64::MAX),
            last_scan: Mutex::new(None),
            slot: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Starts a background scan when one is due. Never blocks; returns whether
    /// a scan was started.
    pub fn tick(&self, now: i64) -> bool {
        if self.quota_mb == 0 {
            return false;
        }
        let mut slot = locked(&self.slot);
        if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        if let Some(handle) = slot.take() {
            Self::collect(handle);
        }

        let mut last_scan = locked(&self.last_scan);
        if last_scan.is_some_and(|last| now.saturating_sub(last) < self.interval_sec) {
            return false;
        }
        *last_scan = Some(now);

        let root = self.root.clone();
        let quota_bytes = self.quota_mb.saturating_mul(BYTES_PER_MB);
        match thread::Builder::new()
            .name("retention-scan".to_string())
            .spawn(move || scan(&root, quota_bytes))
        {
            Ok(handle) => {
                *slot = Some(handle);
                true
            }
            Err(e) => {
                error!("cannot start retention scan: {e}");
                false
            }
        }
    }

    /// Blocks until the in-flight scan, if any, is done.
    pub fn wait(&self) -> Option<ScanReport> {
        let handle = locked(&self.slot).take()?;
        Self::collect(handle)
    }

    fn collect(handle: JoinHandle<ScanReport>) -> Option<ScanReport> {
        match handle.join() {
            Ok(report) => {
                debug!(
                    "retention scan: {} files, {} bytes, {} removed, {} bytes left",
                    report.files,
                    report.total_bytes,
                    report.removed.len(),
                    report.remaining_bytes
                );
                Some(report)
            }
            Err(_) => {
                error!("retention scan panicked");
                None
            }
        }
    }
}

impl Drop for RetentionEngine {
    fn drop(&mut self) {
        self.wait();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;

    const MB: u64 = BYTES_PER_MB;

    // sparse files report their full length without using the disk
    fn sparse(path: &Path, size: u64) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        File::create(path).unwrap().set_len(size).unwrap();
    }

    fn chunk_name(start_min: u32) -> String {
        format!(
            "cam#2024-05-01 10:{start_min:02}:00#2024-05-01 10:{:02}:00.avi",
            start_min + 1
        )
    }

    fn fill(root: &Path) {
        for name in ["a.log", "b.log", "c.log", "notes.txt", "z.dat"] {
            sparse(&root.join(name), 10 * MB);
        }
        for minute in [3, 1, 4, 0, 2] {
            sparse(&root.join("cam").join(chunk_name(minute)), 10 * MB);
        }
    }

    fn remaining(root: &Path) -> Vec<String> {
        let mut files = Vec::new();
        collect_files(root, &mut files);
        let mut names: Vec<String> = files.into_iter().map(|f| f.file_name).collect();
        names.sort();
        names
    }

    #[test]
    fn deletes_lowest_priority_until_under_quota() {
        let _ = env_logger::try_init();
        let dir = tempfile::tempdir().unwrap();
        fill(dir.path());

        let report = scan(dir.path(), 80 * MB);
        assert_eq!(report.files, 10);
        assert_eq!(report.total_bytes, 100 * MB);
        assert_eq!(report.remaining_bytes, 70 * MB);
        let removed: Vec<_> = report
            .removed
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(removed, vec!["a.log", "b.log", "c.log"]);
        assert_eq!(remaining(dir.path()).len(), 7);
    }

    #[test]
    fn chunks_outlive_other_files() {
        let dir = tempfile::tempdir().unwrap();
        fill(dir.path());

        let report = scan(dir.path(), 30 * MB);
        assert_eq!(report.removed.len(), 8);
        assert_eq!(report.remaining_bytes, 20 * MB);
        assert_eq!(remaining(dir.path()), vec![chunk_name(3), chunk_name(4)]);
    }

    #[test]
    fn under_quota_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fill(dir.path());
        let report = scan(dir.path(), 101 * MB);
        assert!(report.removed.is_empty());
        assert_eq!(remaining(dir.path()).len(), 10);
    }

    #[test]
    fn priority_is_a_total_order() {
        let old = FileRef::new(PathBuf::from("/r/cam").join(chunk_name(0)), 1);
        let new = FileRef::new(PathBuf::from("/r/cam").join(chunk_name(5)), 1);
        let twin = FileRef::new(PathBuf::from("/r/cam2").join(chunk_name(5)), 1);
        let log = FileRef::new(PathBuf::from("/r/zzz.log"), 1);
        let other = FileRef::new(PathBuf::from("/r/aaa.log"), 1);
        let bad_time = FileRef::new(PathBuf::from("/r/cam#yesterday#today.avi"), 1);

        assert!(new.is_chunk());
        assert!(!bad_time.is_chunk());
        assert_eq!(priority(&new, &old), Ordering::Greater);
        assert_eq!(priority(&old, &log), Ordering::Greater);
        assert_eq!(priority(&log, &old), Ordering::Less);
        assert_eq!(priority(&log, &other), Ordering::Greater);
        assert_eq!(priority(&twin, &new), Ordering::Greater);
        assert_eq!(priority(&new, &new.clone()), Ordering::Equal);
    }

    #[test]
    fn init_probes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("rec").join("nested");
        let engine = RetentionEngine::init(&root, 10, 5).unwrap();
        assert!(root.is_dir());
        assert!(!root.join(RW_PROBE_FILE).exists());
        assert_eq!(engine.root(), root.as_path());
    }

    #[test]
    fn init_fails_when_root_is_unusable() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"x").unwrap();
        assert!(matches!(
            RetentionEngine::init(blocker.join("rec"), 10, 5),
            Err(PipelineError::Storage(_))
        ));
    }

    #[test]
    fn tick_honours_quota_and_interval() {
        let dir = tempfile::tempdir().unwrap();
        let disabled = RetentionEngine::init(dir.path(), 0, 0).unwrap();
        assert!(!disabled.tick(100));

        let engine = RetentionEngine::init(dir.path(), 1, 10).unwrap();
        sparse(&dir.path().join("big.bin"), 2 * MB);
        assert!(engine.tick(100));
        let report = engine.wait().unwrap();
        assert_eq!(report.removed.len(), 1);

        assert!(!engine.tick(105));
        assert!(engine.wait().is_none());
        assert!(engine.tick(110));
        assert_eq!(engine.wait().unwrap().files, 0);
    }
}
