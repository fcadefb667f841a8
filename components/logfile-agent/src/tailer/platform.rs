//! Platform-specific file accounting.
//!
//! Two concerns live behind [`Platform`]: the hard-link count used to
//! detect a file deleted out from under an open descriptor, and the
//! process open-file ceiling that bounds how many tailers may hold
//! handles at once.

// Local crates
use crate::metrics::metrics::OPEN_FILE_HANDLES;

// External crates
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Handles kept back from the budget for the agent's own files (state
/// files, logs, sockets).
pub const FD_RESERVE: usize = 64;

#[cfg(unix)]
const DEFAULT_OPEN_FILE_LIMIT: usize = 1024;

#[cfg(windows)]
const WINDOWS_HANDLE_CEILING: usize = 16_384;

pub trait Platform: Send + Sync + fmt::Debug {
    /// Directory entries still referencing the file, extracted from an
    /// fstat of the open descriptor.
    fn hard_link_count(&self, meta: &std::fs::Metadata) -> u64;

    /// Maximum file handles the process may hold.
    fn open_file_limit(&self) -> usize;
}

/// The real host. POSIX reads `RLIMIT_NOFILE` out of `/proc/self/limits`;
/// Windows uses the static handle ceiling.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

#[cfg(unix)]
impl Platform for HostPlatform {
    fn hard_link_count(&self, meta: &std::fs::Metadata) -> u64 {
        use std::os::unix::fs::MetadataExt;
        meta.nlink()
    }

    fn open_file_limit(&self) -> usize {
        read_proc_nofile_limit().unwrap_or(DEFAULT_OPEN_FILE_LIMIT)
    }
}

#[cfg(unix)]
fn read_proc_nofile_limit() -> Option<usize> {
    let limits = std::fs::read_to_string("/proc/self/limits").ok()?;
    let line = limits.lines().find(|l| l.starts_with("Max open files"))?;
    // "Max open files   <soft>   <hard>   files"
    line.split_whitespace().nth(3)?.parse().ok()
}

#[cfg(windows)]
impl Platform for HostPlatform {
    fn hard_link_count(&self, meta: &std::fs::Metadata) -> u64 {
        // NumberOfLinks is not reachable through the stable std; report
        // the link as alive and rely on remove/rename notifications.
        let _ = meta;
        1
    }

    fn open_file_limit(&self) -> usize {
        WINDOWS_HANDLE_CEILING
    }
}

/// Identity of a file independent of its name.
///
/// POSIX pairs device and inode. Windows has no stable equivalent here,
/// so identity degenerates to "unknown" and comparisons succeed; the
/// deletion path then falls back to the name held at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    #[cfg(unix)]
    dev: u64,
    #[cfg(unix)]
    ino: u64,
}

impl FileIdentity {
    pub fn of(meta: &std::fs::Metadata) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Self {
                dev: meta.dev(),
                ino: meta.ino(),
            }
        }
        #[cfg(windows)]
        {
            let _ = meta;
            Self {}
        }
    }

    pub fn from_path(path: &Path) -> io::Result<Self> {
        std::fs::metadata(path).map(|m| Self::of(&m))
    }
}

/// Locate the directory entry currently naming `identity`, if any.
///
/// Used to unlink a rotated file by what it is rather than what it was
/// called when the tailer opened it.
pub fn find_path_by_identity(dir: &Path, identity: FileIdentity) -> Option<PathBuf> {
    #[cfg(unix)]
    {
        let entries = std::fs::read_dir(dir).ok()?;
        for entry in entries.flatten() {
            let path = entry.path();
            if let Ok(found) = FileIdentity::from_path(&path) {
                if found == identity {
                    return Some(path);
                }
            }
        }
        None
    }
    #[cfg(windows)]
    {
        let _ = (dir, identity);
        None
    }
}

/// Process-wide cap on tailer-held file handles: counter-with-cap, no
/// blocking. Injected into every tailer; the prometheus gauge mirrors
/// the counter.
#[derive(Debug)]
pub struct OpenFileBudget {
    current: AtomicUsize,
    cap: usize,
}

impl OpenFileBudget {
    pub fn new(cap: usize) -> Self {
        Self {
            current: AtomicUsize::new(0),
            cap,
        }
    }

    pub fn for_platform(platform: &dyn Platform) -> Self {
        let cap = platform
            .open_file_limit()
            .saturating_sub(FD_RESERVE)
            .max(16);
        Self::new(cap)
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn in_use(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Take one slot if any remain. Never blocks.
    pub fn acquire(self: &Arc<Self>) -> Option<FdSlot> {
        let mut held = self.current.load(Ordering::SeqCst);
        loop {
            if held >= self.cap {
                return None;
            }
            match self.current.compare_exchange(
                held,
                held + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    OPEN_FILE_HANDLES.inc();
                    return Some(FdSlot {
                        budget: Arc::clone(self),
                    });
                }
                Err(actual) => held = actual,
            }
        }
    }

    fn release(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
        OPEN_FILE_HANDLES.dec();
    }
}

/// One held handle slot; releasing is tied to scope exit so every
/// tailer termination path gives the slot back.
#[derive(Debug)]
pub struct FdSlot {
    budget: Arc<OpenFileBudget>,
}

impl Drop for FdSlot {
    fn drop(&mut self) {
        self.budget.release();
    }
}
