use dashmap::DashMap;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// State for directory handles. Directory listing is pure passthrough, so
/// this table is unbounded, unlike the engine's file handle pool.
#[derive(Debug)]
pub struct DirHandleState {
    pub fh: u64,
    pub real_fd: RawFd,
    pub path: PathBuf,
}

pub struct DirHandleTable {
    handles: DashMap<u64, DirHandleState>,
    next_fh: AtomicU64,
}

impl DirHandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn alloc(&self, real_fd: RawFd, path: PathBuf) -> u64 {
        let fh = self.next_fh.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(
            fh,
            DirHandleState {
                fh,
                real_fd,
                path,
            },
        );
        fh
    }

    pub fn get(&self, fh: u64) -> Option<dashmap::mapref::one::Ref<'_, u64, DirHandleState>> {
        self.handles.get(&fh)
    }

    pub fn remove(&self, fh: u64) -> Option<DirHandleState> {
        self.handles.remove(&fh).map(|(_, v)| v)
    }
}

impl Default for DirHandleTable {
    fn default() -> Self {
        Self::new()
    }
}
