use std::collections::BTreeSet;
use std::fs::File;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{ChunkFsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Bytes accepted by `write` but not yet cut into a chunk.
#[derive(Debug)]
pub struct WriteBuffer {
    /// Logical offset of the first buffered byte. Always equal to the
    /// mapping entry's flushed end.
    pub start: u64,
    pub data: Vec<u8>,
}

/// Per-session state for one open file.
#[derive(Debug)]
pub struct HandleState {
    pub ino: u64,
    /// Backing descriptor in the backend filesystem.
    pub file: File,
    pub mode: OpenMode,
    /// Write-side buffer, allocated with max-chunk capacity for write
    /// handles and absent for read handles. The dispatch layer never issues
    /// two concurrent writes against one handle; the mutex keeps a violated
    /// contract from corrupting the buffer.
    pub buf: Mutex<Option<WriteBuffer>>,
}

impl HandleState {
    pub fn new(ino: u64, file: File, mode: OpenMode, buf_start: u64, buf_capacity: usize) -> Self {
        let buf = match mode {
            OpenMode::Write => Some(WriteBuffer {
                start: buf_start,
                data: Vec::with_capacity(buf_capacity),
            }),
            OpenMode::Read => None,
        };
        Self {
            ino,
            file,
            mode,
            buf: Mutex::new(buf),
        }
    }
}

struct TableInner {
    slots: Vec<Option<Arc<HandleState>>>,
    /// Released slot indices, reused smallest-first.
    free: BTreeSet<usize>,
}

/// Bounded pool of open-session slots; same free-list structure as the
/// inode registry. The table lock covers slot bookkeeping only — handle
/// I/O goes through the returned `Arc` without it.
pub struct HandleTable {
    inner: RwLock<TableInner>,
    capacity: usize,
}

impl HandleTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(TableInner {
                slots: Vec::new(),
                free: BTreeSet::new(),
            }),
            capacity,
        }
    }

    /// Claim a slot for `state` and return its handle id.
    pub fn allocate(&self, state: HandleState) -> Result<u64> {
        let mut inner = self.inner.write();
        let slot = if let Some(&idx) = inner.free.iter().next() {
            inner.free.remove(&idx);
            idx
        } else if inner.slots.len() < self.capacity {
            inner.slots.push(None);
            inner.slots.len() - 1
        } else {
            return Err(ChunkFsError::ExhaustedHandleSpace {
                capacity: self.capacity,
            });
        };
        inner.slots[slot] = Some(Arc::new(state));
        Ok(slot as u64)
    }

    pub fn get(&self, fh: u64) -> Option<Arc<HandleState>> {
        self.inner.read().slots.get(fh as usize)?.clone()
    }

    /// Free the slot and hand the state back so the caller can flush and
    /// close it outside the table lock.
    pub fn release(&self, fh: u64) -> Option<Arc<HandleState>> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(fh as usize)?;
        let state = slot.take()?;
        inner.free.insert(fh as usize);
        Some(state)
    }

    pub fn open_count(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn any_open_for(&self, ino: u64) -> bool {
        self.inner
            .read()
            .slots
            .iter()
            .flatten()
            .any(|h| h.ino == ino)
    }

    pub fn any_writer_for(&self, ino: u64) -> bool {
        self.inner
            .read()
            .slots
            .iter()
            .flatten()
            .any(|h| h.ino == ino && h.mode == OpenMode::Write)
    }

    /// Snapshot of open handles for the busy-unmount listing.
    pub fn list_open(&self) -> Vec<(u64, u64)> {
        self.inner
            .read()
            .slots
            .iter()
            .enumerate()
            .filter_map(|(fh, s)| s.as_ref().map(|h| (fh as u64, h.ino)))
            .collect()
    }
}
