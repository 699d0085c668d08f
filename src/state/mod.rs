pub mod chunker;
pub mod fingerprint;
pub mod handles;
pub mod inodes;
pub mod mapping;
pub mod reader;
pub mod writer;

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::error::{ChunkFsError, Result};
use self::chunker::Chunker;
use self::fingerprint::FingerprintIndex;
use self::handles::{HandleState, HandleTable, OpenMode};
use self::inodes::InodeRegistry;
use self::mapping::{FileMapDump, MappingTable, RangeDump};

/// Backend directory where data files of unlinked-but-still-referenced
/// inodes are parked. Hidden from directory listings.
pub const DETACHED_DIR: &str = ".chunkfs-detached";

/// Cumulative byte counters for shutdown reporting.
#[derive(Debug, Default)]
pub struct Stats {
    bytes_written: AtomicU64,
    bytes_deduped: AtomicU64,
}

impl Stats {
    pub fn add_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_deduped(&self, n: u64) {
        self.bytes_deduped.fetch_add(n, Ordering::Relaxed);
    }

    /// (bytes physically written, bytes saved by dedup)
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.bytes_written.load(Ordering::Relaxed),
            self.bytes_deduped.load(Ordering::Relaxed),
        )
    }
}

/// All shared engine state, constructed at mount and torn down at unmount.
/// Operation handlers receive it by reference; there are no globals.
pub struct EngineState {
    pub config: EngineConfig,
    pub inodes: InodeRegistry,
    pub handles: HandleTable,
    pub chunker: Chunker,
    pub fingerprints: FingerprintIndex,
    pub mappings: MappingTable,
    pub stats: Stats,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.backend)?;
        let chunker = Chunker::new(config.min_chunk, config.normal_chunk, config.max_chunk);
        Ok(Self {
            inodes: InodeRegistry::new(config.max_inodes),
            handles: HandleTable::new(config.max_handles),
            chunker,
            fingerprints: FingerprintIndex::new(),
            mappings: MappingTable::new(),
            stats: Stats::default(),
            config,
        })
    }

    /// Full backend path for a mount-relative path.
    pub fn backing_path(&self, rel: &Path) -> PathBuf {
        self.config.backend.join(rel)
    }

    /// Create a file and open a write session on it. An already tracked
    /// path is unlinked first, so the new content starts from a clean
    /// mapping entry.
    pub fn create(&self, rel: &Path) -> Result<(u64, u64)> {
        if self.inodes.lookup(rel).is_some() && self.mappings_tracked(rel) {
            self.unlink(rel)?;
        }
        let fresh = self.inodes.lookup(rel).is_none();
        let ino = self.inodes.resolve_or_create(rel)?;
        self.mappings.ensure(ino);

        let full = self.backing_path(rel);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)?;

        let state = HandleState::new(ino, file, OpenMode::Write, 0, self.chunker.max_size());
        match self.handles.allocate(state) {
            Ok(fh) => {
                debug!("create: {} ino={} fh={}", rel.display(), ino, fh);
                Ok((ino, fh))
            }
            Err(e) => {
                // Roll the half-created identity back so exhaustion leaves
                // no trace.
                self.mappings.remove(ino);
                if fresh {
                    self.inodes.remove(ino);
                    let _ = std::fs::remove_file(&full);
                }
                Err(e)
            }
        }
    }

    /// Open a session on an existing file. Write sessions continue the
    /// sequential append at the current logical size; only one write
    /// session per inode may exist at a time.
    pub fn open(&self, rel: &Path, mode: OpenMode) -> Result<(u64, u64)> {
        let full = self.backing_path(rel);
        if !full.is_file() {
            return Err(ChunkFsError::Io(std::io::Error::from_raw_os_error(
                libc::ENOENT,
            )));
        }
        let fresh = self.inodes.lookup(rel).is_none();
        let ino = self.inodes.resolve_or_create(rel)?;
        if mode == OpenMode::Write && self.handles.any_writer_for(ino) {
            return Err(ChunkFsError::Io(std::io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }
        self.mappings.ensure(ino);

        let file = match mode {
            OpenMode::Read => OpenOptions::new().read(true).open(&full)?,
            OpenMode::Write => OpenOptions::new().read(true).write(true).open(&full)?,
        };
        let buf_start = self.mappings.logical_size(ino).unwrap_or(0);
        let state = HandleState::new(ino, file, mode, buf_start, self.chunker.max_size());
        match self.handles.allocate(state) {
            Ok(fh) => {
                debug!("open: {} ino={} fh={} mode={:?}", rel.display(), ino, fh, mode);
                Ok((ino, fh))
            }
            Err(e) => {
                if fresh {
                    self.mappings.remove(ino);
                    self.inodes.remove(ino);
                }
                Err(e)
            }
        }
    }

    /// End a session: flush any buffered bytes as one final chunk, free the
    /// slot and close the backing descriptor.
    pub fn release(&self, fh: u64) -> Result<()> {
        let state = self
            .handles
            .release(fh)
            .ok_or(ChunkFsError::BadHandle(fh))?;
        if state.mode == OpenMode::Write {
            self.flush_residue(&state)?;
        }
        debug!("release: fh={} ino={}", fh, state.ino);
        Ok(())
    }

    /// Remove a file. The physical data file survives, parked under
    /// `.chunkfs-detached/`, while chunks it owns are still referenced by
    /// other files; the inode id stays reserved for exactly that long.
    pub fn unlink(&self, rel: &Path) -> Result<()> {
        let ino = self.inodes.lookup(rel).ok_or_else(|| {
            ChunkFsError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
        })?;
        if self.handles.any_open_for(ino) {
            return Err(ChunkFsError::Io(std::io::Error::from_raw_os_error(
                libc::EBUSY,
            )));
        }

        if let Some(map) = self.mappings.remove(ino) {
            for &id in map.chunk_ids() {
                self.fingerprints.decrement_ref(id);
            }
        }

        let full = self.backing_path(rel);
        if self.fingerprints.owner_referenced(ino) {
            let detached_rel = Path::new(DETACHED_DIR).join(ino.to_string());
            let detached_full = self.backing_path(&detached_rel);
            std::fs::create_dir_all(self.config.backend.join(DETACHED_DIR))?;
            std::fs::rename(&full, &detached_full)?;
            self.inodes.rebind(ino, &detached_rel);
            info!(
                "unlink: {} detached as {} (chunks still referenced)",
                rel.display(),
                detached_rel.display()
            );
        } else {
            std::fs::remove_file(&full)?;
            self.inodes.remove(ino);
            debug!("unlink: {} ino={} removed", rel.display(), ino);
        }
        Ok(())
    }

    /// Logical size override for `getattr`: the size the caller wrote, not
    /// the deduplicated on-disk size.
    pub fn logical_size_of(&self, ino: u64) -> Option<u64> {
        self.mappings.logical_size(ino)
    }

    /// Mapping entry for an inode; absence is an engine invariant
    /// violation surfaced as a stale-handle error.
    pub(crate) fn entry(
        &self,
        ino: u64,
    ) -> Result<dashmap::mapref::one::Ref<'_, u64, parking_lot::Mutex<mapping::FileMap>>> {
        self.mappings.get(ino).ok_or_else(|| {
            ChunkFsError::Io(std::io::Error::from_raw_os_error(libc::EBADF))
        })
    }

    fn mappings_tracked(&self, rel: &Path) -> bool {
        self.inodes
            .lookup(rel)
            .map(|ino| self.mappings.contains(ino))
            .unwrap_or(false)
    }

    /// Serialize every mapping entry for offline analysis.
    pub fn dump(&self) -> Vec<FileMapDump> {
        let mut out = Vec::with_capacity(self.mappings.len());
        self.mappings.for_each(|ino, map| {
            let mut ranges = Vec::with_capacity(map.ref_count());
            for i in 0..map.ref_count() {
                let (id, start, end) = map.ref_at(i);
                let chunk = self.fingerprints.get(id);
                ranges.push(RangeDump {
                    logical_start: start,
                    length: (end - start) as u32,
                    owner: chunk.owner,
                    physical_start: chunk.start,
                });
            }
            out.push(FileMapDump {
                path: self
                    .inodes
                    .path_of(ino)
                    .unwrap_or_default()
                    .display()
                    .to_string(),
                ino,
                logical_size: map.logical_size,
                physical_size: map.physical_size,
                ranges,
            });
        });
        out.sort_by_key(|d| d.ino);
        out
    }
}
