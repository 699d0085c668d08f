//! Read path: logical ranges are reassembled from chunks that may live in
//! other inodes' backing files.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fs::File;
use std::io::ErrorKind;
use std::os::unix::fs::FileExt;

use tracing::debug;

use crate::error::{ChunkFsError, Result};
use super::EngineState;

/// One physical read, planned under the mapping lock and executed without it.
struct ReadStep {
    owner: u64,
    phys_off: u64,
    len: usize,
}

impl EngineState {
    /// Read up to `size` bytes at logical `offset`. Returns fewer bytes
    /// only at the flushed end of the file.
    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let handle = self.handles.get(fh).ok_or(ChunkFsError::BadHandle(fh))?;
        let ino = handle.ino;

        // Plan the walk under the entry lock, then drop it before any
        // physical I/O.
        let steps = {
            let entry = self.entry(ino)?;
            let map = entry.lock();
            if offset >= map.flushed_end() {
                return Ok(Vec::new());
            }
            let end = (offset + size as u64).min(map.flushed_end());
            let mut steps = Vec::new();
            let mut pos = offset;
            let mut i = match map.locate(pos) {
                Some(i) => i,
                None => return Ok(Vec::new()),
            };
            while pos < end {
                let (id, start, ref_end) = map.ref_at(i);
                let chunk = self.fingerprints.get(id);
                let in_chunk = pos - start;
                let take = (ref_end.min(end) - pos) as usize;
                steps.push(ReadStep {
                    owner: chunk.owner,
                    phys_off: chunk.start + in_chunk,
                    len: take,
                });
                pos += take as u64;
                i += 1;
            }
            steps
        };

        let total: usize = steps.iter().map(|s| s.len).sum();
        let mut out = vec![0u8; total];
        let mut filled = 0;
        // Foreign backing files opened during this call; dropped (closed)
        // on every exit path, error included.
        let mut foreign: HashMap<u64, File> = HashMap::new();

        for step in steps {
            let dst = &mut out[filled..filled + step.len];
            let res = if step.owner == ino {
                handle.file.read_exact_at(dst, step.phys_off)
            } else {
                let file = match foreign.entry(step.owner) {
                    Entry::Occupied(e) => e.into_mut(),
                    Entry::Vacant(v) => {
                        let f = self.open_foreign(step.owner)?;
                        debug!(
                            "read: inode {} borrowing backing file of inode {}",
                            ino, step.owner
                        );
                        v.insert(f)
                    }
                };
                file.read_exact_at(dst, step.phys_off)
            };
            match res {
                Ok(()) => filled += step.len,
                Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                    return Err(ChunkFsError::ShortRead {
                        ino: step.owner,
                        offset: step.phys_off,
                        wanted: step.len,
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    /// Open the backing file that physically owns a foreign chunk,
    /// resolving the owner through the identity registry.
    fn open_foreign(&self, owner: u64) -> Result<File> {
        let rel = self.inodes.path_of(owner).ok_or_else(|| {
            ChunkFsError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
        })?;
        Ok(File::open(self.backing_path(&rel))?)
    }
}
