//! Write path: sequential-append buffering, content-defined cutting and
//! the dedup hit/miss decision.

use sha1::{Digest as _, Sha1};
use std::os::unix::fs::FileExt;
use tracing::{debug, warn};

use crate::error::{ChunkFsError, Result};
use super::fingerprint::{Chunk, Digest};
use super::handles::{HandleState, OpenMode, WriteBuffer};
use super::EngineState;

impl EngineState {
    /// Accept `data` at logical `offset` on a write session.
    ///
    /// Writes must continue exactly where the previous one ended: the write
    /// buffer's end, which also equals the file's logical size. Anything
    /// earlier is an overwrite of bytes already accepted, anything later a
    /// gap; both violate the append-only contract and are rejected without
    /// touching any state.
    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32> {
        let handle = self.handles.get(fh).ok_or(ChunkFsError::BadHandle(fh))?;
        if handle.mode != OpenMode::Write {
            return Err(ChunkFsError::ReadOnlyHandle(fh));
        }
        let mut guard = handle.buf.lock();
        let buf = guard.as_mut().ok_or(ChunkFsError::ReadOnlyHandle(fh))?;

        let end = buf.start + buf.data.len() as u64;
        if offset < end {
            return Err(ChunkFsError::UnsupportedOverwrite { offset, end });
        }
        if offset > end {
            return Err(ChunkFsError::NonSequentialWrite {
                offset,
                expected: end,
            });
        }

        let max = self.chunker.max_size();
        let mut consumed = 0;
        while consumed < data.len() {
            let room = max - buf.data.len();
            let take = room.min(data.len() - consumed);
            buf.data.extend_from_slice(&data[consumed..consumed + take]);
            consumed += take;
            self.grow_logical(handle.ino, take as u64)?;

            if buf.data.len() == max {
                let cut = self.chunker.cut(&buf.data);
                self.flush_chunk(&handle, buf, cut)?;
            }
        }
        Ok(data.len() as u32)
    }

    /// Flush whatever the buffer still holds as one final chunk. Called at
    /// release; the remainder may be shorter than the minimum chunk size.
    pub(crate) fn flush_residue(&self, handle: &HandleState) -> Result<()> {
        let mut guard = handle.buf.lock();
        let buf = match guard.as_mut() {
            Some(b) => b,
            None => return Ok(()),
        };
        if !buf.data.is_empty() {
            let cut = buf.data.len();
            self.flush_chunk(handle, buf, cut)?;
        }
        *guard = None;
        Ok(())
    }

    /// Persist or deduplicate the first `cut` buffered bytes, then compact
    /// the residue to the buffer's front.
    fn flush_chunk(&self, handle: &HandleState, buf: &mut WriteBuffer, cut: usize) -> Result<()> {
        let ino = handle.ino;
        let region = &buf.data[..cut];
        let digest: Digest = Sha1::digest(region).into();

        // Duplicate branch. With dedup disabled the hit is still computed
        // and logged, but never taken.
        let mut hit = None;
        let mut collision = false;
        if let Some((id, chunk)) = self.fingerprints.lookup(&digest) {
            if !self.config.dedup {
                debug!("duplicate content for inode {} ignored (dedup disabled)", ino);
            } else if self.config.verify_dedup && !self.verify_hit(&chunk, region)? {
                warn!(
                    "fingerprint matched chunk {} but bytes differ; storing a private copy",
                    id
                );
                collision = true;
            } else {
                hit = Some((id, chunk));
            }
        }

        if let Some((id, chunk)) = hit {
            self.fingerprints.increment_ref(id);
            {
                let entry = self.entry(ino)?;
                entry.lock().append_chunk(id, cut as u32);
            }
            self.stats.add_deduped(cut as u64);
            debug!(
                "dedup hit: inode {} reuses {} bytes owned by inode {}",
                ino, cut, chunk.owner
            );
            buf.data.drain(..cut);
            buf.start += cut as u64;
            return Ok(());
        }

        // Miss: persist to this inode's own backing file at its current
        // physical end. No lock is held across the write; a failure here
        // leaves no chunk record behind.
        let phys = {
            let entry = self.entry(ino)?;
            let map = entry.lock();
            map.physical_size
        };
        handle.file.write_all_at(region, phys)?;

        let candidate = Chunk {
            owner: ino,
            start: phys,
            len: cut as u32,
            refs: 1,
            digest: None,
        };
        let (id, stored) = if collision || !self.config.dedup {
            // Private copy: keep the digest entry (if any) pointing at the
            // first occurrence so hits stay observable.
            if self.fingerprints.lookup(&digest).is_some() {
                (self.fingerprints.insert_unindexed(candidate), true)
            } else {
                self.fingerprints.insert_or_acquire(digest, candidate)
            }
        } else {
            self.fingerprints.insert_or_acquire(digest, candidate)
        };

        {
            let entry = self.entry(ino)?;
            let mut map = entry.lock();
            if stored {
                // Our bytes are now part of the file; a lost insert race
                // leaves physical_size untouched so the next chunk simply
                // overwrites them.
                map.physical_size += cut as u64;
            }
            map.append_chunk(id, cut as u32);
        }
        if stored {
            self.stats.add_written(cut as u64);
        } else {
            self.stats.add_deduped(cut as u64);
        }

        buf.data.drain(..cut);
        buf.start += cut as u64;
        Ok(())
    }

    /// Byte-compare a fingerprint hit against the stored chunk.
    fn verify_hit(&self, chunk: &Chunk, region: &[u8]) -> Result<bool> {
        if chunk.len as usize != region.len() {
            return Ok(false);
        }
        let rel = self.inodes.path_of(chunk.owner).ok_or_else(|| {
            ChunkFsError::Io(std::io::Error::from_raw_os_error(libc::ENOENT))
        })?;
        let file = std::fs::File::open(self.backing_path(&rel))?;
        let mut stored = vec![0u8; region.len()];
        file.read_exact_at(&mut stored, chunk.start)?;
        Ok(stored == region)
    }

    fn grow_logical(&self, ino: u64, n: u64) -> Result<()> {
        let entry = self.entry(ino)?;
        entry.lock().logical_size += n;
        Ok(())
    }
}
