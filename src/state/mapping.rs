use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;

use super::fingerprint::ChunkId;

/// Granularity of the block index. Smaller than any chunk the cutter can
/// produce, so consecutive blocks map to the same or adjacent references.
pub const BLOCK_SIZE: u64 = 4096;

/// Per-inode translation from logical byte ranges to chunk references.
///
/// References are appended strictly in write order and are contiguous and
/// gapless: reference i ends exactly where reference i+1 begins.
#[derive(Debug, Default)]
pub struct FileMap {
    /// Chunk arena indices, in logical order.
    refs: Vec<ChunkId>,
    /// Logical start offset of each reference.
    offsets: Vec<u64>,
    /// For each logical block, the index into `refs` covering the block's
    /// first byte.
    block_index: Vec<u32>,
    /// Logical end of the last reference.
    flushed_end: u64,
    /// Bytes the caller believes the file has, buffered bytes included.
    pub logical_size: u64,
    /// Bytes persisted to this inode's own backing file, after dedup.
    pub physical_size: u64,
}

impl FileMap {
    /// Append a reference covering `len` bytes at the current flushed end,
    /// extending the block index up to the new end.
    pub fn append_chunk(&mut self, id: ChunkId, len: u32) {
        let start = self.flushed_end;
        let end = start + len as u64;
        let idx = self.refs.len() as u32;
        self.refs.push(id);
        self.offsets.push(start);
        while (self.block_index.len() as u64) * BLOCK_SIZE < end {
            self.block_index.push(idx);
        }
        self.flushed_end = end;
    }

    /// Find the reference whose logical range contains `offset`.
    ///
    /// The block index gives an initial guess; since chunk lengths are not
    /// block aligned the guess is refined over adjacent references until
    /// the containing interval is found.
    pub fn locate(&self, offset: u64) -> Option<usize> {
        if self.refs.is_empty() || offset >= self.flushed_end {
            return None;
        }
        let block = (offset / BLOCK_SIZE) as usize;
        let mut i = self.block_index[block.min(self.block_index.len() - 1)] as usize;
        while self.offsets[i] > offset {
            i -= 1;
        }
        while i + 1 < self.refs.len() && self.offsets[i + 1] <= offset {
            i += 1;
        }
        Some(i)
    }

    /// The reference at `i` as (chunk id, logical start, logical end).
    pub fn ref_at(&self, i: usize) -> (ChunkId, u64, u64) {
        let end = self
            .offsets
            .get(i + 1)
            .copied()
            .unwrap_or(self.flushed_end);
        (self.refs[i], self.offsets[i], end)
    }

    pub fn ref_count(&self) -> usize {
        self.refs.len()
    }

    pub fn chunk_ids(&self) -> &[ChunkId] {
        &self.refs
    }

    /// Logical extent covered by flushed chunks; bytes beyond it are still
    /// in some write buffer.
    pub fn flushed_end(&self) -> u64 {
        self.flushed_end
    }
}

/// One logical range of a dumped mapping entry.
#[derive(Debug, Serialize)]
pub struct RangeDump {
    pub logical_start: u64,
    pub length: u32,
    pub owner: u64,
    pub physical_start: u64,
}

/// Offline-analysis view of one file's mapping entry.
#[derive(Debug, Serialize)]
pub struct FileMapDump {
    pub path: String,
    pub ino: u64,
    pub logical_size: u64,
    pub physical_size: u64,
    pub ranges: Vec<RangeDump>,
}

/// All per-inode mapping entries. The map itself is concurrent; each entry
/// has its own mutex (one writer per handle is the dispatch contract, the
/// mutex holds the line if it is ever violated).
pub struct MappingTable {
    entries: DashMap<u64, Mutex<FileMap>>,
}

impl MappingTable {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Ensure an entry exists for `ino`.
    pub fn ensure(&self, ino: u64) {
        self.entries.entry(ino).or_default();
    }

    pub fn get(
        &self,
        ino: u64,
    ) -> Option<dashmap::mapref::one::Ref<'_, u64, Mutex<FileMap>>> {
        self.entries.get(&ino)
    }

    pub fn remove(&self, ino: u64) -> Option<FileMap> {
        self.entries.remove(&ino).map(|(_, m)| m.into_inner())
    }

    pub fn logical_size(&self, ino: u64) -> Option<u64> {
        self.entries.get(&ino).map(|e| e.lock().logical_size)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.entries.contains_key(&ino)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Visit every entry under its lock, for the shutdown dump.
    pub fn for_each<F: FnMut(u64, &FileMap)>(&self, mut f: F) {
        for e in self.entries.iter() {
            let map = e.value().lock();
            f(*e.key(), &map);
        }
    }
}

impl Default for MappingTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_extends_block_index() {
        let mut map = FileMap::default();
        map.append_chunk(0, 10_000);
        map.append_chunk(1, 3_000);
        map.append_chunk(2, 20_000);

        assert_eq!(map.ref_count(), 3);
        assert_eq!(map.flushed_end(), 33_000);
        // 33_000 bytes span ceil(33000/4096) = 9 blocks.
        assert_eq!(map.block_index.len(), 9);
    }

    #[test]
    fn locate_refines_past_block_granularity() {
        let mut map = FileMap::default();
        // Deliberately unaligned chunk lengths.
        map.append_chunk(0, 5_000);
        map.append_chunk(1, 100);
        map.append_chunk(2, 100);
        map.append_chunk(3, 7_000);

        assert_eq!(map.locate(0), Some(0));
        assert_eq!(map.locate(4_999), Some(0));
        assert_eq!(map.locate(5_000), Some(1));
        assert_eq!(map.locate(5_099), Some(1));
        assert_eq!(map.locate(5_100), Some(2));
        assert_eq!(map.locate(5_200), Some(3));
        assert_eq!(map.locate(12_199), Some(3));
        assert_eq!(map.locate(12_200), None);
    }

    #[test]
    fn every_block_resolves_to_its_covering_reference() {
        let mut map = FileMap::default();
        let lens = [4_096u32, 1_000, 9_000, 50, 4_046, 32_768];
        for (i, len) in lens.iter().enumerate() {
            map.append_chunk(i as ChunkId, *len);
        }
        for block in 0..(map.flushed_end() / BLOCK_SIZE) {
            let byte = block * BLOCK_SIZE;
            let i = map.locate(byte).unwrap();
            let (_, start, end) = map.ref_at(i);
            assert!(
                start <= byte && byte < end,
                "block {} resolved to [{}, {})",
                block,
                start,
                end
            );
        }
    }

    #[test]
    fn locate_past_end_is_none() {
        let mut map = FileMap::default();
        assert_eq!(map.locate(0), None);
        map.append_chunk(0, 512);
        assert_eq!(map.locate(511), Some(0));
        assert_eq!(map.locate(512), None);
    }
}
