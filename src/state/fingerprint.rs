use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::debug;

/// SHA-1 digest of a chunk's exact byte range, used verbatim as the
/// content-addressed key. Collision-freedom is a documented trust
/// assumption; see `EngineConfig::verify_dedup` for the checked variant.
pub type Digest = [u8; 20];

/// Index into the chunk arena. Mapping tables store these, never pointers.
pub type ChunkId = u32;

/// One physical group of bytes, stored exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Inode whose backing file physically holds the bytes.
    pub owner: u64,
    /// Start byte within the owner's backing file.
    pub start: u64,
    pub len: u32,
    /// How many mapping-table references point at this chunk.
    pub refs: u32,
    /// The digest this chunk is indexed under; `None` for private copies
    /// (dedup disabled, or a verify mismatch).
    pub digest: Option<Digest>,
}

struct IndexInner {
    /// Arena of every chunk record ever stored.
    chunks: Vec<Chunk>,
    by_digest: HashMap<Digest, ChunkId>,
}

/// Content-addressed chunk index. Lookups take the shared lock; insertion
/// and refcount updates take the exclusive lock, which is the
/// linearization point between concurrent writers of identical content.
pub struct FingerprintIndex {
    inner: RwLock<IndexInner>,
}

impl FingerprintIndex {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(IndexInner {
                chunks: Vec::new(),
                by_digest: HashMap::new(),
            }),
        }
    }

    pub fn lookup(&self, digest: &Digest) -> Option<(ChunkId, Chunk)> {
        let inner = self.inner.read();
        let id = *inner.by_digest.get(digest)?;
        Some((id, inner.chunks[id as usize]))
    }

    pub fn get(&self, id: ChunkId) -> Chunk {
        self.inner.read().chunks[id as usize]
    }

    pub fn increment_ref(&self, id: ChunkId) {
        self.inner.write().chunks[id as usize].refs += 1;
    }

    /// Drop one reference. At zero the digest entry is retired so future
    /// identical content is stored afresh rather than pointed at a chunk
    /// whose backing bytes may be gone.
    pub fn decrement_ref(&self, id: ChunkId) -> u32 {
        let mut inner = self.inner.write();
        let chunk = &mut inner.chunks[id as usize];
        chunk.refs = chunk.refs.saturating_sub(1);
        let refs = chunk.refs;
        if refs == 0 {
            if let Some(digest) = chunk.digest.take() {
                inner.by_digest.remove(&digest);
            }
        }
        refs
    }

    /// Store `chunk` under `digest`, unless a concurrent writer got there
    /// first: then the winner's refcount is bumped and `(winner, false)` is
    /// returned, with the caller's already-persisted bytes left to be
    /// overwritten by its next chunk.
    pub fn insert_or_acquire(&self, digest: Digest, mut chunk: Chunk) -> (ChunkId, bool) {
        let mut inner = self.inner.write();
        if let Some(&id) = inner.by_digest.get(&digest) {
            inner.chunks[id as usize].refs += 1;
            debug!(
                "lost insert race for chunk owned by inode {}, reusing {}",
                chunk.owner, id
            );
            return (id, false);
        }
        chunk.refs = 1;
        chunk.digest = Some(digest);
        let id = inner.chunks.len() as ChunkId;
        inner.chunks.push(chunk);
        inner.by_digest.insert(digest, id);
        (id, true)
    }

    /// Store a chunk without a digest entry. Used when deduplication is
    /// disabled or a fingerprint hit failed byte verification.
    pub fn insert_unindexed(&self, mut chunk: Chunk) -> ChunkId {
        let mut inner = self.inner.write();
        chunk.refs = 1;
        chunk.digest = None;
        let id = inner.chunks.len() as ChunkId;
        inner.chunks.push(chunk);
        id
    }

    /// True while any live chunk owned by `ino` is still referenced.
    pub fn owner_referenced(&self, ino: u64) -> bool {
        self.inner
            .read()
            .chunks
            .iter()
            .any(|c| c.owner == ino && c.refs > 0)
    }

    /// Number of digest entries.
    pub fn len(&self) -> usize {
        self.inner.read().by_digest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.inner.read().chunks.len()
    }
}

impl Default for FingerprintIndex {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(owner: u64, start: u64, len: u32) -> Chunk {
        Chunk {
            owner,
            start,
            len,
            refs: 1,
            digest: None,
        }
    }

    #[test]
    fn first_writer_wins() {
        let index = FingerprintIndex::new();
        let digest = [7u8; 20];

        let (a, stored_a) = index.insert_or_acquire(digest, chunk(1, 0, 100));
        assert!(stored_a);

        // A second writer of the same content observes the winner.
        let (b, stored_b) = index.insert_or_acquire(digest, chunk(2, 0, 100));
        assert!(!stored_b);
        assert_eq!(a, b);

        let winner = index.get(a);
        assert_eq!(winner.owner, 1);
        assert_eq!(winner.refs, 2);
        assert_eq!(index.chunk_count(), 1);
    }

    #[test]
    fn refcount_round_trip() {
        let index = FingerprintIndex::new();
        let digest = [1u8; 20];
        let (id, _) = index.insert_or_acquire(digest, chunk(1, 0, 64));
        index.increment_ref(id);
        assert_eq!(index.get(id).refs, 2);

        assert_eq!(index.decrement_ref(id), 1);
        assert!(index.lookup(&digest).is_some());

        assert_eq!(index.decrement_ref(id), 0);
        assert!(index.lookup(&digest).is_none(), "dead digest is retired");
        assert!(!index.owner_referenced(1));
    }

    #[test]
    fn unindexed_chunks_never_hit() {
        let index = FingerprintIndex::new();
        let id = index.insert_unindexed(chunk(3, 0, 32));
        assert_eq!(index.len(), 0);
        assert_eq!(index.get(id).digest, None);
        assert!(index.owner_referenced(3));
    }
}
