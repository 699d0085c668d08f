use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use crate::error::{ChunkFsError, Result};

/// The mount root, fixed by the FUSE protocol.
pub const ROOT_INO: u64 = 1;

struct RegistryInner {
    by_path: HashMap<PathBuf, u64>,
    by_ino: HashMap<u64, PathBuf>,
    /// Ids returned by `remove`, reused smallest-first.
    free: BTreeSet<u64>,
    /// Next never-allocated id.
    next: u64,
}

/// Bidirectional path↔inode registry with a bounded id pool.
///
/// The registry is the sole authority for identity: every other table is
/// keyed by inode and resolves back to a path through it. Lookups take the
/// shared lock, mutations the exclusive lock; neither is held across I/O.
pub struct InodeRegistry {
    inner: RwLock<RegistryInner>,
    capacity: u64,
}

impl InodeRegistry {
    pub fn new(capacity: u64) -> Self {
        assert!(capacity >= 1, "inode pool must at least hold the root");
        let mut by_path = HashMap::new();
        let mut by_ino = HashMap::new();
        by_path.insert(PathBuf::new(), ROOT_INO);
        by_ino.insert(ROOT_INO, PathBuf::new());
        Self {
            inner: RwLock::new(RegistryInner {
                by_path,
                by_ino,
                free: BTreeSet::new(),
                next: ROOT_INO + 1,
            }),
            capacity,
        }
    }

    /// Look up the inode for `path`, allocating the smallest free id on
    /// first sight. Repeated calls for the same path return the same id.
    pub fn resolve_or_create(&self, path: &Path) -> Result<u64> {
        if let Some(ino) = self.lookup(path) {
            return Ok(ino);
        }
        let mut inner = self.inner.write();
        // Re-check under the exclusive lock: another caller may have won.
        if let Some(&ino) = inner.by_path.get(path) {
            return Ok(ino);
        }
        let ino = if let Some(&id) = inner.free.iter().next() {
            inner.free.remove(&id);
            id
        } else if inner.next <= self.capacity {
            let id = inner.next;
            inner.next += 1;
            id
        } else {
            return Err(ChunkFsError::ExhaustedInodeSpace {
                capacity: self.capacity,
            });
        };
        inner.by_path.insert(path.to_path_buf(), ino);
        inner.by_ino.insert(ino, path.to_path_buf());
        Ok(ino)
    }

    pub fn lookup(&self, path: &Path) -> Option<u64> {
        self.inner.read().by_path.get(path).copied()
    }

    /// Resolve an inode back to its path, needed when a chunk owned by a
    /// different inode must be re-opened for a foreign read.
    pub fn path_of(&self, ino: u64) -> Option<PathBuf> {
        self.inner.read().by_ino.get(&ino).cloned()
    }

    /// Drop both directions and return the id to the free pool.
    pub fn remove(&self, ino: u64) {
        let mut inner = self.inner.write();
        if let Some(path) = inner.by_ino.remove(&ino) {
            inner.by_path.remove(&path);
            inner.free.insert(ino);
        }
    }

    /// Re-point an inode at a new path. The old path becomes unknown; the
    /// id and everything keyed by it are unaffected.
    pub fn rebind(&self, ino: u64, new_path: &Path) {
        let mut inner = self.inner.write();
        if let Some(old) = inner.by_ino.insert(ino, new_path.to_path_buf()) {
            inner.by_path.remove(&old);
        }
        inner.by_path.insert(new_path.to_path_buf(), ino);
    }

    pub fn rename(&self, old_path: &Path, new_path: &Path) {
        let mut inner = self.inner.write();
        if let Some(ino) = inner.by_path.remove(old_path) {
            inner.by_ino.insert(ino, new_path.to_path_buf());
            inner.by_path.insert(new_path.to_path_buf(), ino);
        }
    }

    /// Number of live identities, the root included.
    pub fn len(&self) -> usize {
        self.inner.read().by_ino.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_idempotent() {
        let reg = InodeRegistry::new(16);
        let a = reg.resolve_or_create(Path::new("a.txt")).unwrap();
        let b = reg.resolve_or_create(Path::new("a.txt")).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.path_of(a).unwrap(), PathBuf::from("a.txt"));
    }

    #[test]
    fn exhaustion_then_free_allows_one_more() {
        // Capacity 3: root plus two allocatable ids.
        let reg = InodeRegistry::new(3);
        let a = reg.resolve_or_create(Path::new("a")).unwrap();
        let _b = reg.resolve_or_create(Path::new("b")).unwrap();

        let err = reg.resolve_or_create(Path::new("c")).unwrap_err();
        assert!(matches!(err, ChunkFsError::ExhaustedInodeSpace { .. }));
        // The failed call must not have registered anything.
        assert_eq!(reg.lookup(Path::new("c")), None);
        assert_eq!(reg.len(), 3);

        reg.remove(a);
        let c = reg.resolve_or_create(Path::new("c")).unwrap();
        assert_eq!(c, a, "freed id is reused smallest-first");
        assert!(reg.resolve_or_create(Path::new("d")).is_err());
    }

    #[test]
    fn smallest_free_id_wins() {
        let reg = InodeRegistry::new(100);
        let a = reg.resolve_or_create(Path::new("a")).unwrap();
        let b = reg.resolve_or_create(Path::new("b")).unwrap();
        let _c = reg.resolve_or_create(Path::new("c")).unwrap();
        reg.remove(b);
        reg.remove(a);
        assert_eq!(reg.resolve_or_create(Path::new("d")).unwrap(), a);
        assert_eq!(reg.resolve_or_create(Path::new("e")).unwrap(), b);
    }

    #[test]
    fn rebind_keeps_id_and_frees_old_path() {
        let reg = InodeRegistry::new(16);
        let a = reg.resolve_or_create(Path::new("a")).unwrap();
        reg.rebind(a, Path::new(".detached/2"));
        assert_eq!(reg.lookup(Path::new("a")), None);
        assert_eq!(reg.path_of(a).unwrap(), PathBuf::from(".detached/2"));
        // The old name is available again and gets a fresh id.
        let a2 = reg.resolve_or_create(Path::new("a")).unwrap();
        assert_ne!(a, a2);
    }
}
