//! Engine integration tests, run against temporary backend directories.
//! No FUSE mount is required: the tests drive the same operation surface
//! the dispatch layer uses.

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::TempDir;

use chunkfs::config::EngineConfig;
use chunkfs::error::ChunkFsError;
use chunkfs::state::handles::OpenMode;
use chunkfs::state::EngineState;

fn engine_with(dir: &TempDir, tweak: impl FnOnce(&mut EngineConfig)) -> EngineState {
    let mut config = EngineConfig::new(dir.path().to_path_buf());
    tweak(&mut config);
    EngineState::new(config).expect("engine init")
}

fn engine(dir: &TempDir) -> EngineState {
    engine_with(dir, |_| {})
}

fn random_data(seed: u64, len: usize) -> Vec<u8> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..len).map(|_| rng.gen()).collect()
}

/// Write `data` through a fresh write session in `step`-sized calls.
fn write_file(engine: &EngineState, path: &str, data: &[u8], step: usize) -> u64 {
    let (ino, fh) = engine.create(Path::new(path)).expect("create");
    let mut off = 0u64;
    for part in data.chunks(step.max(1)) {
        let n = engine.write(fh, off, part).expect("write");
        assert_eq!(n as usize, part.len());
        off += part.len() as u64;
    }
    engine.release(fh).expect("release");
    ino
}

fn read_file(engine: &EngineState, path: &str, offset: u64, len: usize) -> Vec<u8> {
    let (_, fh) = engine.open(Path::new(path), OpenMode::Read).expect("open");
    let data = engine.read(fh, offset, len as u32).expect("read");
    engine.release(fh).expect("release");
    data
}

/// Scenario 1: sequential appends read back byte-exact.
#[test]
fn round_trip_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let data: Vec<u8> = b"AB".iter().copied().cycle().take(10_000).collect();
    write_file(&fs, "pattern.bin", &data, 1000);

    assert_eq!(fs.logical_size_of(fs.inodes.lookup(Path::new("pattern.bin")).unwrap()), Some(10_000));
    assert_eq!(read_file(&fs, "pattern.bin", 0, 10_000), data);
}

/// Round trip across many content-defined chunks and odd write sizes.
#[test]
fn round_trip_multi_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| {
        c.min_chunk = 512;
        c.normal_chunk = 1024;
        c.max_chunk = 4096;
    });

    let data = random_data(11, 150_000);
    write_file(&fs, "big.bin", &data, 7919);

    assert_eq!(read_file(&fs, "big.bin", 0, data.len()), data);
    // Unaligned interior range.
    assert_eq!(read_file(&fs, "big.bin", 33_333, 20_000), data[33_333..53_333]);
    // Read past the end is clamped.
    assert_eq!(
        read_file(&fs, "big.bin", 149_000, 5_000),
        data[149_000..]
    );
    assert!(read_file(&fs, "big.bin", 200_000, 100).is_empty());
}

/// Scenario 2: identical content through two paths is stored once.
#[test]
fn dedup_stores_one_copy() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let zeros = vec![0u8; 20_000];
    let a = write_file(&fs, "a.bin", &zeros, 4096);
    let b = write_file(&fs, "b.bin", &zeros, 4096);
    assert_ne!(a, b);

    // Exactly one fingerprint entry, referenced twice.
    assert_eq!(fs.fingerprints.len(), 1);
    assert_eq!(fs.fingerprints.chunk_count(), 1);
    assert_eq!(fs.fingerprints.get(0).refs, 2);
    assert_eq!(fs.fingerprints.get(0).owner, a);

    let (written, deduped) = fs.stats.snapshot();
    assert_eq!(written, 20_000);
    assert_eq!(deduped, 20_000);

    // One physical copy on disk: b's backing file holds no data.
    assert_eq!(std::fs::metadata(dir.path().join("a.bin")).unwrap().len(), 20_000);
    assert_eq!(std::fs::metadata(dir.path().join("b.bin")).unwrap().len(), 0);

    // b's mapping references a's backing range.
    let dump = fs.dump();
    let b_entry = dump.iter().find(|d| d.ino == b).unwrap();
    assert!(b_entry.ranges.iter().all(|r| r.owner == a));
    assert_eq!(b_entry.logical_size, 20_000);
    assert_eq!(b_entry.physical_size, 0);

    assert_eq!(read_file(&fs, "b.bin", 0, 20_000), zeros);
}

/// Scenario 3: contiguous appends succeed, overlap is rejected.
#[test]
fn overwrite_and_gap_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let (ino, fh) = fs.create(Path::new("seq.bin")).unwrap();
    assert_eq!(fs.write(fh, 0, b"hello").unwrap(), 5);
    assert_eq!(fs.write(fh, 5, b"abc").unwrap(), 3);

    let err = fs.write(fh, 4, b"x").unwrap_err();
    assert!(matches!(err, ChunkFsError::UnsupportedOverwrite { offset: 4, end: 8 }));

    let err = fs.write(fh, 100, b"x").unwrap_err();
    assert!(matches!(
        err,
        ChunkFsError::NonSequentialWrite { offset: 100, expected: 8 }
    ));

    // Rejected writes left the entry untouched.
    assert_eq!(fs.logical_size_of(ino), Some(8));
    fs.release(fh).unwrap();
    assert_eq!(read_file(&fs, "seq.bin", 0, 8), b"helloabc");
}

/// Scenario 4: a 10,000-byte write against a 4096 max chunk produces at
/// least three references, none oversized, the last possibly shorter.
#[test]
fn chunk_count_and_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| {
        c.min_chunk = 512;
        c.normal_chunk = 1024;
        c.max_chunk = 4096;
    });

    let data = random_data(42, 10_000);
    let ino = write_file(&fs, "chunky.bin", &data, data.len());

    let dump = fs.dump();
    let entry = dump.iter().find(|d| d.ino == ino).unwrap();
    assert!(entry.ranges.len() >= 3, "got {} chunks", entry.ranges.len());
    for r in &entry.ranges {
        assert!(r.length <= 4096, "chunk of {} bytes exceeds max", r.length);
    }
    let total: u64 = entry.ranges.iter().map(|r| r.length as u64).sum();
    assert_eq!(total, 10_000);
    assert_eq!(entry.logical_size, 10_000);
}

/// Scenario 5: inode exhaustion fails cleanly; freeing one id allows
/// exactly one more create.
#[test]
fn inode_exhaustion_and_reuse() {
    let dir = tempfile::tempdir().unwrap();
    // Capacity 3: the root plus two files.
    let fs = engine_with(&dir, |c| c.max_inodes = 3);

    let (_, fh_a) = fs.create(Path::new("a")).unwrap();
    let (_, fh_b) = fs.create(Path::new("b")).unwrap();
    fs.release(fh_a).unwrap();
    fs.release(fh_b).unwrap();

    let err = fs.create(Path::new("c")).unwrap_err();
    assert!(matches!(err, ChunkFsError::ExhaustedInodeSpace { .. }));
    assert!(fs.inodes.lookup(Path::new("c")).is_none(), "failed create left state behind");
    assert!(!dir.path().join("c").exists());

    fs.unlink(Path::new("a")).unwrap();
    let (_, fh_c) = fs.create(Path::new("c")).unwrap();
    fs.release(fh_c).unwrap();
    assert!(fs.create(Path::new("d")).is_err());
}

/// Handle-pool exhaustion mirrors the inode behavior.
#[test]
fn handle_exhaustion_and_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| c.max_handles = 2);

    let (_, fh_a) = fs.create(Path::new("a")).unwrap();
    let (_, fh_b) = fs.create(Path::new("b")).unwrap();

    let err = fs.create(Path::new("c")).unwrap_err();
    assert!(matches!(err, ChunkFsError::ExhaustedHandleSpace { .. }));
    // The failed create must not leak the identity it allocated.
    assert!(fs.inodes.lookup(Path::new("c")).is_none());

    fs.release(fh_a).unwrap();
    fs.release(fh_b).unwrap();
    let (_, fh_c) = fs.create(Path::new("c")).unwrap();
    fs.release(fh_c).unwrap();
}

/// Scenario 6: a read through the second file crosses into chunks owned by
/// the first file's backing storage.
#[test]
fn foreign_read_across_dedup_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| {
        c.min_chunk = 512;
        c.normal_chunk = 1024;
        c.max_chunk = 4096;
    });

    let data = random_data(7, 20_000);
    let a = write_file(&fs, "first.bin", &data, 4096);
    let b = write_file(&fs, "second.bin", &data, 4096);

    // Everything second.bin maps to is physically owned by first.bin.
    let dump = fs.dump();
    let b_entry = dump.iter().find(|d| d.ino == b).unwrap();
    assert!(b_entry.ranges.iter().all(|r| r.owner == a));

    assert_eq!(
        read_file(&fs, "second.bin", 15_000, 5_000),
        data[15_000..20_000]
    );
    assert_eq!(
        read_file(&fs, "first.bin", 15_000, 5_000),
        read_file(&fs, "second.bin", 15_000, 5_000)
    );
}

/// Unlinking the chunk owner parks its data file; readers through the
/// other mapping keep working.
#[test]
fn unlink_owner_detaches_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| {
        c.min_chunk = 512;
        c.normal_chunk = 1024;
        c.max_chunk = 4096;
    });

    let data = random_data(13, 30_000);
    let a = write_file(&fs, "owner.bin", &data, 4096);
    write_file(&fs, "clone.bin", &data, 4096);

    fs.unlink(Path::new("owner.bin")).unwrap();
    assert!(!dir.path().join("owner.bin").exists());
    let parked = dir.path().join(".chunkfs-detached").join(a.to_string());
    assert!(parked.is_file(), "owner's data file should be parked");

    assert_eq!(read_file(&fs, "clone.bin", 0, data.len()), data);

    // Dropping the last reference frees the parked file's chunks too.
    fs.unlink(Path::new("clone.bin")).unwrap();
    assert!(!fs.fingerprints.owner_referenced(a));
}

/// Unlinking a fully private file removes its data and frees its id.
#[test]
fn unlink_private_file_frees_inode() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let data = random_data(17, 5_000);
    let ino = write_file(&fs, "lonely.bin", &data, 1000);
    fs.unlink(Path::new("lonely.bin")).unwrap();

    assert!(!dir.path().join("lonely.bin").exists());
    assert!(fs.inodes.path_of(ino).is_none());
    assert!(fs.inodes.lookup(Path::new("lonely.bin")).is_none());
}

/// Unlink is refused while a session is open.
#[test]
fn unlink_open_file_is_busy() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let (_, fh) = fs.create(Path::new("busy.bin")).unwrap();
    let err = fs.unlink(Path::new("busy.bin")).unwrap_err();
    match err {
        ChunkFsError::Io(e) => assert_eq!(e.raw_os_error(), Some(libc::EBUSY)),
        other => panic!("expected EBUSY, got {other:?}"),
    }
    fs.release(fh).unwrap();
    fs.unlink(Path::new("busy.bin")).unwrap();
}

/// With dedup disabled, duplicate content is detected but stored twice.
#[test]
fn no_dedup_mode_stores_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| c.dedup = false);

    let data = vec![7u8; 10_000];
    write_file(&fs, "a.bin", &data, 4096);
    write_file(&fs, "b.bin", &data, 4096);

    let (written, deduped) = fs.stats.snapshot();
    assert_eq!(written, 20_000);
    assert_eq!(deduped, 0);
    // The index still carries one digest entry; the arena has both copies.
    assert_eq!(fs.fingerprints.len(), 1);
    assert_eq!(fs.fingerprints.chunk_count(), 2);
    assert_eq!(std::fs::metadata(dir.path().join("b.bin")).unwrap().len(), 10_000);

    assert_eq!(read_file(&fs, "b.bin", 0, 10_000), data);
}

/// Verified dedup behaves identically when the bytes really match.
#[test]
fn verify_dedup_accepts_true_duplicates() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine_with(&dir, |c| c.verify_dedup = true);

    let data = random_data(23, 12_000);
    let a = write_file(&fs, "a.bin", &data, 4096);
    write_file(&fs, "b.bin", &data, 4096);

    assert_eq!(fs.fingerprints.chunk_count(), 1);
    assert_eq!(fs.fingerprints.get(0).refs, 2);
    assert_eq!(fs.fingerprints.get(0).owner, a);
    assert_eq!(read_file(&fs, "b.bin", 0, 12_000), data);
}

/// Reopening a released file for writing continues the append.
#[test]
fn append_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    write_file(&fs, "log.bin", b"first half;", 100);
    let (_, fh) = fs.open(Path::new("log.bin"), OpenMode::Write).unwrap();
    let err = fs.write(fh, 0, b"again").unwrap_err();
    assert!(matches!(err, ChunkFsError::UnsupportedOverwrite { .. }));
    assert_eq!(fs.write(fh, 11, b"second half").unwrap(), 11);
    fs.release(fh).unwrap();

    assert_eq!(read_file(&fs, "log.bin", 0, 22), b"first half;second half");
}

/// Only one write session per inode may exist at a time.
#[test]
fn second_writer_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    let (_, fh) = fs.create(Path::new("solo.bin")).unwrap();
    let err = fs.open(Path::new("solo.bin"), OpenMode::Write).unwrap_err();
    match err {
        ChunkFsError::Io(e) => assert_eq!(e.raw_os_error(), Some(libc::EBUSY)),
        other => panic!("expected EBUSY, got {other:?}"),
    }
    fs.release(fh).unwrap();
    let (_, fh2) = fs.open(Path::new("solo.bin"), OpenMode::Write).unwrap();
    fs.release(fh2).unwrap();
}

/// Reads through a read handle never see a write buffer, only flushed
/// chunks; writes through a read handle are rejected.
#[test]
fn read_handle_cannot_write() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    write_file(&fs, "r.bin", b"content", 7);
    let (_, fh) = fs.open(Path::new("r.bin"), OpenMode::Read).unwrap();
    let err = fs.write(fh, 7, b"more").unwrap_err();
    assert!(matches!(err, ChunkFsError::ReadOnlyHandle(_)));
    fs.release(fh).unwrap();
}

/// Shared chunks inside a single file: repeated identical blocks are
/// referenced, not re-stored, and the physical size reflects it.
#[test]
fn intra_file_dedup() {
    let dir = tempfile::tempdir().unwrap();
    let fs = engine(&dir);

    // The same 64K block three times: the cut sequence re-synchronizes
    // inside each repetition, so most later chunks hit the index.
    let block = random_data(31, 65_536);
    let mut data = Vec::new();
    for _ in 0..3 {
        data.extend_from_slice(&block);
    }
    let ino = write_file(&fs, "self.bin", &data, 32_768);

    let dump = fs.dump();
    let entry = dump.iter().find(|d| d.ino == ino).unwrap();
    assert_eq!(entry.logical_size, data.len() as u64);
    assert!(
        entry.physical_size < data.len() as u64,
        "identical blocks were all re-stored"
    );
    assert_eq!(read_file(&fs, "self.bin", 0, data.len()), data);
}
