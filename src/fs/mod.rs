pub mod handles;
pub mod passthrough;

use std::ffi::OsStr;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use fuser::{
    AccessFlags, BsdFileFlags, Errno, FileAttr, FileHandle, FileType, Filesystem, FopenFlags,
    Generation, INodeNo, KernelConfig, LockOwner, OpenFlags, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, RenameFlags,
    Request, TimeOrNow, WriteFlags,
};
use tracing::{debug, info, warn};

use self::handles::DirHandleTable;
use self::passthrough::*;
use crate::config::ChunkFsConfig;
use crate::state::handles::OpenMode;
use crate::state::inodes::ROOT_INO;
use crate::state::{EngineState, DETACHED_DIR};

const TTL: std::time::Duration = std::time::Duration::from_secs(1);

pub struct ChunkFs {
    pub config: ChunkFsConfig,
    /// The deduplication engine; all shared tables live here.
    pub engine: Arc<EngineState>,
    /// Directory handle table (pure passthrough).
    pub dir_handles: DirHandleTable,
}

impl ChunkFs {
    pub fn new(config: ChunkFsConfig, engine: Arc<EngineState>) -> Self {
        Self {
            config,
            engine,
            dir_handles: DirHandleTable::new(),
        }
    }

    /// Convert a relative path (from the identity registry) to a full
    /// backend path.
    fn backing_path(&self, rel: &Path) -> PathBuf {
        self.engine.backing_path(rel)
    }

    /// Resolve (parent inode, name) to (relative, full) paths.
    fn resolve_path(&self, parent: u64, name: &OsStr) -> Option<(PathBuf, PathBuf)> {
        let parent_rel = if parent == ROOT_INO {
            PathBuf::new()
        } else {
            self.engine.inodes.path_of(parent)?
        };
        let rel = parent_rel.join(name);
        let full = self.backing_path(&rel);
        Some((rel, full))
    }

    /// Stat a path, register its identity, and apply the logical-size
    /// override for tracked regular files.
    fn lookup_attr(&self, rel: &Path, full: &Path) -> Result<FileAttr, Errno> {
        let st = lstat(full).map_err(Errno::from)?;
        let mut attr = stat_to_file_attr(&st);
        let ino = if rel.as_os_str().is_empty() {
            ROOT_INO
        } else {
            self.engine
                .inodes
                .resolve_or_create(rel)
                .map_err(|e| e.errno())?
        };
        attr.ino = INodeNo(ino);
        if attr.kind == FileType::RegularFile {
            if let Some(size) = self.engine.logical_size_of(ino) {
                attr.size = size;
                attr.blocks = size.div_ceil(512);
            }
        }
        Ok(attr)
    }

    fn attr_by_ino(&self, ino: u64) -> Result<FileAttr, Errno> {
        let rel = if ino == ROOT_INO {
            PathBuf::new()
        } else {
            self.engine.inodes.path_of(ino).ok_or(Errno::ENOENT)?
        };
        let full = self.backing_path(&rel);
        let st = lstat(&full).map_err(Errno::from)?;
        let mut attr = stat_to_file_attr(&st);
        attr.ino = INodeNo(ino);
        if attr.kind == FileType::RegularFile {
            if let Some(size) = self.engine.logical_size_of(ino) {
                attr.size = size;
                attr.blocks = size.div_ceil(512);
            }
        }
        Ok(attr)
    }
}

impl Filesystem for ChunkFs {
    fn init(&mut self, _req: &Request, _config: &mut KernelConfig) -> std::io::Result<()> {
        info!(
            "chunkfs initialized, backend={}, chunks {}..{} (normal {})",
            self.config.engine.backend.display(),
            self.config.engine.min_chunk,
            self.config.engine.max_chunk,
            self.config.engine.normal_chunk,
        );
        Ok(())
    }

    fn destroy(&mut self) {
        let (written, deduped) = self.engine.stats.snapshot();
        info!(
            "chunkfs shutting down: {} bytes written, {} bytes deduplicated",
            written, deduped
        );
        if let Some(ref path) = self.config.dump_map {
            let dump = self.engine.dump();
            match serde_json::to_string_pretty(&dump) {
                Ok(json) => {
                    if let Err(e) = std::fs::write(path, json) {
                        warn!("failed to write mapping dump to {}: {}", path.display(), e);
                    } else {
                        info!("mapping table dumped to {}", path.display());
                    }
                }
                Err(e) => warn!("failed to serialize mapping dump: {}", e),
            }
        }
    }

    fn lookup(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEntry) {
        let parent = u64::from(parent);
        debug!("lookup(parent={}, name={:?})", parent, name);

        let (rel, full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        match self.lookup_attr(&rel, &full) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&self, _req: &Request, ino: INodeNo, _fh: Option<FileHandle>, reply: ReplyAttr) {
        let ino = u64::from(ino);
        debug!("getattr(ino={})", ino);

        match self.attr_by_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn setattr(
        &self,
        _req: &Request,
        ino: INodeNo,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<FileHandle>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<BsdFileFlags>,
        reply: ReplyAttr,
    ) {
        let ino = u64::from(ino);
        debug!("setattr(ino={})", ino);

        let rel = match self.engine.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);
        let c_path = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        // Truncate is passthrough on the backing file; the mapping table is
        // append-only and not rewritten.
        if let Some(new_size) = size {
            let rc = unsafe { libc::truncate(c_path.as_ptr(), new_size as libc::off_t) };
            if rc != 0 {
                reply.error(Errno::from(std::io::Error::last_os_error()));
                return;
            }
        }

        if let Some(mode) = mode {
            unsafe {
                if libc::chmod(c_path.as_ptr(), mode as libc::mode_t) != 0 {
                    reply.error(Errno::from(std::io::Error::last_os_error()));
                    return;
                }
            }
        }

        if uid.is_some() || gid.is_some() {
            let new_uid = uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
            let new_gid = gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
            unsafe {
                if libc::chown(c_path.as_ptr(), new_uid, new_gid) != 0 {
                    reply.error(Errno::from(std::io::Error::last_os_error()));
                    return;
                }
            }
        }

        if atime.is_some() || mtime.is_some() {
            let to_timespec = |t: Option<TimeOrNow>| -> libc::timespec {
                match t {
                    Some(TimeOrNow::SpecificTime(st)) => {
                        let d = st.duration_since(UNIX_EPOCH).unwrap_or_default();
                        libc::timespec {
                            tv_sec: d.as_secs() as libc::time_t,
                            tv_nsec: d.subsec_nanos() as libc::c_long,
                        }
                    }
                    Some(TimeOrNow::Now) => libc::timespec {
                        tv_sec: 0,
                        tv_nsec: libc::UTIME_NOW,
                    },
                    None => libc::timespec {
                        tv_sec: 0,
                        tv_nsec: libc::UTIME_OMIT,
                    },
                }
            };
            let times = [to_timespec(atime), to_timespec(mtime)];
            unsafe {
                if libc::utimensat(libc::AT_FDCWD, c_path.as_ptr(), times.as_ptr(), 0) != 0 {
                    reply.error(Errno::from(std::io::Error::last_os_error()));
                    return;
                }
            }
        }

        match self.attr_by_ino(ino) {
            Ok(attr) => reply.attr(&TTL, &attr),
            Err(e) => reply.error(e),
        }
    }

    fn open(&self, _req: &Request, ino: INodeNo, flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        let raw_flags = flags.0;
        debug!("open(ino={}, flags={:#x})", ino, raw_flags);

        let rel = match self.engine.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        let access_mode = raw_flags & libc::O_ACCMODE;
        let result = if access_mode == libc::O_RDONLY {
            self.engine.open(&rel, OpenMode::Read)
        } else if raw_flags & libc::O_TRUNC != 0 {
            // Rewriting from scratch is the one supported form of
            // overwrite: the old mapping entry is retired and the file
            // restarts empty.
            self.engine.create(&rel)
        } else {
            self.engine.open(&rel, OpenMode::Write)
        };

        match result {
            Ok((_, fh)) => reply.opened(FileHandle(fh), FopenFlags::empty()),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn read(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        size: u32,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyData,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);

        match self.engine.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e.errno()),
        }
    }

    fn write(
        &self,
        _req: &Request,
        ino: INodeNo,
        fh: FileHandle,
        offset: u64,
        data: &[u8],
        _write_flags: WriteFlags,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        reply: ReplyWrite,
    ) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("write(ino={}, fh={}, offset={}, size={})", ino, fh, offset, data.len());

        match self.engine.write(fh, offset, data) {
            Ok(n) => reply.written(n),
            Err(e) => {
                warn!("write rejected on fh {}: {}", fh, e);
                reply.error(e.errno());
            }
        }
    }

    fn flush(&self, _req: &Request, ino: INodeNo, fh: FileHandle, _lock_owner: LockOwner, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        let fh = u64::from(fh);
        debug!("flush(ino={}, fh={})", ino, fh);
        // Chunks are cut at buffer-full and at release; flush is a no-op so
        // dup'd descriptors closing early don't force short chunks.
        reply.ok();
    }

    fn release(
        &self,
        _req: &Request,
        _ino: INodeNo,
        fh: FileHandle,
        _flags: OpenFlags,
        _lock_owner: Option<LockOwner>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        let fh = u64::from(fh);
        debug!("release(fh={})", fh);

        match self.engine.release(fh) {
            Ok(()) => reply.ok(),
            Err(e) => {
                warn!("release failed on fh {}: {}", fh, e);
                reply.error(e.errno());
            }
        }
    }

    fn opendir(&self, _req: &Request, ino: INodeNo, _flags: OpenFlags, reply: ReplyOpen) {
        let ino = u64::from(ino);
        debug!("opendir(ino={})", ino);

        let rel = if ino == ROOT_INO {
            PathBuf::new()
        } else {
            match self.engine.inodes.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(Errno::ENOENT);
                    return;
                }
            }
        };

        let full = self.backing_path(&rel);
        let c_path = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let dp = unsafe { libc::opendir(c_path.as_ptr()) };
        if dp.is_null() {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        let fd = unsafe { libc::dirfd(dp) };
        let real_fd = unsafe { libc::dup(fd) };
        unsafe {
            libc::closedir(dp);
        }

        let fh = self.dir_handles.alloc(real_fd, rel);
        reply.opened(FileHandle(fh), FopenFlags::empty());
    }

    fn readdir(
        &self,
        _req: &Request,
        ino: INodeNo,
        _fh: FileHandle,
        offset: u64,
        mut reply: ReplyDirectory,
    ) {
        let ino = u64::from(ino);
        debug!("readdir(ino={}, offset={})", ino, offset);

        let rel = if ino == ROOT_INO {
            PathBuf::new()
        } else {
            match self.engine.inodes.path_of(ino) {
                Some(p) => p,
                None => {
                    reply.error(Errno::ENOENT);
                    return;
                }
            }
        };

        let full = self.backing_path(&rel);
        let entries = match std::fs::read_dir(&full) {
            Ok(rd) => rd,
            Err(e) => {
                reply.error(Errno::from(e));
                return;
            }
        };

        let mut all_entries: Vec<(u64, FileType, String)> = Vec::new();
        all_entries.push((ino, FileType::Directory, ".".to_string()));
        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            let parent_path = rel.parent().map(|p| p.to_path_buf()).unwrap_or_default();
            if parent_path.as_os_str().is_empty() {
                ROOT_INO
            } else {
                self.engine.inodes.lookup(&parent_path).unwrap_or(ROOT_INO)
            }
        };
        all_entries.push((parent_ino, FileType::Directory, "..".to_string()));

        for entry in entries {
            let entry = match entry {
                Ok(e) => e,
                Err(_) => continue,
            };
            let name = entry.file_name().to_string_lossy().to_string();
            // Parked data files of unlinked-but-referenced inodes.
            if name == DETACHED_DIR {
                continue;
            }

            let child_rel = rel.join(&name);
            let child_full = self.backing_path(&child_rel);
            if let Ok(st) = lstat(&child_full) {
                let attr = stat_to_file_attr(&st);
                match self.engine.inodes.resolve_or_create(&child_rel) {
                    Ok(child_ino) => all_entries.push((child_ino, attr.kind, name)),
                    Err(e) => {
                        warn!("readdir: cannot register {}: {}", child_rel.display(), e);
                    }
                }
            }
        }

        for (i, (entry_ino, kind, name)) in all_entries.iter().enumerate().skip(offset as usize) {
            if reply.add(INodeNo(*entry_ino), (i + 1) as u64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&self, _req: &Request, _ino: INodeNo, fh: FileHandle, _flags: OpenFlags, reply: ReplyEmpty) {
        let fh = u64::from(fh);
        debug!("releasedir(fh={})", fh);
        if let Some(handle) = self.dir_handles.remove(fh) {
            if handle.real_fd >= 0 {
                unsafe {
                    libc::close(handle.real_fd);
                }
            }
        }
        reply.ok();
    }

    fn create(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        let parent = u64::from(parent);
        debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let (rel, full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        let (ino, fh) = match self.engine.create(&rel) {
            Ok(pair) => pair,
            Err(e) => {
                reply.error(e.errno());
                return;
            }
        };

        // Apply the requested permissions to the backing file.
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&full, std::fs::Permissions::from_mode(mode & 0o7777));

        match self.attr_by_ino(ino) {
            Ok(attr) => reply.created(&TTL, &attr, Generation(0), FileHandle(fh), FopenFlags::empty()),
            Err(e) => {
                let _ = self.engine.release(fh);
                reply.error(e);
            }
        }
    }

    fn mkdir(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);

        let (rel, full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::mkdir(c_path.as_ptr(), mode as libc::mode_t) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        match self.lookup_attr(&rel, &full) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn unlink(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("unlink(parent={}, name={:?})", parent, name);

        let (rel, full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        if self.engine.inodes.lookup(&rel).is_some() {
            match self.engine.unlink(&rel) {
                Ok(()) => reply.ok(),
                Err(e) => reply.error(e.errno()),
            }
            return;
        }

        // Never seen through this mount: plain passthrough.
        match std::fs::remove_file(&full) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn rmdir(&self, _req: &Request, parent: INodeNo, name: &OsStr, reply: ReplyEmpty) {
        let parent = u64::from(parent);
        debug!("rmdir(parent={}, name={:?})", parent, name);

        let (rel, full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_path = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::rmdir(c_path.as_ptr()) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        if let Some(ino) = self.engine.inodes.lookup(&rel) {
            self.engine.inodes.remove(ino);
        }
        reply.ok();
    }

    fn rename(
        &self,
        _req: &Request,
        parent: INodeNo,
        name: &OsStr,
        newparent: INodeNo,
        newname: &OsStr,
        _flags: RenameFlags,
        reply: ReplyEmpty,
    ) {
        let parent = u64::from(parent);
        let newparent = u64::from(newparent);
        debug!(
            "rename(parent={}, name={:?}, newparent={}, newname={:?})",
            parent, name, newparent, newname
        );

        let (old_rel, old_full) = match self.resolve_path(parent, name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let (new_rel, new_full) = match self.resolve_path(newparent, newname) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };

        // A tracked destination is replaced: retire its mapping first so
        // chunks it owns stay reachable for other files.
        if new_full.is_file() && self.engine.inodes.lookup(&new_rel).is_some() {
            if let Err(e) = self.engine.unlink(&new_rel) {
                warn!("rename: cannot replace {}: {}", new_rel.display(), e);
                reply.error(e.errno());
                return;
            }
        }

        if let Err(e) = std::fs::rename(&old_full, &new_full) {
            reply.error(Errno::from(e));
            return;
        }

        self.engine.inodes.rename(&old_rel, &new_rel);
        reply.ok();
    }

    fn symlink(
        &self,
        _req: &Request,
        parent: INodeNo,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let parent = u64::from(parent);
        debug!("symlink(parent={}, name={:?}, target={:?})", parent, link_name, target);

        let (rel, full) = match self.resolve_path(parent, link_name) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let c_target = match path_to_cstring(target) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };
        let c_link = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::symlink(c_target.as_ptr(), c_link.as_ptr()) };
        if rc != 0 {
            reply.error(Errno::from(std::io::Error::last_os_error()));
            return;
        }

        match self.lookup_attr(&rel, &full) {
            Ok(attr) => reply.entry(&TTL, &attr, Generation(0)),
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&self, _req: &Request, ino: INodeNo, reply: ReplyData) {
        let ino = u64::from(ino);
        debug!("readlink(ino={})", ino);

        let rel = match self.engine.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);

        match std::fs::read_link(&full) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(Errno::from(e)),
        }
    }

    fn link(
        &self,
        _req: &Request,
        _ino: INodeNo,
        _newparent: INodeNo,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // Hard links would give one inode two paths; the identity registry
        // requires exactly one.
        reply.error(Errno::ENOTSUP);
    }

    fn statfs(&self, _req: &Request, _ino: INodeNo, reply: ReplyStatfs) {
        let c_path = match path_to_cstring(&self.config.engine.backend) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        unsafe {
            let mut st: libc::statfs = std::mem::zeroed();
            if libc::statfs(c_path.as_ptr(), &mut st) == 0 {
                reply.statfs(
                    st.f_blocks as u64,
                    st.f_bfree as u64,
                    st.f_bavail as u64,
                    st.f_files as u64,
                    st.f_ffree as u64,
                    st.f_bsize as u32,
                    255,
                    st.f_bsize as u32,
                );
            } else {
                reply.error(Errno::from(std::io::Error::last_os_error()));
            }
        }
    }

    fn access(&self, _req: &Request, ino: INodeNo, mask: AccessFlags, reply: ReplyEmpty) {
        let ino = u64::from(ino);
        debug!("access(ino={}, mask={:?})", ino, mask);

        if ino == ROOT_INO {
            reply.ok();
            return;
        }

        let rel = match self.engine.inodes.path_of(ino) {
            Some(p) => p,
            None => {
                reply.error(Errno::ENOENT);
                return;
            }
        };
        let full = self.backing_path(&rel);
        let c_path = match path_to_cstring(&full) {
            Ok(p) => p,
            Err(_) => {
                reply.error(Errno::EINVAL);
                return;
            }
        };

        let rc = unsafe { libc::access(c_path.as_ptr(), mask.bits()) };
        if rc == 0 {
            reply.ok();
        } else {
            reply.error(Errno::from(std::io::Error::last_os_error()));
        }
    }
}
