use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkFsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("inode pool exhausted ({capacity} ids in use)")]
    ExhaustedInodeSpace { capacity: u64 },

    #[error("file handle pool exhausted ({capacity} slots in use)")]
    ExhaustedHandleSpace { capacity: usize },

    #[error("non-sequential write at offset {offset}, append position is {expected}")]
    NonSequentialWrite { offset: u64, expected: u64 },

    #[error("overwrite of already written bytes at offset {offset}, file end is {end}")]
    UnsupportedOverwrite { offset: u64, end: u64 },

    #[error("short read from inode {ino}: wanted {wanted} bytes at physical offset {offset}")]
    ShortRead { ino: u64, offset: u64, wanted: usize },

    #[error("unknown file handle {0}")]
    BadHandle(u64),

    #[error("handle {0} is not open for writing")]
    ReadOnlyHandle(u64),

    #[error("mount error: {0}")]
    Mount(String),
}

impl ChunkFsError {
    /// Map an engine error to the errno reported through FUSE.
    pub fn errno(&self) -> fuser::Errno {
        let raw = match self {
            ChunkFsError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            ChunkFsError::ExhaustedInodeSpace { .. } => libc::ENOSPC,
            ChunkFsError::ExhaustedHandleSpace { .. } => libc::EMFILE,
            ChunkFsError::NonSequentialWrite { .. } => libc::ENOTSUP,
            ChunkFsError::UnsupportedOverwrite { .. } => libc::ENOTSUP,
            ChunkFsError::ShortRead { .. } => libc::EIO,
            ChunkFsError::BadHandle(_) => libc::EBADF,
            ChunkFsError::ReadOnlyHandle(_) => libc::EACCES,
            ChunkFsError::Mount(_) => libc::EIO,
        };
        fuser::Errno::from(std::io::Error::from_raw_os_error(raw))
    }
}

pub type Result<T> = std::result::Result<T, ChunkFsError>;
