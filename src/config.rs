use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Maximum group (chunk) size the engine will ever produce. Also the
/// write-buffer flush threshold.
pub const DEFAULT_MAX_CHUNK: u32 = 32768;
/// Smallest chunk the cutter may produce, except for a file's final chunk.
pub const DEFAULT_MIN_CHUNK: u32 = 2048;
/// Target chunk size the content-defined cutter biases toward.
pub const DEFAULT_NORMAL_CHUNK: u32 = 8192;

pub const DEFAULT_MAX_INODES: u64 = 1_048_576;
pub const DEFAULT_MAX_HANDLES: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "chunkfs", about = "Deduplicating FUSE filesystem with content-defined chunking")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Mount a chunkfs filesystem
    Mount {
        /// Path to the backend directory holding physical data files
        backend: PathBuf,

        /// Path to the mount point
        mountpoint: PathBuf,

        /// Log file path
        #[arg(long, default_value = "/tmp/chunkfs.log")]
        log_file: PathBuf,

        /// Minimum chunk size in bytes
        #[arg(long, default_value_t = DEFAULT_MIN_CHUNK)]
        min_chunk: u32,

        /// Target chunk size the cutter biases toward
        #[arg(long, default_value_t = DEFAULT_NORMAL_CHUNK)]
        normal_chunk: u32,

        /// Maximum chunk size in bytes (also the write-buffer size)
        #[arg(long, default_value_t = DEFAULT_MAX_CHUNK)]
        max_chunk: u32,

        /// Capacity of the inode pool
        #[arg(long, default_value_t = DEFAULT_MAX_INODES)]
        max_inodes: u64,

        /// Capacity of the file handle pool
        #[arg(long, default_value_t = DEFAULT_MAX_HANDLES)]
        max_handles: usize,

        /// Index fingerprints but never reuse chunks (measurement mode)
        #[arg(long)]
        no_dedup: bool,

        /// Byte-compare chunk content on every fingerprint hit
        #[arg(long)]
        verify_dedup: bool,

        /// Dump the full mapping table as JSON on unmount
        #[arg(long)]
        dump_map: Option<PathBuf>,

        /// Run in foreground (don't daemonize)
        #[arg(short, long)]
        foreground: bool,
    },
    /// Unmount a chunkfs filesystem
    Unmount {
        /// Path to the mount point
        mountpoint: PathBuf,
    },
}

/// Engine parameters, fixed for the lifetime of a mount.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub backend: PathBuf,
    pub min_chunk: u32,
    pub normal_chunk: u32,
    pub max_chunk: u32,
    pub max_inodes: u64,
    pub max_handles: usize,
    /// Take the duplicate branch on fingerprint hits.
    pub dedup: bool,
    /// Byte-compare the stored chunk before trusting a fingerprint hit.
    pub verify_dedup: bool,
}

impl EngineConfig {
    pub fn new(backend: PathBuf) -> Self {
        Self {
            backend,
            min_chunk: DEFAULT_MIN_CHUNK,
            normal_chunk: DEFAULT_NORMAL_CHUNK,
            max_chunk: DEFAULT_MAX_CHUNK,
            max_inodes: DEFAULT_MAX_INODES,
            max_handles: DEFAULT_MAX_HANDLES,
            dedup: true,
            verify_dedup: false,
        }
    }
}

/// Full mount configuration: engine parameters plus FUSE-side options.
#[derive(Debug, Clone)]
pub struct ChunkFsConfig {
    pub engine: EngineConfig,
    pub mountpoint: PathBuf,
    pub log_file: PathBuf,
    pub dump_map: Option<PathBuf>,
    pub foreground: bool,
}
