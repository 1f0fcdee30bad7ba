//! On-disk format constants and engine defaults.

/// Magic marker at the start of every segment file ("FSEG" little-endian)
pub const SEGMENT_MAGIC: u32 = 0x4745_5346;

/// Current segment format version
pub const SEGMENT_FORMAT_VERSION: u16 = 1;

/// Flag bit set once a segment stops accepting appends
pub const SEGMENT_FLAG_FILLED: u16 = 0x0001;

/// Fixed segment header: magic u32, version u16, flags u16, id u32,
/// capacity u32, committed size u32, crc32 u32
pub const SEGMENT_HEADER_SIZE: u32 = 24;

/// Length prefix in front of every data block
pub const BLOCK_LENGTH_PREFIX_SIZE: u32 = 4;

/// File extension for segment files
pub const SEGMENT_FILE_EXTENSION: &str = "seg";

/// Lowest segment id; ids grow strictly sequentially from here
pub const INITIAL_SEGMENT_ID: u32 = 1;

/// Default capacity of a single segment (128 MiB)
pub const DEFAULT_SEGMENT_CAPACITY: u32 = 128 * 1024 * 1024;

/// Default upper bound for a single encoded command entry (4 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Default per-partition admission limit
pub const DEFAULT_REQUEST_LIMIT: usize = 1024;

/// Default interval between redistribution scans in milliseconds
pub const DEFAULT_REDISTRIBUTION_INTERVAL_MS: u64 = 10_000;

/// Bits of a generated key reserved for the per-partition counter;
/// the owning partition id lives in the bits above.
pub const KEY_COUNTER_BITS: u32 = 51;

/// Name of the advisory lock file inside a log directory
pub const STORAGE_LOCK_FILE_NAME: &str = ".lock";

/// Name of the snapshot subdirectory inside a partition directory
pub const SNAPSHOTS_DIR_NAME: &str = "snapshots";
