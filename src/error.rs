//! Error types for the flowlog engine.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{PartitionId, RequestId};

/// Result type alias using FlowlogError
pub type Result<T> = std::result::Result<T, FlowlogError>;

/// Errors raised by the command log engine.
#[derive(Error, Debug)]
pub enum FlowlogError {
  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  /// The block does not fit the remaining capacity of the current segment.
  /// Storage reacts with a rollover; callers of `Segment::append` see this
  /// directly.
  #[error("segment has insufficient capacity for the block")]
  InsufficientCapacity,

  /// The block can never fit any segment of the configured capacity.
  #[error("block of {block_len} bytes exceeds the usable capacity of a {capacity} byte segment")]
  BlockTooLarge { block_len: usize, capacity: u32 },

  #[error("destination buffer of {buffer_len} bytes cannot hold a {block_len} byte block")]
  BufferTooSmall { buffer_len: usize, block_len: usize },

  #[error("invalid log address {address:#018x}")]
  InvalidAddress { address: u64 },

  #[error("log storage is not open")]
  StorageNotOpen,

  #[error("log storage is already open")]
  StorageAlreadyOpen,

  #[error("segment {path} is corrupt: {reason}")]
  CorruptSegment { path: PathBuf, reason: String },

  #[error("segment header crc mismatch: stored {stored:#010x}, computed {computed:#010x}")]
  CrcMismatch { stored: u32, computed: u32 },

  #[error("segment format version mismatch: found {found}, supported {supported}")]
  VersionMismatch { found: u16, supported: u16 },

  #[error("partition {0} is not known to this node")]
  UnknownPartition(PartitionId),

  #[error("partition {0} is not available")]
  PartitionNotAvailable(PartitionId),

  #[error("partition {0} already exists on this node")]
  PartitionExists(PartitionId),

  /// Releasing an admission slot that is not held. A defect in the caller,
  /// never a recoverable runtime condition.
  #[error("request {request_id} is not in flight on partition {partition_id}")]
  RequestNotInFlight {
    partition_id: PartitionId,
    request_id: RequestId,
  },

  #[error("startup step '{step}' failed: {source}")]
  StartupStepFailed {
    step: &'static str,
    #[source]
    source: Box<FlowlogError>,
  },

  /// Startup was aborted because a shutdown was requested concurrently.
  /// Logged at a lower severity than a genuine fault.
  #[error("partition startup aborted: shutdown requested")]
  ShutdownRequested,

  #[error("replication error: {0}")]
  Replication(String),

  /// The partition's executor thread is gone; submitted work was dropped.
  #[error("partition execution context is no longer running")]
  ContextGone,

  #[error("invalid configuration: {0}")]
  InvalidConfig(String),

  #[error("internal error: {0}")]
  Internal(String),
}
