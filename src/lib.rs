//! flowlog - Partitioned command log engine
//!
//! The write path of a horizontally scaled workflow broker: client commands
//! are admitted per partition, appended to a crash-recoverable segmented
//! log, and, where a command concerns every partition, distributed to the
//! sibling partitions with at-least-once delivery.
//!
//! # Architecture
//!
//! - **Storage**: append-only segment files with checksummed headers and
//!   torn-append repair on open
//! - **Partitions**: one single-writer executor each, started and stopped
//!   through a fixed list of lifecycle steps
//! - **Admission**: per-partition in-flight limits instead of queueing
//! - **Distribution**: durable pending records, idempotent acknowledgement,
//!   and a background redistributor that resends until every target answered
//!
//! Consensus and the processing engine stay outside the crate, behind the
//! `ReplicationClient` and `RecordProcessor` traits.

#![deny(clippy::all)]

// Core modules
pub mod constants;
pub mod error;
pub mod types;

// Configuration
pub mod config;

// Storage layer
pub mod storage;

// Admission control
pub mod limiter;

// Command intake
pub mod command;

// Partition lifecycle and management
pub mod partition;

// Replication seam
pub mod replication;

// Cross-partition distribution
pub mod distribution;

// Observability
pub mod metrics;

// Re-export commonly used items
pub use error::{FlowlogError, Result};

pub use command::{
  CommandRequest, CommandResponse, DiskSpaceMonitor, LogEntry, ProcessingOutcome, RecordProcessor,
};
pub use config::BrokerConfig;
pub use partition::{PartitionManager, PartitionOptions, PartitionStatus, StartMode};
pub use replication::{LocalReplication, ReplicationClient, ReplicationGroup, Role};
pub use types::{DistributionKey, Intent, LogAddress, NodeId, PartitionId, RequestId, ValueType};
