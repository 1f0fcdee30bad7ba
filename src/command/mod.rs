//! Command intake.
//!
//! The command api sits between the transport and the partitions: it decides
//! for every inbound command whether this node can take it (disk, leadership,
//! message validity, backpressure) and hands accepted commands to the owning
//! partition's writer. Everything above the log entry payload is opaque here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use tracing::{debug, error, warn};

use crate::constants::DEFAULT_MAX_MESSAGE_SIZE;
use crate::error::{FlowlogError, Result};
use crate::limiter::RequestLimiter;
use crate::partition::context::{completion, Completion, PartitionExecutor};
use crate::storage::LogStorage;
use crate::types::{
  partition_key, Intent, LogAddress, PartitionId, RequestId, ValueType,
};

// ============================================================================
// Wire types
// ============================================================================

/// A command as received from the transport. Value type and intent stay raw
/// until the handler validates them.
#[derive(Debug, Clone)]
pub struct CommandRequest {
  pub partition_id: PartitionId,
  pub request_id: RequestId,
  /// Key to address an existing entity; `None` asks for a generated key.
  pub key: Option<u64>,
  pub value_type: u8,
  pub intent: u8,
  pub payload: Vec<u8>,
}

/// Outcome of one command, sent back to the caller. Failures are data, not
/// panics; nothing crosses the executor boundary by unwinding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
  Accepted { key: u64, address: LogAddress },
  PartitionLeaderMismatch,
  UnsupportedMessage,
  ResourceExhausted,
  OutOfDiskSpace,
  RequestTooLarge,
  InternalError(String),
}

/// One durably logged command record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
  pub key: u64,
  pub value_type: ValueType,
  pub intent: Intent,
  pub payload: Vec<u8>,
}

const ENTRY_KEY_OFFSET: usize = 0;
const ENTRY_VALUE_TYPE_OFFSET: usize = 8;
const ENTRY_INTENT_OFFSET: usize = 9;
const ENTRY_PAYLOAD_LEN_OFFSET: usize = 10;
const ENTRY_PAYLOAD_OFFSET: usize = 14;

impl LogEntry {
  /// Encoded size, known before any buffer is allocated.
  pub fn encoded_len(&self) -> usize {
    ENTRY_PAYLOAD_OFFSET + self.payload.len()
  }

  /// `key u64 | value_type u8 | intent u8 | payload_len u32 | payload`,
  /// little-endian.
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = vec![0u8; self.encoded_len()];
    LittleEndian::write_u64(&mut buf[ENTRY_KEY_OFFSET..], self.key);
    buf[ENTRY_VALUE_TYPE_OFFSET] = self.value_type.to_wire();
    buf[ENTRY_INTENT_OFFSET] = self.intent.to_wire();
    LittleEndian::write_u32(&mut buf[ENTRY_PAYLOAD_LEN_OFFSET..], self.payload.len() as u32);
    buf[ENTRY_PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
    buf
  }

  pub fn decode(buf: &[u8]) -> Result<Self> {
    if buf.len() < ENTRY_PAYLOAD_OFFSET {
      return Err(FlowlogError::Internal(format!(
        "log entry of {} bytes is shorter than the fixed fields",
        buf.len()
      )));
    }
    let key = LittleEndian::read_u64(&buf[ENTRY_KEY_OFFSET..]);
    let value_type = ValueType::from_wire(buf[ENTRY_VALUE_TYPE_OFFSET])
      .ok_or_else(|| FlowlogError::Internal("unknown value type in log entry".to_string()))?;
    let intent = Intent::from_wire(buf[ENTRY_INTENT_OFFSET])
      .ok_or_else(|| FlowlogError::Internal("unknown intent in log entry".to_string()))?;
    let payload_len = LittleEndian::read_u32(&buf[ENTRY_PAYLOAD_LEN_OFFSET..]) as usize;
    if buf.len() < ENTRY_PAYLOAD_OFFSET + payload_len {
      return Err(FlowlogError::Internal(
        "log entry payload is truncated".to_string(),
      ));
    }
    Ok(Self {
      key,
      value_type,
      intent,
      payload: buf[ENTRY_PAYLOAD_OFFSET..ENTRY_PAYLOAD_OFFSET + payload_len].to_vec(),
    })
  }
}

// ============================================================================
// Record processing seam
// ============================================================================

/// Verdict of the higher-level engine on one applied entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
  Applied,
  /// Business-level rejection; the entry stays in the log and the rejection
  /// becomes a normal record on its own.
  Rejected(String),
}

/// The entire surface of the workflow engine above this crate.
pub trait RecordProcessor: Send {
  fn apply(&mut self, entry: &LogEntry) -> ProcessingOutcome;
}

/// A partition's processor, shared between its executor and the transport.
pub type SharedRecordProcessor = Arc<Mutex<Box<dyn RecordProcessor>>>;

// ============================================================================
// Shared node state
// ============================================================================

/// Shared disk availability flag, flipped by an external watcher.
#[derive(Debug)]
pub struct DiskSpaceMonitor {
  available: AtomicBool,
}

impl DiskSpaceMonitor {
  pub fn new() -> Self {
    Self {
      available: AtomicBool::new(true),
    }
  }

  pub fn is_available(&self) -> bool {
    self.available.load(Ordering::Relaxed)
  }

  pub fn set_available(&self, available: bool) {
    let previous = self.available.swap(available, Ordering::Relaxed);
    if previous != available {
      if available {
        debug!("disk space available again, accepting commands");
      } else {
        warn!("disk space exhausted, rejecting commands");
      }
    }
  }
}

impl Default for DiskSpaceMonitor {
  fn default() -> Self {
    Self::new()
  }
}

/// Generates keys with the owning partition in the high bits, so a key alone
/// names the partition that minted it.
#[derive(Debug)]
pub struct KeyGenerator {
  partition_id: PartitionId,
  counter: AtomicU64,
}

impl KeyGenerator {
  pub fn new(partition_id: PartitionId) -> Self {
    Self::with_counter(partition_id, 1)
  }

  /// Resumes the sequence at `next_counter`, typically the log's high-water
  /// mark plus one. Counters below 1 are clamped to 1.
  pub fn with_counter(partition_id: PartitionId, next_counter: u64) -> Self {
    Self {
      partition_id,
      counter: AtomicU64::new(next_counter.max(1)),
    }
  }

  pub fn next_key(&self) -> u64 {
    partition_key(self.partition_id, self.counter.fetch_add(1, Ordering::Relaxed))
  }
}

// ============================================================================
// Command api
// ============================================================================

/// Everything the command api needs to write to one partition. Registered on
/// leadership, removed when it is lost.
#[derive(Clone)]
pub struct PartitionWriter {
  pub partition_id: PartitionId,
  pub limiter: Arc<RequestLimiter>,
  pub keys: Arc<KeyGenerator>,
  pub executor: Arc<PartitionExecutor>,
  pub storage: Arc<Mutex<LogStorage>>,
  pub max_message_size: usize,
}

impl PartitionWriter {
  pub fn new(
    partition_id: PartitionId,
    limiter: Arc<RequestLimiter>,
    keys: Arc<KeyGenerator>,
    executor: Arc<PartitionExecutor>,
    storage: Arc<Mutex<LogStorage>>,
  ) -> Self {
    Self {
      partition_id,
      limiter,
      keys,
      executor,
      storage,
      max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
    }
  }

  pub fn max_message_size(mut self, value: usize) -> Self {
    self.max_message_size = value;
    self
  }
}

/// Front door for commands. Runs its decision ladder on a dedicated
/// executor; disk writes happen on the owning partition's executor, so the
/// api thread never blocks on IO.
pub struct CommandApiService {
  executor: PartitionExecutor,
  partitions: Arc<Mutex<HashMap<PartitionId, PartitionWriter>>>,
  disk: Arc<DiskSpaceMonitor>,
}

impl CommandApiService {
  pub fn new(disk: Arc<DiskSpaceMonitor>) -> Self {
    Self {
      executor: PartitionExecutor::spawn("command-api"),
      partitions: Arc::new(Mutex::new(HashMap::new())),
      disk,
    }
  }

  /// Registers a partition as writable from this node. Replaces a previous
  /// registration, so a re-election is harmless.
  pub fn add_partition(&self, writer: PartitionWriter) -> Result<()> {
    let partitions = Arc::clone(&self.partitions);
    self.executor.call(move || {
      partitions.lock().insert(writer.partition_id, writer);
    })
  }

  pub fn remove_partition(&self, partition_id: PartitionId) -> Result<()> {
    let partitions = Arc::clone(&self.partitions);
    self.executor.call(move || {
      partitions.lock().remove(&partition_id);
    })
  }

  pub fn has_partition(&self, partition_id: PartitionId) -> bool {
    self.partitions.lock().contains_key(&partition_id)
  }

  /// Runs the admission ladder for one command. The returned completion
  /// resolves once a response exists; an accepted command's limiter slot
  /// stays held until the processing engine answers it.
  pub fn handle(&self, request: CommandRequest) -> Result<Completion<CommandResponse>> {
    let (done, wait) = completion();
    let partitions = Arc::clone(&self.partitions);
    let disk = Arc::clone(&self.disk);

    self.executor.submit(move || {
      match admit(&partitions, &disk, &request) {
        Admission::Reject(response) => done.complete(response),
        Admission::Append { writer, entry } => {
          append_async(writer, request.request_id, entry, done);
        }
      }
    })?;

    Ok(wait)
  }

  pub fn shutdown(&mut self) {
    self.executor.shutdown();
  }
}

enum Admission {
  Reject(CommandResponse),
  Append {
    writer: PartitionWriter,
    entry: LogEntry,
  },
}

/// The decision ladder: disk, leadership, message validity, backpressure,
/// size. Order matters; no later check runs once an earlier one rejected.
fn admit(
  partitions: &Mutex<HashMap<PartitionId, PartitionWriter>>,
  disk: &DiskSpaceMonitor,
  request: &CommandRequest,
) -> Admission {
  if !disk.is_available() {
    return Admission::Reject(CommandResponse::OutOfDiskSpace);
  }

  let writer = match partitions.lock().get(&request.partition_id) {
    Some(writer) => writer.clone(),
    None => return Admission::Reject(CommandResponse::PartitionLeaderMismatch),
  };

  let (value_type, intent) = match (
    ValueType::from_wire(request.value_type),
    Intent::from_wire(request.intent),
  ) {
    (Some(value_type), Some(intent)) => (value_type, intent),
    _ => return Admission::Reject(CommandResponse::UnsupportedMessage),
  };

  if !writer.limiter.try_acquire(request.request_id, value_type, intent) {
    return Admission::Reject(CommandResponse::ResourceExhausted);
  }

  let entry = LogEntry {
    key: request.key.unwrap_or_else(|| writer.keys.next_key()),
    value_type,
    intent,
    payload: request.payload.clone(),
  };

  if entry.encoded_len() > writer.max_message_size {
    release_ignored(&writer, request.request_id);
    return Admission::Reject(CommandResponse::RequestTooLarge);
  }

  Admission::Append { writer, entry }
}

/// Hands the admitted entry to the partition's own executor and completes
/// the response from there.
fn append_async(
  writer: PartitionWriter,
  request_id: RequestId,
  entry: LogEntry,
  done: crate::partition::context::CompletionSender<CommandResponse>,
) {
  let executor = Arc::clone(&writer.executor);
  let submitted = executor.submit(move || {
    let encoded = entry.encode();
    let result = writer.storage.lock().append(&encoded);
    match result {
      Ok(address) => {
        debug!(
          partition = writer.partition_id,
          key = entry.key,
          address,
          "command appended"
        );
        done.complete(CommandResponse::Accepted {
          key: entry.key,
          address,
        });
      }
      Err(err) => {
        error!(partition = writer.partition_id, %err, "append failed");
        release_ignored(&writer, request_id);
        done.complete(CommandResponse::InternalError(err.to_string()));
      }
    }
  });

  if submitted.is_err() {
    // Executor already gone; writer was captured by the dead closure, so
    // the limiter slot leaks with it. The partition is shutting down anyway.
    error!(request = request_id, "partition executor gone, command dropped");
  }
}

fn release_ignored(writer: &PartitionWriter, request_id: RequestId) {
  if let Err(err) = writer.limiter.on_ignore(request_id) {
    error!(partition = writer.partition_id, %err, "failed to release admission slot");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::LogStorageOptions;

  fn open_storage(dir: &std::path::Path) -> Arc<Mutex<LogStorage>> {
    let mut storage = LogStorage::new(dir, LogStorageOptions::new().segment_capacity(16 * 1024));
    storage.open(true).expect("open");
    Arc::new(Mutex::new(storage))
  }

  fn writer_for(partition_id: PartitionId, dir: &std::path::Path, limit: usize) -> PartitionWriter {
    PartitionWriter::new(
      partition_id,
      Arc::new(RequestLimiter::new(partition_id, limit)),
      Arc::new(KeyGenerator::new(partition_id)),
      Arc::new(PartitionExecutor::spawn(format!("partition-{partition_id}"))),
      open_storage(dir),
    )
  }

  fn request(partition_id: PartitionId, request_id: RequestId) -> CommandRequest {
    CommandRequest {
      partition_id,
      request_id,
      key: None,
      value_type: ValueType::Job.to_wire(),
      intent: Intent::Create.to_wire(),
      payload: b"payload".to_vec(),
    }
  }

  #[test]
  fn entry_codec_roundtrip() {
    let entry = LogEntry {
      key: partition_key(4, 77),
      value_type: ValueType::Message,
      intent: Intent::Cancel,
      payload: b"hello".to_vec(),
    };
    let encoded = entry.encode();
    assert_eq!(encoded.len(), entry.encoded_len());
    assert_eq!(LogEntry::decode(&encoded).expect("decode"), entry);
  }

  #[test]
  fn truncated_entry_fails_to_decode() {
    let entry = LogEntry {
      key: 1,
      value_type: ValueType::Job,
      intent: Intent::Create,
      payload: b"hello".to_vec(),
    };
    let mut encoded = entry.encode();
    encoded.truncate(encoded.len() - 2);
    assert!(LogEntry::decode(&encoded).is_err());
  }

  #[test]
  fn unknown_partition_is_a_leader_mismatch() {
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    let response = service.handle(request(1, 1)).expect("submit").wait().expect("wait");
    assert_eq!(response, CommandResponse::PartitionLeaderMismatch);
  }

  #[test]
  fn full_disk_rejects_before_anything_else() {
    let disk = Arc::new(DiskSpaceMonitor::new());
    disk.set_available(false);
    let service = CommandApiService::new(Arc::clone(&disk));

    let response = service.handle(request(1, 1)).expect("submit").wait().expect("wait");
    assert_eq!(response, CommandResponse::OutOfDiskSpace);
  }

  #[test]
  fn unknown_value_type_is_unsupported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    service
      .add_partition(writer_for(1, &dir.path().join("p1"), 8))
      .expect("add");

    let mut req = request(1, 1);
    req.value_type = 200;
    let response = service.handle(req).expect("submit").wait().expect("wait");
    assert_eq!(response, CommandResponse::UnsupportedMessage);
  }

  #[test]
  fn accepted_command_lands_in_the_log_with_a_generated_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    let writer = writer_for(7, &dir.path().join("p7"), 8);
    let storage = Arc::clone(&writer.storage);
    service.add_partition(writer).expect("add");

    let response = service.handle(request(7, 1)).expect("submit").wait().expect("wait");
    let (key, address) = match response {
      CommandResponse::Accepted { key, address } => (key, address),
      other => panic!("unexpected response: {other:?}"),
    };
    assert_eq!(crate::types::key_partition(key), 7);

    let mut buf = [0u8; 256];
    let outcome = storage.lock().read(&mut buf, address).expect("read");
    let len = match outcome {
      crate::storage::ReadOutcome::Block(len) => len,
      other => panic!("unexpected outcome: {other:?}"),
    };
    let entry = LogEntry::decode(&buf[..len]).expect("decode");
    assert_eq!(entry.key, key);
    assert_eq!(entry.payload, b"payload");
  }

  #[test]
  fn backpressure_rejects_until_the_engine_responds() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    let writer = writer_for(1, &dir.path().join("p1"), 1);
    let limiter = Arc::clone(&writer.limiter);
    service.add_partition(writer).expect("add");

    let first = service.handle(request(1, 1)).expect("submit").wait().expect("wait");
    assert!(matches!(first, CommandResponse::Accepted { .. }));

    let second = service.handle(request(1, 2)).expect("submit").wait().expect("wait");
    assert_eq!(second, CommandResponse::ResourceExhausted);
    assert_eq!(limiter.snapshot().dropped, 1);

    // The engine answers the first command, freeing its slot.
    limiter.on_response(1).expect("release");
    let third = service.handle(request(1, 3)).expect("submit").wait().expect("wait");
    assert!(matches!(third, CommandResponse::Accepted { .. }));
  }

  #[test]
  fn oversized_command_releases_its_slot() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    let writer = writer_for(1, &dir.path().join("p1"), 4).max_message_size(64);
    let limiter = Arc::clone(&writer.limiter);
    service.add_partition(writer).expect("add");

    let mut req = request(1, 1);
    req.payload = vec![0u8; 128];
    let response = service.handle(req).expect("submit").wait().expect("wait");
    assert_eq!(response, CommandResponse::RequestTooLarge);
    assert_eq!(limiter.snapshot().inflight, 0);
  }

  #[test]
  fn removed_partition_stops_accepting() {
    let dir = tempfile::tempdir().expect("tempdir");
    let service = CommandApiService::new(Arc::new(DiskSpaceMonitor::new()));
    service
      .add_partition(writer_for(1, &dir.path().join("p1"), 8))
      .expect("add");
    service.remove_partition(1).expect("remove");

    let response = service.handle(request(1, 1)).expect("submit").wait().expect("wait");
    assert_eq!(response, CommandResponse::PartitionLeaderMismatch);
  }
}
