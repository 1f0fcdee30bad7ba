//! Cross-partition command distribution.
//!
//! A command committed on one partition is pushed to its sibling partitions
//! with at-least-once delivery: the origin durably records one pending
//! distribution per target, targets deduplicate and acknowledge, and the
//! origin finishes the distribution once every target acknowledged. The
//! `Redistributor` resends whatever is still outstanding.

pub mod redistributor;

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use indexmap::IndexMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::command::{KeyGenerator, LogEntry, ProcessingOutcome, RecordProcessor};
use crate::error::{FlowlogError, Result};
use crate::storage::LogStorage;
use crate::types::{key_partition, DistributionKey, Intent, PartitionId, ValueType};

pub use redistributor::Redistributor;

// ============================================================================
// Record codec
// ============================================================================

/// Payload of a `ValueType::CommandDistribution` log entry. The wrapped
/// command travels opaque inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistributionRecord {
  pub target_partition: PartitionId,
  pub value_type: ValueType,
  pub intent: Intent,
  pub payload: Vec<u8>,
}

const RECORD_TARGET_OFFSET: usize = 0;
const RECORD_VALUE_TYPE_OFFSET: usize = 4;
const RECORD_INTENT_OFFSET: usize = 5;
const RECORD_PAYLOAD_LEN_OFFSET: usize = 6;
const RECORD_PAYLOAD_OFFSET: usize = 10;

impl DistributionRecord {
  pub fn encode(&self) -> Vec<u8> {
    let mut buf = vec![0u8; RECORD_PAYLOAD_OFFSET + self.payload.len()];
    LittleEndian::write_u32(&mut buf[RECORD_TARGET_OFFSET..], self.target_partition);
    buf[RECORD_VALUE_TYPE_OFFSET] = self.value_type.to_wire();
    buf[RECORD_INTENT_OFFSET] = self.intent.to_wire();
    LittleEndian::write_u32(&mut buf[RECORD_PAYLOAD_LEN_OFFSET..], self.payload.len() as u32);
    buf[RECORD_PAYLOAD_OFFSET..].copy_from_slice(&self.payload);
    buf
  }

  pub fn decode(buf: &[u8]) -> Result<Self> {
    if buf.len() < RECORD_PAYLOAD_OFFSET {
      return Err(FlowlogError::Internal(
        "distribution record is shorter than the fixed fields".to_string(),
      ));
    }
    let target_partition = LittleEndian::read_u32(&buf[RECORD_TARGET_OFFSET..]);
    let value_type = ValueType::from_wire(buf[RECORD_VALUE_TYPE_OFFSET]).ok_or_else(|| {
      FlowlogError::Internal("unknown value type in distribution record".to_string())
    })?;
    let intent = Intent::from_wire(buf[RECORD_INTENT_OFFSET])
      .ok_or_else(|| FlowlogError::Internal("unknown intent in distribution record".to_string()))?;
    let payload_len = LittleEndian::read_u32(&buf[RECORD_PAYLOAD_LEN_OFFSET..]) as usize;
    if buf.len() < RECORD_PAYLOAD_OFFSET + payload_len {
      return Err(FlowlogError::Internal(
        "distribution record payload is truncated".to_string(),
      ));
    }
    Ok(Self {
      target_partition,
      value_type,
      intent,
      payload: buf[RECORD_PAYLOAD_OFFSET..RECORD_PAYLOAD_OFFSET + payload_len].to_vec(),
    })
  }
}

// ============================================================================
// Transport seam
// ============================================================================

/// Routes distribution messages between partitions. A target without a
/// known leader answers `PartitionNotAvailable`; the sender treats that as
/// "retry later", never as fatal.
pub trait DistributionTransport: Send + Sync {
  fn send_distribute(
    &self,
    target: PartitionId,
    origin: PartitionId,
    key: DistributionKey,
    value_type: ValueType,
    intent: Intent,
    payload: &[u8],
  ) -> Result<()>;

  fn send_acknowledge(
    &self,
    origin: PartitionId,
    target: PartitionId,
    key: DistributionKey,
  ) -> Result<()>;
}

// ============================================================================
// Distribution state
// ============================================================================

/// One distribution the origin still owes acknowledgements for.
#[derive(Debug)]
struct PendingDistribution {
  value_type: ValueType,
  intent: Intent,
  payload: Vec<u8>,
  targets: BTreeSet<PartitionId>,
  acknowledged: BTreeSet<PartitionId>,
  enqueued_at: Instant,
  retries: u64,
}

#[derive(Debug, Default)]
struct DistributionInner {
  /// Origin side, in start order.
  pending: IndexMap<DistributionKey, PendingDistribution>,
  /// Target side dedup: every distribution applied here, finished or not.
  applied: HashSet<DistributionKey>,
  retries_total: u64,
  finished_total: u64,
}

/// Counters for the metrics module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DistributionSnapshot {
  pub pending: usize,
  pub retries: u64,
  pub finished: u64,
}

/// Distribution bookkeeping rebuilt from the log while a partition starts.
/// Feed it every recovered entry in log order, then hand it to
/// `DistributionState::restore`.
#[derive(Default)]
pub struct RecoveredDistributions {
  pending: IndexMap<DistributionKey, PendingDistribution>,
  applied: HashSet<DistributionKey>,
}

impl RecoveredDistributions {
  pub fn observe(&mut self, partition_id: PartitionId, entry: &LogEntry) {
    let own_key = key_partition(entry.key) == partition_id;
    if entry.value_type == ValueType::CommandDistribution && own_key {
      let record = match DistributionRecord::decode(&entry.payload) {
        Ok(record) => record,
        Err(err) => {
          warn!(
            distribution = entry.key,
            %err,
            "skipping undecodable distribution record during recovery"
          );
          return;
        }
      };
      match entry.intent {
        Intent::Distribute => {
          let pending = self
            .pending
            .entry(entry.key)
            .or_insert_with(|| PendingDistribution {
              value_type: record.value_type,
              intent: record.intent,
              payload: record.payload,
              targets: BTreeSet::new(),
              acknowledged: BTreeSet::new(),
              enqueued_at: Instant::now(),
              retries: 0,
            });
          pending.targets.insert(record.target_partition);
        }
        Intent::Acknowledge => {
          if let Some(pending) = self.pending.get_mut(&entry.key) {
            pending.acknowledged.insert(record.target_partition);
          }
        }
        Intent::Finish => {
          self.pending.shift_remove(&entry.key);
        }
        _ => {}
      }
    } else if !own_key {
      // A command another partition distributed here; remembering its key
      // keeps a resend after the restart from applying twice.
      self.applied.insert(entry.key);
    }
  }
}

/// Per-partition distribution bookkeeping. Origin and target roles share
/// one instance; both sides persist their steps to the partition's log.
pub struct DistributionState {
  partition_id: PartitionId,
  storage: Arc<Mutex<LogStorage>>,
  keys: Arc<KeyGenerator>,
  transport: Arc<dyn DistributionTransport>,
  inner: Mutex<DistributionInner>,
}

impl DistributionState {
  pub fn new(
    partition_id: PartitionId,
    storage: Arc<Mutex<LogStorage>>,
    keys: Arc<KeyGenerator>,
    transport: Arc<dyn DistributionTransport>,
  ) -> Self {
    Self {
      partition_id,
      storage,
      keys,
      transport,
      inner: Mutex::new(DistributionInner::default()),
    }
  }

  pub fn partition_id(&self) -> PartitionId {
    self.partition_id
  }

  /// Installs state rebuilt from the log. A distribution whose targets had
  /// all acknowledged before the crash but that never got its `Finish`
  /// record is finished here; everything else goes back to pending and is
  /// picked up by the redistributor.
  pub fn restore(&self, recovered: RecoveredDistributions) -> Result<()> {
    let RecoveredDistributions { pending, applied } = recovered;

    let mut completed = Vec::new();
    {
      let mut inner = self.inner.lock();
      inner.applied.extend(applied);
      for (key, entry) in pending {
        if entry.targets.is_subset(&entry.acknowledged) {
          inner.finished_total += 1;
          completed.push((key, entry.value_type, entry.intent));
        } else {
          inner.pending.insert(key, entry);
        }
      }
    }

    for (key, value_type, intent) in completed {
      self.append_record(key, Intent::Finish, value_type, intent, &[], self.partition_id)?;
      info!(
        partition = self.partition_id,
        distribution = key,
        "fully acknowledged distribution finished during recovery"
      );
    }
    Ok(())
  }

  /// Starts distributing an already committed command to `targets`. Appends
  /// one `Distributing` record per target, then pushes the command out; a
  /// target that cannot be reached right now stays pending for the
  /// redistributor.
  pub fn start_distribution(
    &self,
    value_type: ValueType,
    intent: Intent,
    payload: Vec<u8>,
    targets: BTreeSet<PartitionId>,
  ) -> Result<DistributionKey> {
    if targets.contains(&self.partition_id) {
      return Err(FlowlogError::Internal(
        "a partition cannot distribute to itself".to_string(),
      ));
    }
    if targets.is_empty() {
      return Err(FlowlogError::Internal(
        "distribution needs at least one target".to_string(),
      ));
    }

    let key = self.keys.next_key();

    for target in &targets {
      self.append_record(key, Intent::Distribute, value_type, intent, &payload, *target)?;
    }

    {
      let mut inner = self.inner.lock();
      inner.pending.insert(
        key,
        PendingDistribution {
          value_type,
          intent,
          payload: payload.clone(),
          targets: targets.clone(),
          acknowledged: BTreeSet::new(),
          enqueued_at: Instant::now(),
          retries: 0,
        },
      );
    }

    for target in &targets {
      self.push_to_target(key, *target, value_type, intent, &payload);
    }

    debug!(
      partition = self.partition_id,
      distribution = key,
      targets = targets.len(),
      "distribution started"
    );
    Ok(key)
  }

  /// Target side: applies a distributed command once and acknowledges every
  /// delivery of it. A business rejection still acknowledges; the origin
  /// only cares that the target has seen the command.
  pub fn on_distribute(
    &self,
    origin: PartitionId,
    key: DistributionKey,
    value_type: ValueType,
    intent: Intent,
    payload: &[u8],
    processor: &mut dyn RecordProcessor,
  ) -> Result<()> {
    let first_delivery = self.inner.lock().applied.insert(key);

    if first_delivery {
      let entry = LogEntry {
        key,
        value_type,
        intent,
        payload: payload.to_vec(),
      };
      self.storage.lock().append(&entry.encode())?;

      match processor.apply(&entry) {
        ProcessingOutcome::Applied => {
          debug!(partition = self.partition_id, distribution = key, "distributed command applied");
        }
        ProcessingOutcome::Rejected(reason) => {
          info!(
            partition = self.partition_id,
            distribution = key,
            reason,
            "distributed command rejected, acknowledging anyway"
          );
        }
      }
    } else {
      debug!(
        partition = self.partition_id,
        distribution = key,
        "duplicate delivery ignored"
      );
    }

    if let Err(err) = self.transport.send_acknowledge(origin, self.partition_id, key) {
      warn!(
        partition = self.partition_id,
        distribution = key,
        %err,
        "acknowledgement not deliverable, origin will resend"
      );
    }
    Ok(())
  }

  /// Origin side: records one target's acknowledgement. Duplicate and
  /// late acknowledgements are no-ops; the `Finish` record is appended
  /// exactly once, when the last missing target acknowledged.
  pub fn on_acknowledge(&self, key: DistributionKey, from: PartitionId) -> Result<()> {
    let completed = {
      let mut inner = self.inner.lock();
      let Some(pending) = inner.pending.get_mut(&key) else {
        debug!(
          partition = self.partition_id,
          distribution = key,
          from,
          "acknowledgement for finished distribution ignored"
        );
        return Ok(());
      };

      if !pending.acknowledged.insert(from) {
        return Ok(());
      }
      let value_type = pending.value_type;
      let intent = pending.intent;
      if pending.targets.is_subset(&pending.acknowledged) {
        inner
          .pending
          .shift_remove(&key)
          .expect("pending entry checked above");
        inner.finished_total += 1;
        Some((value_type, intent))
      } else {
        None
      }
    };

    self.append_record(
      key,
      Intent::Acknowledge,
      ValueType::CommandDistribution,
      Intent::Acknowledge,
      &[],
      from,
    )?;

    if let Some((value_type, intent)) = completed {
      self.append_record(key, Intent::Finish, value_type, intent, &[], self.partition_id)?;
      info!(partition = self.partition_id, distribution = key, "distribution finished");
    }
    Ok(())
  }

  /// Resends every pending distribution older than `min_age` to its still
  /// unacknowledged targets. Targets without a route are skipped and picked
  /// up again on the next scan; a distribution is retried until it finishes.
  pub fn retry_pending(&self, min_age: std::time::Duration) -> usize {
    let due = {
      let mut inner = self.inner.lock();
      let mut due = Vec::new();
      for (key, pending) in inner.pending.iter_mut() {
        if pending.enqueued_at.elapsed() < min_age {
          continue;
        }
        let missing: Vec<PartitionId> = pending
          .targets
          .difference(&pending.acknowledged)
          .copied()
          .collect();
        if missing.is_empty() {
          continue;
        }
        pending.retries += 1;
        due.push((
          *key,
          pending.value_type,
          pending.intent,
          pending.payload.clone(),
          missing,
        ));
      }
      inner.retries_total += due.len() as u64;
      due
    };

    let mut resent = 0;
    for (key, value_type, intent, payload, missing) in due {
      for target in missing {
        if self.push_to_target(key, target, value_type, intent, &payload) {
          resent += 1;
        }
      }
    }
    resent
  }

  pub fn snapshot(&self) -> DistributionSnapshot {
    let inner = self.inner.lock();
    DistributionSnapshot {
      pending: inner.pending.len(),
      retries: inner.retries_total,
      finished: inner.finished_total,
    }
  }

  #[cfg(test)]
  fn pending_retries(&self, key: DistributionKey) -> Option<u64> {
    self.inner.lock().pending.get(&key).map(|p| p.retries)
  }

  fn push_to_target(
    &self,
    key: DistributionKey,
    target: PartitionId,
    value_type: ValueType,
    intent: Intent,
    payload: &[u8],
  ) -> bool {
    match self
      .transport
      .send_distribute(target, self.partition_id, key, value_type, intent, payload)
    {
      Ok(()) => true,
      Err(err) => {
        debug!(
          partition = self.partition_id,
          distribution = key,
          target,
          %err,
          "target unreachable, will retry"
        );
        false
      }
    }
  }

  fn append_record(
    &self,
    key: DistributionKey,
    distribution_intent: Intent,
    value_type: ValueType,
    intent: Intent,
    payload: &[u8],
    target: PartitionId,
  ) -> Result<()> {
    let record = DistributionRecord {
      target_partition: target,
      value_type,
      intent,
      payload: payload.to_vec(),
    };
    let entry = LogEntry {
      key,
      value_type: ValueType::CommandDistribution,
      intent: distribution_intent,
      payload: record.encode(),
    };
    self.storage.lock().append(&entry.encode())?;
    Ok(())
  }
}
