//! Per-partition admission control.
//!
//! Each partition leader tracks the commands it has admitted but not yet
//! answered. Once the in-flight count reaches the configured limit, further
//! commands are turned away at the door instead of queueing up behind a
//! writer that cannot keep pace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use tracing::debug;

use crate::constants::DEFAULT_REQUEST_LIMIT;
use crate::error::{FlowlogError, Result};
use crate::types::{Intent, PartitionId, RequestId, ValueType};

/// One admitted, not-yet-answered command.
#[derive(Debug, Clone)]
struct InflightRequest {
  value_type: ValueType,
  intent: Intent,
  accepted_at: Instant,
}

#[derive(Debug)]
struct LimiterState {
  limit: usize,
  inflight: HashMap<RequestId, InflightRequest>,
}

/// Counters for observability, read without taking the state lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterSnapshot {
  pub limit: usize,
  pub inflight: usize,
  pub received: u64,
  pub dropped: u64,
}

/// Bounds the number of commands in flight on one partition.
#[derive(Debug)]
pub struct RequestLimiter {
  partition_id: PartitionId,
  state: Mutex<LimiterState>,
  received: AtomicU64,
  dropped: AtomicU64,
}

impl RequestLimiter {
  pub fn new(partition_id: PartitionId, limit: usize) -> Self {
    Self {
      partition_id,
      state: Mutex::new(LimiterState {
        limit,
        inflight: HashMap::new(),
      }),
      received: AtomicU64::new(0),
      dropped: AtomicU64::new(0),
    }
  }

  pub fn with_default_limit(partition_id: PartitionId) -> Self {
    Self::new(partition_id, DEFAULT_REQUEST_LIMIT)
  }

  /// Tries to admit a command. Returns `false` when the partition is at its
  /// limit or when the request id is already in flight; an admitted request
  /// holds its slot until `on_response` or `on_ignore`.
  pub fn try_acquire(
    &self,
    request_id: RequestId,
    value_type: ValueType,
    intent: Intent,
  ) -> bool {
    self.received.fetch_add(1, Ordering::Relaxed);

    let mut state = self.state.lock();
    if state.inflight.len() >= state.limit || state.inflight.contains_key(&request_id) {
      drop(state);
      self.dropped.fetch_add(1, Ordering::Relaxed);
      debug!(
        partition = self.partition_id,
        request = request_id,
        "admission rejected"
      );
      return false;
    }

    state.inflight.insert(
      request_id,
      InflightRequest {
        value_type,
        intent,
        accepted_at: Instant::now(),
      },
    );
    true
  }

  /// Releases the slot once the command's response went out.
  pub fn on_response(&self, request_id: RequestId) -> Result<()> {
    self.release(request_id)
  }

  /// Releases the slot for a command that will never be answered, e.g. one
  /// rejected after admission but before it reached the log.
  pub fn on_ignore(&self, request_id: RequestId) -> Result<()> {
    self.release(request_id)
  }

  fn release(&self, request_id: RequestId) -> Result<()> {
    let mut state = self.state.lock();
    match state.inflight.remove(&request_id) {
      Some(entry) => {
        debug!(
          partition = self.partition_id,
          request = request_id,
          value_type = ?entry.value_type,
          intent = ?entry.intent,
          latency_us = entry.accepted_at.elapsed().as_micros() as u64,
          "admission slot released"
        );
        Ok(())
      }
      None => Err(FlowlogError::RequestNotInFlight {
        partition_id: self.partition_id,
        request_id,
      }),
    }
  }

  /// Changes the limit. Requests already in flight keep their slots even if
  /// the new limit is lower; the limiter simply stops admitting until the
  /// count drains below it.
  pub fn set_limit(&self, limit: usize) {
    self.state.lock().limit = limit;
  }

  pub fn partition_id(&self) -> PartitionId {
    self.partition_id
  }

  pub fn snapshot(&self) -> LimiterSnapshot {
    let state = self.state.lock();
    LimiterSnapshot {
      limit: state.limit,
      inflight: state.inflight.len(),
      received: self.received.load(Ordering::Relaxed),
      dropped: self.dropped.load(Ordering::Relaxed),
    }
  }
}
