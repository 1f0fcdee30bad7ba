//! Shared identifier types and wire enums.

use serde::{Deserialize, Serialize};

use crate::constants::KEY_COUNTER_BITS;

/// Identifies one replicated partition of the overall log
pub type PartitionId = u32;

/// Identifies one cluster node
pub type NodeId = u32;

/// Correlates an inbound request with its response and admission slot
pub type RequestId = u64;

/// Identifies one cross-partition distribution until it is finished
pub type DistributionKey = u64;

/// Logical position of one block in a partition's log:
/// `(segment_id << 32) | offset_within_segment`
pub type LogAddress = u64;

/// Builds an address from a segment id and in-segment offset.
pub fn log_address(segment_id: u32, offset: u32) -> LogAddress {
  ((segment_id as u64) << 32) | offset as u64
}

/// Segment id part of an address.
pub fn address_segment_id(address: LogAddress) -> u32 {
  (address >> 32) as u32
}

/// In-segment offset part of an address.
pub fn address_offset(address: LogAddress) -> u32 {
  address as u32
}

/// Packs the owning partition id into the high bits of a generated key.
pub fn partition_key(partition_id: PartitionId, counter: u64) -> u64 {
  ((partition_id as u64) << KEY_COUNTER_BITS) | (counter & ((1u64 << KEY_COUNTER_BITS) - 1))
}

/// Partition that generated the given key.
pub fn key_partition(key: u64) -> PartitionId {
  (key >> KEY_COUNTER_BITS) as PartitionId
}

/// Counter part of a generated key.
pub fn key_counter(key: u64) -> u64 {
  key & ((1u64 << KEY_COUNTER_BITS) - 1)
}

/// Category of the value carried by a command record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueType {
  Deployment = 0,
  ProcessInstance = 1,
  Job = 2,
  Message = 3,
  Signal = 4,
  CommandDistribution = 5,
}

impl ValueType {
  /// Decodes a wire byte; `None` marks an unsupported message.
  pub fn from_wire(raw: u8) -> Option<Self> {
    match raw {
      0 => Some(Self::Deployment),
      1 => Some(Self::ProcessInstance),
      2 => Some(Self::Job),
      3 => Some(Self::Message),
      4 => Some(Self::Signal),
      5 => Some(Self::CommandDistribution),
      _ => None,
    }
  }

  pub fn to_wire(self) -> u8 {
    self as u8
  }
}

/// What the command asks the engine to do with the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Intent {
  Create = 0,
  Update = 1,
  Cancel = 2,
  Complete = 3,
  Distribute = 4,
  Acknowledge = 5,
  Finish = 6,
}

impl Intent {
  pub fn from_wire(raw: u8) -> Option<Self> {
    match raw {
      0 => Some(Self::Create),
      1 => Some(Self::Update),
      2 => Some(Self::Cancel),
      3 => Some(Self::Complete),
      4 => Some(Self::Distribute),
      5 => Some(Self::Acknowledge),
      6 => Some(Self::Finish),
      _ => None,
    }
  }

  pub fn to_wire(self) -> u8 {
    self as u8
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn address_packs_and_unpacks() {
    let address = log_address(7, 4096);
    assert_eq!(address_segment_id(address), 7);
    assert_eq!(address_offset(address), 4096);
  }

  #[test]
  fn addresses_are_monotonic_across_segments() {
    let end_of_first = log_address(1, u32::MAX);
    let start_of_second = log_address(2, 0);
    assert!(end_of_first < start_of_second);
  }

  #[test]
  fn generated_keys_carry_the_partition() {
    let key = partition_key(3, 42);
    assert_eq!(key_partition(key), 3);
    assert_eq!(key_counter(key), 42);
  }

  #[test]
  fn unknown_wire_bytes_are_rejected() {
    assert_eq!(ValueType::from_wire(200), None);
    assert_eq!(Intent::from_wire(200), None);
    assert_eq!(ValueType::from_wire(5), Some(ValueType::CommandDistribution));
  }
}
