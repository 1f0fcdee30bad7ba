//! Broker configuration.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
  DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REDISTRIBUTION_INTERVAL_MS, DEFAULT_REQUEST_LIMIT,
  DEFAULT_SEGMENT_CAPACITY,
};
use crate::error::{FlowlogError, Result};
use crate::partition::PartitionOptions;
use crate::types::NodeId;

/// Node-wide settings, loadable from a JSON file. Missing fields fall back
/// to their defaults so an empty object is a valid configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  pub node_id: NodeId,
  pub data_directory: PathBuf,
  pub segment_capacity: u32,
  pub max_message_size: usize,
  pub request_limit: usize,
  pub redistribution_interval_ms: u64,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      node_id: 0,
      data_directory: PathBuf::from("data"),
      segment_capacity: DEFAULT_SEGMENT_CAPACITY,
      max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
      request_limit: DEFAULT_REQUEST_LIMIT,
      redistribution_interval_ms: DEFAULT_REDISTRIBUTION_INTERVAL_MS,
    }
  }
}

impl BrokerConfig {
  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
    let raw = fs::read_to_string(path.as_ref())?;
    let config: Self = serde_json::from_str(&raw)
      .map_err(|err| FlowlogError::InvalidConfig(err.to_string()))?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<()> {
    if self.segment_capacity as usize <= crate::constants::SEGMENT_HEADER_SIZE as usize {
      return Err(FlowlogError::InvalidConfig(
        "segment capacity must exceed the segment header".to_string(),
      ));
    }
    if self.max_message_size == 0 {
      return Err(FlowlogError::InvalidConfig(
        "max message size must be positive".to_string(),
      ));
    }
    if self.request_limit == 0 {
      return Err(FlowlogError::InvalidConfig(
        "request limit must be positive".to_string(),
      ));
    }
    if self.redistribution_interval_ms == 0 {
      return Err(FlowlogError::InvalidConfig(
        "redistribution interval must be positive".to_string(),
      ));
    }
    Ok(())
  }

  pub fn partition_options(&self) -> PartitionOptions {
    PartitionOptions::new()
      .segment_capacity(self.segment_capacity)
      .max_message_size(self.max_message_size)
      .request_limit(self.request_limit)
      .redistribution_interval(Duration::from_millis(self.redistribution_interval_ms))
  }
}
