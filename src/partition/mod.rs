//! Partition ownership: execution context, lifecycle, and the manager.

pub mod context;
pub mod lifecycle;
pub mod manager;

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::command::{PartitionWriter, RecordProcessor};
use crate::constants::{
  DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_REDISTRIBUTION_INTERVAL_MS, DEFAULT_REQUEST_LIMIT,
  DEFAULT_SEGMENT_CAPACITY,
};
use crate::distribution::redistributor::{Redistributor, RedistributorConfig};
use crate::distribution::DistributionTransport;
use crate::error::{FlowlogError, Result};
use crate::replication::{ReplicationClient, Role};
use crate::types::{NodeId, PartitionId};

pub use context::{Completion, PartitionExecutor};
pub use lifecycle::{SnapshotStore, StartMode, StartupStep};
pub use manager::PartitionManager;

/// Per-partition tuning knobs.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
  pub segment_capacity: u32,
  pub max_message_size: usize,
  pub request_limit: usize,
  pub redistribution_interval: Duration,
}

impl Default for PartitionOptions {
  fn default() -> Self {
    Self {
      segment_capacity: DEFAULT_SEGMENT_CAPACITY,
      max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
      request_limit: DEFAULT_REQUEST_LIMIT,
      redistribution_interval: Duration::from_millis(DEFAULT_REDISTRIBUTION_INTERVAL_MS),
    }
  }
}

impl PartitionOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn segment_capacity(mut self, value: u32) -> Self {
    self.segment_capacity = value;
    self
  }

  pub fn max_message_size(mut self, value: usize) -> Self {
    self.max_message_size = value;
    self
  }

  pub fn request_limit(mut self, value: usize) -> Self {
    self.request_limit = value;
    self
  }

  pub fn redistribution_interval(mut self, value: Duration) -> Self {
    self.redistribution_interval = value;
    self
  }
}

/// Externally visible partition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionStatus {
  Bootstrapping,
  Joining,
  Started(Role),
  Stopping,
  Stopped,
}

/// One partition hosted on this node. All heavyweight state lives in the
/// runtime built by the startup steps; the handle itself is cheap and
/// sharable.
pub struct Partition {
  id: PartitionId,
  directory: PathBuf,
  options: PartitionOptions,
  status: Mutex<PartitionStatus>,
  shutdown: AtomicBool,
  runtime: Mutex<Option<lifecycle::PartitionRuntime>>,
}

impl Partition {
  pub fn new(id: PartitionId, directory: PathBuf, options: PartitionOptions) -> Self {
    Self {
      id,
      directory,
      options,
      status: Mutex::new(PartitionStatus::Stopped),
      shutdown: AtomicBool::new(false),
      runtime: Mutex::new(None),
    }
  }

  pub fn id(&self) -> PartitionId {
    self.id
  }

  pub fn status(&self) -> PartitionStatus {
    *self.status.lock()
  }

  /// Runs the startup steps. Exactly one start may be in flight; a second
  /// start while a runtime exists is a defect of the caller and rejected.
  pub fn start(
    &self,
    mode: StartMode,
    client: Arc<dyn ReplicationClient>,
    transport: Arc<dyn DistributionTransport>,
    processor: Box<dyn RecordProcessor>,
    callback: lifecycle::RoleCallback,
  ) -> Result<()> {
    if self.runtime.lock().is_some() {
      return Err(FlowlogError::PartitionExists(self.id));
    }
    self.shutdown.store(false, Ordering::Relaxed);
    *self.status.lock() = match mode {
      StartMode::Bootstrap => PartitionStatus::Bootstrapping,
      StartMode::Join => PartitionStatus::Joining,
    };

    let ctx = lifecycle::StartContext {
      partition_id: self.id,
      directory: self.directory.clone(),
      options: self.options.clone(),
      mode,
      client,
      transport,
      processor: Mutex::new(Some(processor)),
      callback,
    };

    match lifecycle::run_startup(&ctx, &self.shutdown) {
      Ok(runtime) => {
        let role = runtime.group.current_role();
        *self.runtime.lock() = Some(runtime);
        *self.status.lock() = PartitionStatus::Started(role);
        // The callback ran during startup before the runtime existed;
        // re-apply the role now that writer handles can be built.
        (ctx.callback)(role);
        Ok(())
      }
      Err(err) => {
        *self.status.lock() = PartitionStatus::Stopped;
        Err(err)
      }
    }
  }

  /// Flags a shutdown so an in-flight startup aborts at the next step.
  pub fn request_shutdown(&self) {
    self.shutdown.store(true, Ordering::Relaxed);
  }

  /// Reverse of `start`. The partition's data stays on disk.
  pub fn stop(&self) -> Result<()> {
    self.request_shutdown();
    let runtime = self.runtime.lock().take();
    let Some(runtime) = runtime else {
      return Ok(());
    };
    *self.status.lock() = PartitionStatus::Stopping;
    let result = lifecycle::run_shutdown(self.id, runtime);
    *self.status.lock() = PartitionStatus::Stopped;
    result
  }

  /// Removes this node from the partition's replication group, then stops
  /// the partition and deletes its directory. If leaving the group fails the
  /// partition keeps running; a failed directory deletion is logged, not
  /// fatal.
  pub fn leave(&self) -> Result<()> {
    {
      let runtime = self.runtime.lock();
      let runtime = runtime
        .as_ref()
        .ok_or(FlowlogError::PartitionNotAvailable(self.id))?;
      runtime.group.leave()?;
    }

    self.stop()?;
    if let Err(err) = fs::remove_dir_all(&self.directory) {
      warn!(partition = self.id, %err, "partition directory could not be deleted after leave");
    } else {
      info!(partition = self.id, "partition left and directory deleted");
    }
    Ok(())
  }

  pub fn reconfigure_priority(&self, priority: u32) -> Result<()> {
    let runtime = self.runtime.lock();
    let runtime = runtime
      .as_ref()
      .ok_or(FlowlogError::PartitionNotAvailable(self.id))?;
    runtime.group.reconfigure_priority(priority)
  }

  pub fn force_reconfigure(&self, members: &[NodeId]) -> Result<()> {
    let runtime = self.runtime.lock();
    let runtime = runtime
      .as_ref()
      .ok_or(FlowlogError::PartitionNotAvailable(self.id))?;
    runtime.group.force_reconfigure(members)
  }

  /// Writer handle for the command api; `None` while not started.
  pub fn writer(&self) -> Option<PartitionWriter> {
    let runtime = self.runtime.lock();
    let runtime = runtime.as_ref()?;
    Some(
      PartitionWriter::new(
        self.id,
        Arc::clone(&runtime.limiter),
        Arc::clone(&runtime.keys),
        Arc::clone(&runtime.executor),
        Arc::clone(&runtime.storage),
      )
      .max_message_size(self.options.max_message_size),
    )
  }

  /// Reacts to a role change: leaders register with the command api and run
  /// a redistributor, everyone else unregisters. Safe to call repeatedly
  /// with the same role.
  pub fn apply_role(&self, role: Role, command_api: &crate::command::CommandApiService) {
    if let PartitionStatus::Started(_) = self.status() {
      *self.status.lock() = PartitionStatus::Started(role);
    }

    if role.is_leader() {
      if let Some(writer) = self.writer() {
        if let Err(err) = command_api.add_partition(writer) {
          warn!(partition = self.id, %err, "could not register partition with the command api");
        }
      }
      self.start_redistributor();
    } else {
      if let Err(err) = command_api.remove_partition(self.id) {
        warn!(partition = self.id, %err, "could not unregister partition from the command api");
      }
      self.stop_redistributor();
    }
  }

  fn start_redistributor(&self) {
    let runtime = self.runtime.lock();
    let Some(runtime) = runtime.as_ref() else {
      return;
    };
    let mut slot = runtime.redistributor.lock();
    if slot.is_none() {
      *slot = Some(Redistributor::start(
        Arc::clone(&runtime.distribution),
        RedistributorConfig {
          interval: self.options.redistribution_interval,
        },
      ));
    }
  }

  fn stop_redistributor(&self) {
    let runtime = self.runtime.lock();
    let Some(runtime) = runtime.as_ref() else {
      return;
    };
    let redistributor = runtime.redistributor.lock().take();
    if let Some(mut redistributor) = redistributor {
      redistributor.stop();
    }
  }

  pub(crate) fn with_runtime<T>(
    &self,
    f: impl FnOnce(&lifecycle::PartitionRuntime) -> T,
  ) -> Result<T> {
    let runtime = self.runtime.lock();
    let runtime = runtime
      .as_ref()
      .ok_or(FlowlogError::PartitionNotAvailable(self.id))?;
    Ok(f(runtime))
  }
}
