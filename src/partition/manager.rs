//! Node-level partition ownership.
//!
//! The manager is the root object of a broker node: it owns the partition
//! handles, the shared command api, the disk monitor, and the in-node
//! transport that routes distribution traffic between the partitions it
//! hosts. Partition-scoped state stays inside the partitions.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::command::{
  CommandApiService, CommandRequest, CommandResponse, DiskSpaceMonitor, RecordProcessor,
  SharedRecordProcessor,
};
use crate::distribution::DistributionTransport;
use crate::error::{FlowlogError, Result};
use crate::metrics::{BrokerMetricsSnapshot, PartitionMetricsSnapshot};
use crate::partition::context::Completion;
use crate::partition::lifecycle::RoleCallback;
use crate::partition::{Partition, PartitionOptions, StartMode};
use crate::replication::ReplicationClient;
use crate::types::{
  DistributionKey, Intent, NodeId, PartitionId, RequestId, ValueType,
};

type PartitionMap = Arc<Mutex<HashMap<PartitionId, Arc<Partition>>>>;

/// Routes distribution messages between partitions hosted on this node. A
/// partition that is unknown or not started has no route; senders retry.
pub struct NodeTransport {
  partitions: PartitionMap,
}

impl NodeTransport {
  fn route(
    &self,
    partition_id: PartitionId,
  ) -> Result<(
    Arc<crate::partition::context::PartitionExecutor>,
    Arc<crate::distribution::DistributionState>,
    SharedRecordProcessor,
  )> {
    let partition = self
      .partitions
      .lock()
      .get(&partition_id)
      .cloned()
      .ok_or(FlowlogError::PartitionNotAvailable(partition_id))?;
    partition
      .with_runtime(|runtime| {
        (
          Arc::clone(&runtime.executor),
          Arc::clone(&runtime.distribution),
          Arc::clone(&runtime.processor),
        )
      })
      .map_err(|_| FlowlogError::PartitionNotAvailable(partition_id))
  }
}

impl DistributionTransport for NodeTransport {
  fn send_distribute(
    &self,
    target: PartitionId,
    origin: PartitionId,
    key: DistributionKey,
    value_type: ValueType,
    intent: Intent,
    payload: &[u8],
  ) -> Result<()> {
    let (executor, distribution, processor) = self.route(target)?;
    let payload = payload.to_vec();
    executor
      .submit(move || {
        let mut processor = processor.lock();
        if let Err(err) =
          distribution.on_distribute(origin, key, value_type, intent, &payload, processor.as_mut())
        {
          error!(partition = target, distribution = key, %err, "applying distributed command failed");
        }
      })
      .map_err(|_| FlowlogError::PartitionNotAvailable(target))
  }

  fn send_acknowledge(
    &self,
    origin: PartitionId,
    target: PartitionId,
    key: DistributionKey,
  ) -> Result<()> {
    let (executor, distribution, _) = self.route(origin)?;
    executor
      .submit(move || {
        if let Err(err) = distribution.on_acknowledge(key, target) {
          error!(partition = origin, distribution = key, %err, "recording acknowledgement failed");
        }
      })
      .map_err(|_| FlowlogError::PartitionNotAvailable(origin))
  }
}

/// Owns every partition hosted on this node.
pub struct PartitionManager {
  node_id: NodeId,
  data_directory: PathBuf,
  options: PartitionOptions,
  client: Arc<dyn ReplicationClient>,
  disk: Arc<DiskSpaceMonitor>,
  command_api: Arc<CommandApiService>,
  transport: Arc<NodeTransport>,
  partitions: PartitionMap,
}

impl PartitionManager {
  pub fn new(
    node_id: NodeId,
    data_directory: impl Into<PathBuf>,
    options: PartitionOptions,
    client: Arc<dyn ReplicationClient>,
  ) -> Self {
    let partitions: PartitionMap = Arc::new(Mutex::new(HashMap::new()));
    let disk = Arc::new(DiskSpaceMonitor::new());
    Self {
      node_id,
      data_directory: data_directory.into(),
      options,
      client,
      command_api: Arc::new(CommandApiService::new(Arc::clone(&disk))),
      disk,
      transport: Arc::new(NodeTransport {
        partitions: Arc::clone(&partitions),
      }),
      partitions,
    }
  }

  pub fn node_id(&self) -> NodeId {
    self.node_id
  }

  pub fn disk_monitor(&self) -> Arc<DiskSpaceMonitor> {
    Arc::clone(&self.disk)
  }

  /// Creates a brand new partition on this node.
  pub fn bootstrap_partition(
    &self,
    partition_id: PartitionId,
    processor: Box<dyn RecordProcessor>,
  ) -> Result<()> {
    self.start_partition(partition_id, StartMode::Bootstrap, processor)
  }

  /// Joins the existing replication group of a partition.
  pub fn join_partition(
    &self,
    partition_id: PartitionId,
    processor: Box<dyn RecordProcessor>,
  ) -> Result<()> {
    self.start_partition(partition_id, StartMode::Join, processor)
  }

  fn start_partition(
    &self,
    partition_id: PartitionId,
    mode: StartMode,
    processor: Box<dyn RecordProcessor>,
  ) -> Result<()> {
    let partition = Arc::new(Partition::new(
      partition_id,
      self.partition_directory(partition_id),
      self.options.clone(),
    ));

    {
      let mut partitions = self.partitions.lock();
      if partitions.contains_key(&partition_id) {
        return Err(FlowlogError::PartitionExists(partition_id));
      }
      partitions.insert(partition_id, Arc::clone(&partition));
    }

    let callback = self.role_callback(&partition);
    let result = partition.start(
      mode,
      Arc::clone(&self.client),
      Arc::clone(&self.transport) as Arc<dyn DistributionTransport>,
      processor,
      callback,
    );
    if result.is_err() {
      self.partitions.lock().remove(&partition_id);
    }
    result
  }

  fn role_callback(&self, partition: &Arc<Partition>) -> RoleCallback {
    let weak = Arc::downgrade(partition);
    let command_api = Arc::clone(&self.command_api);
    Arc::new(move |role| {
      if let Some(partition) = weak.upgrade() {
        partition.apply_role(role, &command_api);
      }
    })
  }

  /// Stops a partition but keeps its data on disk.
  pub fn stop_partition(&self, partition_id: PartitionId) -> Result<()> {
    let partition = self.take_partition(partition_id)?;
    partition.stop()
  }

  /// Removes this node from the partition's group; on success the local
  /// data is deleted.
  pub fn leave_partition(&self, partition_id: PartitionId) -> Result<()> {
    let partition = self.take_partition(partition_id)?;
    let result = partition.leave();
    if result.is_err() {
      // Leaving failed before anything was torn down, keep serving.
      self.partitions.lock().insert(partition_id, partition);
    }
    result
  }

  pub fn reconfigure_priority(&self, partition_id: PartitionId, priority: u32) -> Result<()> {
    self.partition(partition_id)?.reconfigure_priority(priority)
  }

  /// Overwrites group membership; only for recovering from permanent quorum
  /// loss.
  pub fn force_reconfigure(&self, partition_id: PartitionId, members: &[NodeId]) -> Result<()> {
    self.partition(partition_id)?.force_reconfigure(members)
  }

  /// Entrance for client commands.
  pub fn handle_command(&self, request: CommandRequest) -> Result<Completion<CommandResponse>> {
    self.command_api.handle(request)
  }

  /// Adjusts a partition's admission limit; requests already in flight keep
  /// their slots.
  pub fn set_request_limit(&self, partition_id: PartitionId, limit: usize) -> Result<()> {
    let partition = self.partition(partition_id)?;
    let limiter = partition.with_runtime(|runtime| Arc::clone(&runtime.limiter))?;
    limiter.set_limit(limit);
    Ok(())
  }

  /// Called by the processing engine once a command's response went out,
  /// freeing the admission slot the command has held since `handle_command`.
  pub fn complete_request(&self, partition_id: PartitionId, request_id: RequestId) -> Result<()> {
    let partition = self.partition(partition_id)?;
    let limiter = partition.with_runtime(|runtime| Arc::clone(&runtime.limiter))?;
    limiter.on_response(request_id)
  }

  /// Starts distributing a committed command from `origin` to `targets`, or
  /// to every other hosted partition when no explicit targets are given.
  pub fn start_distribution(
    &self,
    origin: PartitionId,
    value_type: ValueType,
    intent: Intent,
    payload: Vec<u8>,
    targets: Option<BTreeSet<PartitionId>>,
  ) -> Result<DistributionKey> {
    let partition = self.partition(origin)?;
    let targets = match targets {
      Some(targets) => targets,
      None => self
        .partitions
        .lock()
        .keys()
        .copied()
        .filter(|id| *id != origin)
        .collect(),
    };

    let (executor, distribution) = partition
      .with_runtime(|runtime| (Arc::clone(&runtime.executor), Arc::clone(&runtime.distribution)))?;
    executor.call(move || distribution.start_distribution(value_type, intent, payload, targets))?
  }

  /// Side-effect-free snapshot of every hosted partition.
  pub fn collect_metrics(&self) -> BrokerMetricsSnapshot {
    let partitions: Vec<Arc<Partition>> = self.partitions.lock().values().cloned().collect();
    let mut snapshots: Vec<PartitionMetricsSnapshot> = partitions
      .iter()
      .map(|partition| {
        let runtime = partition
          .with_runtime(|runtime| crate::metrics::PartitionRuntimeMetrics {
            limiter: runtime.limiter.snapshot(),
            storage: runtime.storage.lock().status().ok(),
            distribution: runtime.distribution.snapshot(),
            uptime: runtime.started_at.elapsed(),
          })
          .ok();
        PartitionMetricsSnapshot {
          partition_id: partition.id(),
          status: partition.status(),
          runtime,
        }
      })
      .collect();
    snapshots.sort_by_key(|snapshot| snapshot.partition_id);

    BrokerMetricsSnapshot {
      node_id: self.node_id,
      disk_available: self.disk.is_available(),
      partitions: snapshots,
    }
  }

  /// Stops every partition. Errors are logged per partition; the first one
  /// is returned after all of them had their chance to stop.
  pub fn shutdown(&self) -> Result<()> {
    let partitions: Vec<Arc<Partition>> = {
      let mut map = self.partitions.lock();
      let all = map.values().cloned().collect();
      map.clear();
      all
    };

    for partition in &partitions {
      partition.request_shutdown();
    }

    let mut first_error = None;
    for partition in partitions {
      if let Err(err) = partition.stop() {
        warn!(partition = partition.id(), %err, "partition stop failed during shutdown");
        first_error.get_or_insert(err);
      }
    }

    info!(node = self.node_id, "partition manager shut down");
    match first_error {
      None => Ok(()),
      Some(err) => Err(err),
    }
  }

  pub fn partition_directory(&self, partition_id: PartitionId) -> PathBuf {
    self.data_directory.join(format!("partition-{partition_id}"))
  }

  fn partition(&self, partition_id: PartitionId) -> Result<Arc<Partition>> {
    self
      .partitions
      .lock()
      .get(&partition_id)
      .cloned()
      .ok_or(FlowlogError::UnknownPartition(partition_id))
  }

  fn take_partition(&self, partition_id: PartitionId) -> Result<Arc<Partition>> {
    self
      .partitions
      .lock()
      .remove(&partition_id)
      .ok_or(FlowlogError::UnknownPartition(partition_id))
  }
}
