//! Partition startup and shutdown.
//!
//! A partition comes up through a fixed list of steps and goes down through
//! the exact reverse list. A failure mid-startup unwinds the steps already
//! completed before the error is surfaced, so a half-started partition never
//! leaks locks, threads, or open files.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{bounded, select, Sender};
use fs2::FileExt;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::command::{KeyGenerator, LogEntry, RecordProcessor, SharedRecordProcessor};
use crate::constants::SNAPSHOTS_DIR_NAME;
use crate::distribution::{
  DistributionState, DistributionTransport, RecoveredDistributions, Redistributor,
};
use crate::error::{FlowlogError, Result};
use crate::limiter::RequestLimiter;
use crate::partition::context::PartitionExecutor;
use crate::partition::PartitionOptions;
use crate::replication::{ReplicationClient, ReplicationGroup, Role};
use crate::storage::{LogStorage, LogStorageOptions};
use crate::types::{key_counter, key_partition, PartitionId};

const PARTITION_LOCK_FILE_NAME: &str = ".partition.lock";
const RUNTIME_DIR_NAME: &str = "runtime";

/// The fixed startup order. Shutdown and unwind walk it in reverse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupStep {
  Metrics,
  Directory,
  SnapshotStore,
  Replication,
  Engine,
  TopologyNotification,
}

pub const STARTUP_ORDER: [StartupStep; 6] = [
  StartupStep::Metrics,
  StartupStep::Directory,
  StartupStep::SnapshotStore,
  StartupStep::Replication,
  StartupStep::Engine,
  StartupStep::TopologyNotification,
];

impl StartupStep {
  pub fn name(&self) -> &'static str {
    match self {
      StartupStep::Metrics => "metrics",
      StartupStep::Directory => "directory",
      StartupStep::SnapshotStore => "snapshot store",
      StartupStep::Replication => "replication",
      StartupStep::Engine => "engine",
      StartupStep::TopologyNotification => "topology notification",
    }
  }
}

/// Whether the partition is created fresh or joins an existing group. The
/// two modes differ only in the replication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartMode {
  Bootstrap,
  Join,
}

/// Reacts to role transitions of this partition's replication group.
pub type RoleCallback = Arc<dyn Fn(Role) + Send + Sync>;

// ============================================================================
// Snapshot store
// ============================================================================

/// Opaque store for engine snapshots inside the partition directory. The
/// engine above decides what a snapshot contains; this only tracks files.
#[derive(Debug)]
pub struct SnapshotStore {
  directory: PathBuf,
}

impl SnapshotStore {
  pub fn open(partition_directory: &Path) -> Result<Self> {
    let directory = partition_directory.join(SNAPSHOTS_DIR_NAME);
    fs::create_dir_all(&directory)?;
    Ok(Self { directory })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// Snapshot files sorted by name; names are chosen so lexicographic order
  /// is chronological order.
  pub fn list(&self) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(&self.directory)? {
      let path = entry?.path();
      if path.is_file() {
        files.push(path);
      }
    }
    files.sort();
    Ok(files)
  }

  pub fn latest(&self) -> Result<Option<PathBuf>> {
    Ok(self.list()?.pop())
  }

  /// Removes all but the newest `keep` snapshots. Returns the number of
  /// deleted files.
  pub fn prune(&self, keep: usize) -> Result<usize> {
    let files = self.list()?;
    if files.len() <= keep {
      return Ok(0);
    }
    let excess = files.len() - keep;
    for path in &files[..excess] {
      fs::remove_file(path)?;
    }
    Ok(excess)
  }
}

// ============================================================================
// Role watch
// ============================================================================

/// Background thread forwarding role transitions to the callback.
struct RoleWatch {
  stop: Sender<()>,
  handle: Option<JoinHandle<()>>,
}

impl RoleWatch {
  fn spawn(partition_id: PartitionId, group: &dyn ReplicationGroup, callback: RoleCallback) -> Self {
    let roles = group.role_changes();
    let (stop, stopped) = bounded::<()>(1);
    let handle = thread::spawn(move || loop {
      select! {
        recv(stopped) -> _ => break,
        recv(roles) -> role => match role {
          Ok(role) => {
            debug!(partition = partition_id, ?role, "role change observed");
            callback(role);
          }
          Err(_) => break,
        },
      }
    });
    Self {
      stop,
      handle: Some(handle),
    }
  }

  fn stop(&mut self) {
    if let Some(handle) = self.handle.take() {
      let _ = self.stop.send(());
      let _ = handle.join();
    }
  }
}

impl Drop for RoleWatch {
  fn drop(&mut self) {
    self.stop();
  }
}

// ============================================================================
// Runtime
// ============================================================================

/// Everything a started partition owns, built step by step.
pub struct PartitionRuntime {
  pub started_at: Instant,
  lock_file: File,
  pub snapshots: SnapshotStore,
  pub group: Arc<dyn ReplicationGroup>,
  pub executor: Arc<PartitionExecutor>,
  pub storage: Arc<Mutex<LogStorage>>,
  pub limiter: Arc<RequestLimiter>,
  pub keys: Arc<KeyGenerator>,
  pub distribution: Arc<DistributionState>,
  pub processor: SharedRecordProcessor,
  pub redistributor: Mutex<Option<Redistributor>>,
  role_watch: RoleWatch,
  callback: RoleCallback,
}

#[derive(Default)]
struct PartialRuntime {
  started_at: Option<Instant>,
  lock_file: Option<File>,
  snapshots: Option<SnapshotStore>,
  group: Option<Arc<dyn ReplicationGroup>>,
  executor: Option<Arc<PartitionExecutor>>,
  storage: Option<Arc<Mutex<LogStorage>>>,
  limiter: Option<Arc<RequestLimiter>>,
  keys: Option<Arc<KeyGenerator>>,
  distribution: Option<Arc<DistributionState>>,
  processor: Option<SharedRecordProcessor>,
  role_watch: Option<RoleWatch>,
}

/// Inputs the steps draw from.
pub struct StartContext {
  pub partition_id: PartitionId,
  pub directory: PathBuf,
  pub options: PartitionOptions,
  pub mode: StartMode,
  pub client: Arc<dyn ReplicationClient>,
  pub transport: Arc<dyn DistributionTransport>,
  pub processor: Mutex<Option<Box<dyn RecordProcessor>>>,
  pub callback: RoleCallback,
}

/// Runs the startup steps in order. On failure the completed steps are
/// closed in reverse and the step error is surfaced; a concurrent shutdown
/// request aborts between steps without counting as a fault.
pub fn run_startup(ctx: &StartContext, shutdown: &AtomicBool) -> Result<PartitionRuntime> {
  let mut partial = PartialRuntime::default();
  let mut completed: Vec<StartupStep> = Vec::new();

  for step in STARTUP_ORDER {
    if shutdown.load(Ordering::Relaxed) {
      info!(
        partition = ctx.partition_id,
        before = step.name(),
        "startup aborted, shutdown requested"
      );
      unwind(ctx, &mut partial, &completed);
      return Err(FlowlogError::ShutdownRequested);
    }

    debug!(partition = ctx.partition_id, step = step.name(), "startup step");
    if let Err(err) = open_step(step, ctx, &mut partial) {
      if shutdown.load(Ordering::Relaxed) {
        info!(
          partition = ctx.partition_id,
          step = step.name(),
          %err,
          "startup step failed while shutting down"
        );
        unwind(ctx, &mut partial, &completed);
        return Err(FlowlogError::ShutdownRequested);
      }
      error!(partition = ctx.partition_id, step = step.name(), %err, "startup step failed");
      unwind(ctx, &mut partial, &completed);
      return Err(FlowlogError::StartupStepFailed {
        step: step.name(),
        source: Box::new(err),
      });
    }
    completed.push(step);
  }

  info!(partition = ctx.partition_id, "partition started");
  Ok(PartitionRuntime {
    started_at: partial.started_at.take().unwrap_or_else(Instant::now),
    lock_file: partial.lock_file.take().expect("directory step completed"),
    snapshots: partial.snapshots.take().expect("snapshot step completed"),
    group: partial.group.take().expect("replication step completed"),
    executor: partial.executor.take().expect("engine step completed"),
    storage: partial.storage.take().expect("engine step completed"),
    limiter: partial.limiter.take().expect("engine step completed"),
    keys: partial.keys.take().expect("engine step completed"),
    distribution: partial.distribution.take().expect("engine step completed"),
    processor: partial.processor.take().expect("engine step completed"),
    redistributor: Mutex::new(None),
    role_watch: partial.role_watch.take().expect("topology step completed"),
    callback: Arc::clone(&ctx.callback),
  })
}

/// Closes a started partition in reverse step order. Close failures are
/// logged and the first one is returned after every step ran.
pub fn run_shutdown(partition_id: PartitionId, runtime: PartitionRuntime) -> Result<()> {
  let PartitionRuntime {
    lock_file,
    group: _group,
    executor,
    storage,
    redistributor,
    mut role_watch,
    callback,
    ..
  } = runtime;

  let mut first_error: Option<FlowlogError> = None;

  // Topology notification: unregister before anything below goes away.
  role_watch.stop();
  callback(Role::Inactive);

  // Engine: stop the resend loop, drain the writer, close the log.
  if let Some(mut redistributor) = redistributor.lock().take() {
    redistributor.stop();
  }
  if let Some(executor) = arc_into_inner_logged(partition_id, executor) {
    let mut executor = executor;
    executor.shutdown();
  }
  if let Err(err) = storage.lock().close() {
    warn!(partition = partition_id, %err, "closing log storage failed");
    first_error.get_or_insert(err);
  }

  // Replication: the group handle is dropped, membership is untouched.
  // Snapshot store: nothing to close.
  // Directory: release the partition lock.
  drop(lock_file);

  info!(partition = partition_id, "partition stopped");
  match first_error {
    None => Ok(()),
    Some(err) => Err(err),
  }
}

fn arc_into_inner_logged(
  partition_id: PartitionId,
  executor: Arc<PartitionExecutor>,
) -> Option<PartitionExecutor> {
  match Arc::into_inner(executor) {
    Some(executor) => Some(executor),
    None => {
      // A writer handle still points at the executor; its drop will join
      // the thread instead.
      warn!(partition = partition_id, "executor still shared at shutdown");
      None
    }
  }
}

fn open_step(step: StartupStep, ctx: &StartContext, partial: &mut PartialRuntime) -> Result<()> {
  match step {
    StartupStep::Metrics => {
      partial.started_at = Some(Instant::now());
      Ok(())
    }
    StartupStep::Directory => {
      fs::create_dir_all(&ctx.directory)?;
      let lock_path = ctx.directory.join(PARTITION_LOCK_FILE_NAME);
      let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(&lock_path)?;
      file.try_lock_exclusive().map_err(|_| {
        FlowlogError::Internal(format!(
          "partition directory is locked by another process: {}",
          ctx.directory.display()
        ))
      })?;
      partial.lock_file = Some(file);
      Ok(())
    }
    StartupStep::SnapshotStore => {
      partial.snapshots = Some(SnapshotStore::open(&ctx.directory)?);
      Ok(())
    }
    StartupStep::Replication => {
      let group = match ctx.mode {
        StartMode::Bootstrap => ctx.client.bootstrap(ctx.partition_id)?,
        StartMode::Join => ctx.client.join(ctx.partition_id)?,
      };
      partial.group = Some(group);
      Ok(())
    }
    StartupStep::Engine => {
      let mut storage = LogStorage::new(
        ctx.directory.join(RUNTIME_DIR_NAME),
        LogStorageOptions::new().segment_capacity(ctx.options.segment_capacity),
      );
      storage.open(true)?;

      // One pass over the retained log rebuilds everything volatile: the
      // key counter's high-water mark and the distribution bookkeeping.
      let mut recovered = RecoveredDistributions::default();
      let mut max_counter = 0u64;
      storage.for_each_block(|_, block| match LogEntry::decode(block) {
        Ok(entry) => {
          if key_partition(entry.key) == ctx.partition_id {
            max_counter = max_counter.max(key_counter(entry.key));
          }
          recovered.observe(ctx.partition_id, &entry);
        }
        Err(err) => {
          warn!(
            partition = ctx.partition_id,
            %err,
            "skipping undecodable log entry during recovery"
          );
        }
      })?;
      let storage = Arc::new(Mutex::new(storage));

      let processor = ctx
        .processor
        .lock()
        .take()
        .ok_or_else(|| FlowlogError::Internal("record processor already consumed".to_string()))?;

      let keys = Arc::new(KeyGenerator::with_counter(ctx.partition_id, max_counter + 1));
      partial.executor = Some(Arc::new(PartitionExecutor::spawn(format!(
        "partition-{}",
        ctx.partition_id
      ))));
      partial.limiter = Some(Arc::new(RequestLimiter::new(
        ctx.partition_id,
        ctx.options.request_limit,
      )));
      let distribution = Arc::new(DistributionState::new(
        ctx.partition_id,
        Arc::clone(&storage),
        Arc::clone(&keys),
        Arc::clone(&ctx.transport),
      ));
      distribution.restore(recovered)?;
      partial.distribution = Some(distribution);
      partial.keys = Some(keys);
      partial.storage = Some(storage);
      partial.processor = Some(Arc::new(Mutex::new(processor)));
      Ok(())
    }
    StartupStep::TopologyNotification => {
      let group = partial
        .group
        .as_ref()
        .ok_or_else(|| FlowlogError::Internal("replication step did not run".to_string()))?;
      // Apply the current role synchronously so a caller sees the partition
      // registered by the time startup returns; the watch picks up changes.
      (ctx.callback)(group.current_role());
      partial.role_watch = Some(RoleWatch::spawn(
        ctx.partition_id,
        group.as_ref(),
        Arc::clone(&ctx.callback),
      ));
      Ok(())
    }
  }
}

/// Closes completed steps in reverse order after a startup failure. Close
/// failures only warn; the startup error is the one worth surfacing.
fn unwind(ctx: &StartContext, partial: &mut PartialRuntime, completed: &[StartupStep]) {
  for step in completed.iter().rev() {
    debug!(partition = ctx.partition_id, step = step.name(), "unwinding startup step");
    match step {
      StartupStep::TopologyNotification => {
        if let Some(mut watch) = partial.role_watch.take() {
          watch.stop();
        }
        (ctx.callback)(Role::Inactive);
      }
      StartupStep::Engine => {
        if let Some(executor) = partial.executor.take() {
          if let Some(mut executor) = Arc::into_inner(executor) {
            executor.shutdown();
          }
        }
        if let Some(storage) = partial.storage.take() {
          if let Err(err) = storage.lock().close() {
            warn!(partition = ctx.partition_id, %err, "closing log storage during unwind failed");
          }
        }
        partial.distribution = None;
        partial.limiter = None;
        partial.keys = None;
        partial.processor = None;
      }
      StartupStep::Replication => {
        partial.group = None;
      }
      StartupStep::SnapshotStore => {
        partial.snapshots = None;
      }
      StartupStep::Directory => {
        partial.lock_file = None;
      }
      StartupStep::Metrics => {
        partial.started_at = None;
      }
    }
  }
}
