use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use flowlog::command::{CommandRequest, CommandResponse, RecordProcessor};
use flowlog::command::{LogEntry, ProcessingOutcome};
use flowlog::metrics::render_metrics_prometheus;
use flowlog::replication::{LocalReplication, Role};
use flowlog::types::{key_partition, Intent, PartitionId, RequestId, ValueType};
use flowlog::{FlowlogError, PartitionManager, PartitionOptions, PartitionStatus};

struct NoopProcessor;

impl RecordProcessor for NoopProcessor {
  fn apply(&mut self, _entry: &LogEntry) -> ProcessingOutcome {
    ProcessingOutcome::Applied
  }
}

fn manager(dir: &Path, client: Arc<LocalReplication>) -> PartitionManager {
  PartitionManager::new(
    0,
    dir,
    PartitionOptions::new()
      .segment_capacity(16 * 1024)
      .request_limit(16)
      .redistribution_interval(Duration::from_millis(50)),
    client,
  )
}

fn command(partition_id: PartitionId, request_id: RequestId) -> CommandRequest {
  CommandRequest {
    partition_id,
    request_id,
    key: None,
    value_type: ValueType::Job.to_wire(),
    intent: Intent::Create.to_wire(),
    payload: b"job payload".to_vec(),
  }
}

fn handle(manager: &PartitionManager, request: CommandRequest) -> CommandResponse {
  manager
    .handle_command(request)
    .expect("submit command")
    .wait()
    .expect("await response")
}

/// Polls until `probe` passes or the deadline hits; role changes and
/// registration travel through background threads.
fn eventually(what: &str, mut probe: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !probe() {
    assert!(Instant::now() < deadline, "timed out waiting for: {what}");
    std::thread::sleep(Duration::from_millis(10));
  }
}

#[test]
fn bootstrapped_partition_accepts_commands_as_leader() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), Arc::clone(&client));

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");

  let response = handle(&manager, command(1, 1));
  let key = match response {
    CommandResponse::Accepted { key, .. } => key,
    other => panic!("unexpected response: {other:?}"),
  };
  assert_eq!(key_partition(key), 1);

  // The engine answers, freeing the admission slot.
  manager.complete_request(1, 1).expect("complete");
  manager.shutdown().expect("shutdown");
}

#[test]
fn duplicate_bootstrap_is_rejected() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");
  assert!(matches!(
    manager.bootstrap_partition(1, Box::new(NoopProcessor)),
    Err(FlowlogError::PartitionExists(1))
  ));
  manager.shutdown().expect("shutdown");
}

#[test]
fn stop_keeps_data_and_restart_appends_behind_it() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), Arc::clone(&client));

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");
  let (first_key, first_address) = match handle(&manager, command(1, 1)) {
    CommandResponse::Accepted { key, address } => (key, address),
    other => panic!("unexpected response: {other:?}"),
  };
  manager.stop_partition(1).expect("stop");
  assert!(manager.partition_directory(1).is_dir());

  // The group still exists, so a restart joins it.
  manager
    .join_partition(1, Box::new(NoopProcessor))
    .expect("rejoin");
  let (second_key, second_address) = match handle(&manager, command(1, 2)) {
    CommandResponse::Accepted { key, address } => (key, address),
    other => panic!("unexpected response: {other:?}"),
  };
  assert!(second_address > first_address, "restart must not rewind the log");
  assert!(
    second_key > first_key,
    "restart must not reuse keys of retained entries"
  );
  manager.shutdown().expect("shutdown");
}

#[test]
fn leave_deletes_the_partition_directory() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");
  assert!(manager.partition_directory(1).is_dir());

  manager.leave_partition(1).expect("leave");
  assert!(!manager.partition_directory(1).exists());
  assert_eq!(handle(&manager, command(1, 1)), CommandResponse::PartitionLeaderMismatch);
  assert!(matches!(
    manager.stop_partition(1),
    Err(FlowlogError::UnknownPartition(1))
  ));
}

#[test]
fn failed_startup_unwinds_and_frees_the_partition_slot() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  // Joining a partition whose group does not exist fails in the
  // replication step.
  let err = manager
    .join_partition(5, Box::new(NoopProcessor))
    .expect_err("join must fail");
  assert!(matches!(
    err,
    FlowlogError::StartupStepFailed {
      step: "replication",
      ..
    }
  ));

  // The unwind released everything: the same id can bootstrap.
  manager
    .bootstrap_partition(5, Box::new(NoopProcessor))
    .expect("bootstrap after failed join");
  assert!(matches!(
    handle(&manager, command(5, 1)),
    CommandResponse::Accepted { .. }
  ));
  manager.shutdown().expect("shutdown");
}

#[test]
fn losing_leadership_unregisters_the_partition() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), Arc::clone(&client));

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");
  assert!(matches!(
    handle(&manager, command(1, 1)),
    CommandResponse::Accepted { .. }
  ));

  client.group(1).expect("group").transition_to(Role::Follower);
  eventually("follower to reject commands", || {
    handle(&manager, command(1, 99)) == CommandResponse::PartitionLeaderMismatch
  });

  // Regaining leadership registers again.
  client
    .group(1)
    .expect("group")
    .transition_to(Role::Leader { term: 2 });
  eventually("leader to accept commands", || {
    matches!(handle(&manager, command(1, 100)), CommandResponse::Accepted { .. })
  });
  manager.shutdown().expect("shutdown");
}

#[test]
fn full_disk_rejects_commands_until_space_returns() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");

  manager.disk_monitor().set_available(false);
  assert_eq!(handle(&manager, command(1, 1)), CommandResponse::OutOfDiskSpace);

  manager.disk_monitor().set_available(true);
  assert!(matches!(
    handle(&manager, command(1, 2)),
    CommandResponse::Accepted { .. }
  ));
  manager.shutdown().expect("shutdown");
}

#[test]
fn metrics_snapshot_covers_hosted_partitions() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  manager
    .bootstrap_partition(1, Box::new(NoopProcessor))
    .expect("bootstrap");
  assert!(matches!(
    handle(&manager, command(1, 1)),
    CommandResponse::Accepted { .. }
  ));

  let snapshot = manager.collect_metrics();
  assert!(snapshot.disk_available);
  let partition = snapshot
    .partitions
    .iter()
    .find(|p| p.partition_id == 1)
    .expect("partition snapshot");
  assert!(matches!(partition.status, PartitionStatus::Started(Role::Leader { .. })));
  let runtime = partition.runtime.as_ref().expect("runtime metrics");
  assert_eq!(runtime.limiter.received, 1);
  assert_eq!(runtime.limiter.inflight, 1);

  let body = render_metrics_prometheus(&snapshot);
  assert!(body.contains(r#"flowlog_partition_state{node="0",partition="1",state="leader"} 1"#));
  manager.shutdown().expect("shutdown");
}

#[test]
fn shutdown_stops_every_partition() {
  let dir = tempfile::tempdir().expect("tempdir");
  let client = Arc::new(LocalReplication::new());
  let manager = manager(dir.path(), client);

  for id in [1, 2, 3] {
    manager
      .bootstrap_partition(id, Box::new(NoopProcessor))
      .expect("bootstrap");
  }
  manager.shutdown().expect("shutdown");

  for id in [1, 2, 3] {
    assert_eq!(handle(&manager, command(id, 1)), CommandResponse::PartitionLeaderMismatch);
    assert!(manager.partition_directory(id).is_dir(), "shutdown keeps data");
  }
}
