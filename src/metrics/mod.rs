//! Broker observability.
//!
//! Collection is pull-based and side-effect free: the manager assembles a
//! snapshot of every partition's counters, and the snapshot renders itself
//! into Prometheus exposition format for whatever endpoint serves it.

use std::time::Duration;

use crate::distribution::DistributionSnapshot;
use crate::limiter::LimiterSnapshot;
use crate::partition::PartitionStatus;
use crate::replication::Role;
use crate::storage::StorageStatus;
use crate::types::{NodeId, PartitionId};

/// Counters of a started partition.
#[derive(Debug, Clone)]
pub struct PartitionRuntimeMetrics {
  pub limiter: LimiterSnapshot,
  pub storage: Option<StorageStatus>,
  pub distribution: DistributionSnapshot,
  pub uptime: Duration,
}

/// One hosted partition; `runtime` is `None` while it is not started.
#[derive(Debug, Clone)]
pub struct PartitionMetricsSnapshot {
  pub partition_id: PartitionId,
  pub status: PartitionStatus,
  pub runtime: Option<PartitionRuntimeMetrics>,
}

/// Node-wide snapshot.
#[derive(Debug, Clone)]
pub struct BrokerMetricsSnapshot {
  pub node_id: NodeId,
  pub disk_available: bool,
  pub partitions: Vec<PartitionMetricsSnapshot>,
}

fn status_label(status: PartitionStatus) -> &'static str {
  match status {
    PartitionStatus::Bootstrapping => "bootstrapping",
    PartitionStatus::Joining => "joining",
    PartitionStatus::Started(Role::Leader { .. }) => "leader",
    PartitionStatus::Started(Role::Follower) => "follower",
    PartitionStatus::Started(Role::Inactive) => "inactive",
    PartitionStatus::Stopping => "stopping",
    PartitionStatus::Stopped => "stopped",
  }
}

/// Renders a snapshot in Prometheus exposition format.
pub fn render_metrics_prometheus(snapshot: &BrokerMetricsSnapshot) -> String {
  let mut lines = Vec::new();
  let node = snapshot.node_id.to_string();

  push_prometheus_help(
    &mut lines,
    "flowlog_disk_available",
    "gauge",
    "Whether the node accepts new commands (1 available, 0 exhausted).",
  );
  push_prometheus_sample(
    &mut lines,
    "flowlog_disk_available",
    i64::from(snapshot.disk_available),
    &[("node", &node)],
  );

  push_prometheus_help(
    &mut lines,
    "flowlog_partition_state",
    "gauge",
    "Lifecycle state of each hosted partition (always 1, state in the label).",
  );
  for partition in &snapshot.partitions {
    let id = partition.partition_id.to_string();
    push_prometheus_sample(
      &mut lines,
      "flowlog_partition_state",
      1,
      &[
        ("node", &node),
        ("partition", &id),
        ("state", status_label(partition.status)),
      ],
    );
  }

  push_counter_block(&mut lines, &node, snapshot, "flowlog_requests_received_total", "counter",
    "Commands offered to the partition since it started.",
    |runtime| Some(runtime.limiter.received as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_requests_dropped_total", "counter",
    "Commands rejected by admission control since the partition started.",
    |runtime| Some(runtime.limiter.dropped as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_requests_inflight", "gauge",
    "Admitted commands awaiting a response.",
    |runtime| Some(runtime.limiter.inflight as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_request_limit", "gauge",
    "Current admission limit of the partition.",
    |runtime| Some(runtime.limiter.limit as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_log_segments", "gauge",
    "Number of live segment files in the partition's log.",
    |runtime| runtime.storage.map(|storage| storage.segment_count as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_distributions_pending", "gauge",
    "Cross-partition distributions awaiting acknowledgements.",
    |runtime| Some(runtime.distribution.pending as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_distribution_retries_total", "counter",
    "Redistribution attempts since the partition started.",
    |runtime| Some(runtime.distribution.retries as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_distributions_finished_total", "counter",
    "Distributions acknowledged by every target.",
    |runtime| Some(runtime.distribution.finished as i64));
  push_counter_block(&mut lines, &node, snapshot, "flowlog_partition_uptime_seconds", "gauge",
    "Seconds since the partition finished its startup steps.",
    |runtime| Some(runtime.uptime.as_secs() as i64));

  let mut body = lines.join("\n");
  body.push('\n');
  body
}

fn push_counter_block(
  lines: &mut Vec<String>,
  node: &str,
  snapshot: &BrokerMetricsSnapshot,
  metric: &str,
  metric_type: &str,
  help: &str,
  value: impl Fn(&PartitionRuntimeMetrics) -> Option<i64>,
) {
  push_prometheus_help(lines, metric, metric_type, help);
  for partition in &snapshot.partitions {
    let Some(runtime) = partition.runtime.as_ref() else {
      continue;
    };
    let Some(sample) = value(runtime) else {
      continue;
    };
    let id = partition.partition_id.to_string();
    push_prometheus_sample(lines, metric, sample, &[("node", node), ("partition", &id)]);
  }
}

fn escape_prometheus_label_value(value: &str) -> String {
  value
    .replace('\\', "\\\\")
    .replace('"', "\\\"")
    .replace('\n', "\\n")
}

fn format_prometheus_labels(labels: &[(&str, &str)]) -> String {
  if labels.is_empty() {
    return String::new();
  }

  let rendered = labels
    .iter()
    .map(|(key, value)| format!("{key}=\"{}\"", escape_prometheus_label_value(value)))
    .collect::<Vec<_>>()
    .join(",");
  format!("{{{rendered}}}")
}

fn push_prometheus_help(lines: &mut Vec<String>, metric: &str, metric_type: &str, help: &str) {
  lines.push(format!("# HELP {metric} {help}"));
  lines.push(format!("# TYPE {metric} {metric_type}"));
}

fn push_prometheus_sample(lines: &mut Vec<String>, metric: &str, value: i64, labels: &[(&str, &str)]) {
  lines.push(format!("{metric}{} {value}", format_prometheus_labels(labels)));
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::log_address;

  fn snapshot() -> BrokerMetricsSnapshot {
    BrokerMetricsSnapshot {
      node_id: 0,
      disk_available: true,
      partitions: vec![
        PartitionMetricsSnapshot {
          partition_id: 1,
          status: PartitionStatus::Started(Role::Leader { term: 3 }),
          runtime: Some(PartitionRuntimeMetrics {
            limiter: LimiterSnapshot {
              limit: 1024,
              inflight: 2,
              received: 10,
              dropped: 1,
            },
            storage: Some(StorageStatus {
              segment_count: 2,
              first_segment_id: 1,
              current_segment_id: 2,
              next_address: log_address(2, 64),
            }),
            distribution: DistributionSnapshot {
              pending: 1,
              retries: 4,
              finished: 9,
            },
            uptime: Duration::from_secs(120),
          }),
        },
        PartitionMetricsSnapshot {
          partition_id: 2,
          status: PartitionStatus::Stopped,
          runtime: None,
        },
      ],
    }
  }

  #[test]
  fn renders_one_state_sample_per_partition() {
    let body = render_metrics_prometheus(&snapshot());
    assert!(body.contains(
      r#"flowlog_partition_state{node="0",partition="1",state="leader"} 1"#
    ));
    assert!(body.contains(
      r#"flowlog_partition_state{node="0",partition="2",state="stopped"} 1"#
    ));
  }

  #[test]
  fn stopped_partitions_emit_no_runtime_samples() {
    let body = render_metrics_prometheus(&snapshot());
    assert!(body.contains(r#"flowlog_requests_received_total{node="0",partition="1"} 10"#));
    assert!(!body.contains(r#"flowlog_requests_received_total{node="0",partition="2"}"#));
  }

  #[test]
  fn help_and_type_precede_samples() {
    let body = render_metrics_prometheus(&snapshot());
    let help = body.find("# HELP flowlog_requests_dropped_total").expect("help line");
    let sample = body.find(r#"flowlog_requests_dropped_total{node="0""#).expect("sample line");
    assert!(help < sample);
    assert!(body.contains("# TYPE flowlog_requests_dropped_total counter"));
  }

  #[test]
  fn label_values_are_escaped() {
    assert_eq!(
      format_prometheus_labels(&[("state", "a\"b\\c\nd")]),
      r#"{state="a\"b\\c\nd"}"#
    );
  }
}
