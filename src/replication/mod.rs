//! Replication seam.
//!
//! The engine treats consensus as a black box behind two traits: a client
//! that creates or joins replication groups, and the group handle itself,
//! which reports role changes and carries membership operations. The
//! in-process `LocalReplication` implementation backs single-node
//! deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::info;

use crate::error::{FlowlogError, Result};
use crate::types::{NodeId, PartitionId};

/// Role of this node within one partition's replication group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  /// Accepts commands; `term` rises with every new election.
  Leader { term: u64 },
  Follower,
  Inactive,
}

impl Role {
  pub fn is_leader(&self) -> bool {
    matches!(self, Role::Leader { .. })
  }
}

/// Handle on a joined replication group.
pub trait ReplicationGroup: Send + Sync {
  /// Stream of role transitions, starting with the initial role.
  fn role_changes(&self) -> Receiver<Role>;

  fn current_role(&self) -> Role;

  /// Removes this node from the group's membership.
  fn leave(&self) -> Result<()>;

  /// Adjusts this node's election priority within the group.
  fn reconfigure_priority(&self, priority: u32) -> Result<()>;

  /// Overwrites the group's membership with exactly the given nodes. Only
  /// for disaster recovery when a quorum is permanently lost.
  fn force_reconfigure(&self, members: &[NodeId]) -> Result<()>;
}

/// Entry point into the consensus layer.
pub trait ReplicationClient: Send + Sync {
  /// Creates the replication group for a brand new partition.
  fn bootstrap(&self, partition_id: PartitionId) -> Result<Arc<dyn ReplicationGroup>>;

  /// Joins the already existing replication group of a partition.
  fn join(&self, partition_id: PartitionId) -> Result<Arc<dyn ReplicationGroup>>;
}

// ============================================================================
// In-process implementation
// ============================================================================

struct LocalGroupState {
  role: Role,
  subscribers: Vec<Sender<Role>>,
  left: bool,
}

/// A single-member group that elects itself leader immediately.
pub struct LocalGroup {
  partition_id: PartitionId,
  state: Mutex<LocalGroupState>,
}

impl LocalGroup {
  fn new(partition_id: PartitionId, initial: Role) -> Self {
    Self {
      partition_id,
      state: Mutex::new(LocalGroupState {
        role: initial,
        subscribers: Vec::new(),
        left: false,
      }),
    }
  }

  /// Forces a role transition; tests use this to simulate elections.
  pub fn transition_to(&self, role: Role) {
    let mut state = self.state.lock();
    state.role = role;
    state.subscribers.retain(|tx| tx.send(role).is_ok());
    info!(partition = self.partition_id, ?role, "role transition");
  }
}

impl ReplicationGroup for LocalGroup {
  fn role_changes(&self) -> Receiver<Role> {
    let (tx, rx) = unbounded();
    let mut state = self.state.lock();
    let _ = tx.send(state.role);
    state.subscribers.push(tx);
    rx
  }

  fn current_role(&self) -> Role {
    self.state.lock().role
  }

  fn leave(&self) -> Result<()> {
    let mut state = self.state.lock();
    if state.left {
      return Err(FlowlogError::Replication(format!(
        "already left the group of partition {}",
        self.partition_id
      )));
    }
    state.left = true;
    state.role = Role::Inactive;
    state.subscribers.retain(|tx| tx.send(Role::Inactive).is_ok());
    Ok(())
  }

  fn reconfigure_priority(&self, _priority: u32) -> Result<()> {
    // A single-member group has nothing to rebalance.
    Ok(())
  }

  fn force_reconfigure(&self, members: &[NodeId]) -> Result<()> {
    if members.is_empty() {
      return Err(FlowlogError::Replication(
        "cannot reconfigure to an empty membership".to_string(),
      ));
    }
    Ok(())
  }
}

/// In-process replication client. Every bootstrapped partition becomes
/// leader on the local node right away; `join` requires the group to exist.
#[derive(Default)]
pub struct LocalReplication {
  groups: Mutex<HashMap<PartitionId, Arc<LocalGroup>>>,
}

impl LocalReplication {
  pub fn new() -> Self {
    Self::default()
  }

  /// Direct handle for tests that drive role transitions.
  pub fn group(&self, partition_id: PartitionId) -> Option<Arc<LocalGroup>> {
    self.groups.lock().get(&partition_id).cloned()
  }
}

impl ReplicationClient for LocalReplication {
  fn bootstrap(&self, partition_id: PartitionId) -> Result<Arc<dyn ReplicationGroup>> {
    let mut groups = self.groups.lock();
    if groups.contains_key(&partition_id) {
      return Err(FlowlogError::Replication(format!(
        "group for partition {partition_id} already exists"
      )));
    }
    let group = Arc::new(LocalGroup::new(partition_id, Role::Leader { term: 1 }));
    groups.insert(partition_id, Arc::clone(&group));
    Ok(group)
  }

  fn join(&self, partition_id: PartitionId) -> Result<Arc<dyn ReplicationGroup>> {
    let groups = self.groups.lock();
    match groups.get(&partition_id) {
      Some(group) => Ok(Arc::clone(group) as Arc<dyn ReplicationGroup>),
      None => Err(FlowlogError::Replication(format!(
        "no group to join for partition {partition_id}"
      ))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bootstrap_elects_the_local_node() {
    let client = LocalReplication::new();
    let group = client.bootstrap(1).expect("bootstrap");

    assert!(group.current_role().is_leader());
    let changes = group.role_changes();
    assert_eq!(changes.recv().expect("initial role"), Role::Leader { term: 1 });
  }

  #[test]
  fn bootstrap_twice_fails() {
    let client = LocalReplication::new();
    client.bootstrap(1).expect("bootstrap");
    assert!(client.bootstrap(1).is_err());
  }

  #[test]
  fn join_requires_an_existing_group() {
    let client = LocalReplication::new();
    assert!(client.join(9).is_err());

    client.bootstrap(9).expect("bootstrap");
    let group = client.join(9).expect("join");
    assert!(group.current_role().is_leader());
  }

  #[test]
  fn role_transitions_reach_subscribers() {
    let client = LocalReplication::new();
    client.bootstrap(2).expect("bootstrap");
    let group = client.group(2).expect("group");

    let changes = group.role_changes();
    assert!(changes.recv().expect("initial").is_leader());

    group.transition_to(Role::Follower);
    assert_eq!(changes.recv().expect("transition"), Role::Follower);
  }

  #[test]
  fn leaving_is_terminal() {
    let client = LocalReplication::new();
    client.bootstrap(3).expect("bootstrap");
    let group = client.group(3).expect("group");

    group.leave().expect("leave");
    assert_eq!(group.current_role(), Role::Inactive);
    assert!(group.leave().is_err());
  }
}
