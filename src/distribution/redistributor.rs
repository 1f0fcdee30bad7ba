//! Periodic resend of unacknowledged distributions.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use tracing::debug;

use crate::constants::DEFAULT_REDISTRIBUTION_INTERVAL_MS;
use crate::distribution::DistributionState;

/// Configuration of the background resend loop.
#[derive(Debug, Clone, Copy)]
pub struct RedistributorConfig {
  /// Time between scans; also the minimum age before a pending
  /// distribution is resent for the first time.
  pub interval: Duration,
}

impl Default for RedistributorConfig {
  fn default() -> Self {
    Self {
      interval: Duration::from_millis(DEFAULT_REDISTRIBUTION_INTERVAL_MS),
    }
  }
}

/// Owns the resend thread of one partition. Started when the partition
/// becomes leader, stopped when leadership is lost or the partition shuts
/// down; dropping it joins the thread.
pub struct Redistributor {
  stop: Sender<()>,
  handle: Option<JoinHandle<()>>,
}

impl Redistributor {
  pub fn start(state: Arc<DistributionState>, config: RedistributorConfig) -> Self {
    let (stop, stopped) = bounded::<()>(1);
    let handle = thread::spawn(move || {
      let partition = state.partition_id();
      debug!(partition, "redistributor started");
      loop {
        match stopped.recv_timeout(config.interval) {
          Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
          Err(RecvTimeoutError::Timeout) => {
            let resent = state.retry_pending(config.interval);
            if resent > 0 {
              debug!(partition, resent, "resent pending distributions");
            }
          }
        }
      }
      debug!(partition, "redistributor stopped");
    });

    Self {
      stop,
      handle: Some(handle),
    }
  }

  /// Stops and joins the resend thread. Idempotent.
  pub fn stop(&mut self) {
    if let Some(handle) = self.handle.take() {
      let _ = self.stop.send(());
      let _ = handle.join();
    }
  }
}

impl Drop for Redistributor {
  fn drop(&mut self) {
    self.stop();
  }
}
