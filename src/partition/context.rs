//! Single-writer execution context.
//!
//! Every partition owns exactly one executor thread. All state mutations are
//! submitted to it as jobs, so partition state never needs more than the
//! coarse mutex around the service registry, and callers get a `Completion`
//! to wait on when they need the result.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use tracing::debug;

use crate::error::{FlowlogError, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
  Run(Job),
  Shutdown,
}

/// Write side of a one-shot result channel. Sending consumes the sender, so
/// a completion is fulfilled at most once by construction.
#[derive(Debug)]
pub struct CompletionSender<T> {
  tx: Sender<T>,
}

impl<T> CompletionSender<T> {
  /// Delivers the result. Dropped silently if the waiter gave up.
  pub fn complete(self, value: T) {
    let _ = self.tx.send(value);
  }
}

/// Read side of a one-shot result channel.
#[derive(Debug)]
pub struct Completion<T> {
  rx: Receiver<T>,
}

impl<T> Completion<T> {
  /// Blocks until the result arrives. A disconnected sender means the
  /// executing side dropped the job without completing it.
  pub fn wait(self) -> Result<T> {
    self.rx.recv().map_err(|_| FlowlogError::ContextGone)
  }
}

/// Creates a linked one-shot pair.
pub fn completion<T>() -> (CompletionSender<T>, Completion<T>) {
  let (tx, rx) = bounded(1);
  (CompletionSender { tx }, Completion { rx })
}

/// A dedicated thread draining a job queue in submission order.
#[derive(Debug)]
pub struct PartitionExecutor {
  name: String,
  tx: Sender<Message>,
  handle: Option<JoinHandle<()>>,
}

impl PartitionExecutor {
  pub fn spawn(name: impl Into<String>) -> Self {
    let name = name.into();
    let (tx, rx) = unbounded::<Message>();

    let thread_name = name.clone();
    let handle = thread::spawn(move || run_loop(&thread_name, rx));

    Self {
      name,
      tx,
      handle: Some(handle),
    }
  }

  /// Enqueues a fire-and-forget job.
  pub fn submit<F>(&self, job: F) -> Result<()>
  where
    F: FnOnce() + Send + 'static,
  {
    self
      .tx
      .send(Message::Run(Box::new(job)))
      .map_err(|_| FlowlogError::ContextGone)
  }

  /// Enqueues a job and blocks the caller until it produced a result.
  pub fn call<F, T>(&self, job: F) -> Result<T>
  where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
  {
    let (done, wait) = completion();
    self.submit(move || done.complete(job()))?;
    wait.wait()
  }

  /// Stops the executor after draining jobs already queued. Idempotent.
  pub fn shutdown(&mut self) {
    if let Some(handle) = self.handle.take() {
      let _ = self.tx.send(Message::Shutdown);
      let _ = handle.join();
      debug!(executor = %self.name, "executor stopped");
    }
  }
}

impl Drop for PartitionExecutor {
  fn drop(&mut self) {
    self.shutdown();
  }
}

fn run_loop(name: &str, rx: Receiver<Message>) {
  debug!(executor = name, "executor started");
  while let Ok(message) = rx.recv() {
    match message {
      Message::Run(job) => job(),
      Message::Shutdown => break,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::sync::Arc;

  #[test]
  fn jobs_run_in_submission_order() {
    let executor = PartitionExecutor::spawn("test-order");
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for i in 0..16 {
      let seen = Arc::clone(&seen);
      executor.submit(move || seen.lock().push(i)).expect("submit");
    }

    // A call drains behind everything already queued.
    executor.call(|| ()).expect("drain");
    assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
  }

  #[test]
  fn call_returns_the_job_result() {
    let executor = PartitionExecutor::spawn("test-call");
    let value = executor.call(|| 6 * 7).expect("call");
    assert_eq!(value, 42);
  }

  #[test]
  fn shutdown_drains_queued_jobs() {
    let mut executor = PartitionExecutor::spawn("test-shutdown");
    let counter = Arc::new(AtomicU32::new(0));

    for _ in 0..8 {
      let counter = Arc::clone(&counter);
      executor
        .submit(move || {
          counter.fetch_add(1, Ordering::SeqCst);
        })
        .expect("submit");
    }

    executor.shutdown();
    assert_eq!(counter.load(Ordering::SeqCst), 8);
    assert!(matches!(
      executor.submit(|| ()),
      Err(FlowlogError::ContextGone)
    ));
  }

  #[test]
  fn dropped_job_reports_context_gone() {
    let (done, wait) = completion::<u32>();
    drop(done);
    assert!(matches!(wait.wait(), Err(FlowlogError::ContextGone)));
  }
}
