//! Segmented append-only log storage.
//!
//! A `LogStorage` owns an ordered collection of fixed-capacity segments in
//! one directory, appends to the newest segment, rolls over to a new segment
//! when the current one fills up, and repairs torn trailing appends on open.
//! It knows nothing about partitions or replication.

pub mod segment;

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::{debug, info};

use crate::constants::{
  BLOCK_LENGTH_PREFIX_SIZE, DEFAULT_SEGMENT_CAPACITY, INITIAL_SEGMENT_ID, SEGMENT_FILE_EXTENSION,
  SEGMENT_HEADER_SIZE, STORAGE_LOCK_FILE_NAME,
};
use crate::error::{FlowlogError, Result};
use crate::types::{address_offset, address_segment_id, log_address, LogAddress};

pub use segment::{ReadOutcome, Segment};

// ============================================================================
// Options
// ============================================================================

/// Options for a segmented log.
#[derive(Debug, Clone)]
pub struct LogStorageOptions {
  /// Total byte budget of each segment file, header included.
  pub segment_capacity: u32,
  /// Delete the whole log directory on close.
  pub delete_on_close: bool,
}

impl Default for LogStorageOptions {
  fn default() -> Self {
    Self {
      segment_capacity: DEFAULT_SEGMENT_CAPACITY,
      delete_on_close: false,
    }
  }
}

impl LogStorageOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn segment_capacity(mut self, value: u32) -> Self {
    self.segment_capacity = value;
    self
  }

  pub fn delete_on_close(mut self, value: bool) -> Self {
    self.delete_on_close = value;
    self
  }
}

/// Point-in-time storage counters for observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStatus {
  pub segment_count: usize,
  pub first_segment_id: u32,
  pub current_segment_id: u32,
  /// Address the next append will return.
  pub next_address: LogAddress,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StorageState {
  Closed,
  Opened,
}

// ============================================================================
// LogStorage
// ============================================================================

/// Byte-addressable append-only storage split into fixed-capacity segments.
#[derive(Debug)]
pub struct LogStorage {
  directory: PathBuf,
  options: LogStorageOptions,
  state: StorageState,
  /// Ordered by id; the last entry is the appendable segment.
  segments: Vec<Segment>,
  lock_file: Option<File>,
}

impl LogStorage {
  /// Creates a closed storage rooted at `directory`. No file is touched
  /// until `open` is called.
  pub fn new(directory: impl AsRef<Path>, options: LogStorageOptions) -> Self {
    Self {
      directory: directory.as_ref().to_path_buf(),
      options,
      state: StorageState::Closed,
      segments: Vec::new(),
      lock_file: None,
    }
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// Opens the log. With `create_new`, a missing directory is created and an
  /// initial segment allocated. Without it, a missing log returns
  /// `Ok(false)` with no side effects.
  ///
  /// Every restored segment is consistency-checked: a trailing segment with
  /// a torn append is repaired by truncation; an inconsistent non-trailing
  /// segment makes the log unrecoverably corrupt.
  pub fn open(&mut self, create_new: bool) -> Result<bool> {
    if self.state == StorageState::Opened {
      return Err(FlowlogError::StorageAlreadyOpen);
    }

    let existing = self.list_segment_files()?;
    if existing.is_empty() && !create_new {
      return Ok(false);
    }

    fs::create_dir_all(&self.directory)?;
    self.lock_file = Some(acquire_directory_lock(&self.directory)?);

    let restored = if existing.is_empty() {
      let path = self.segment_path(INITIAL_SEGMENT_ID);
      Segment::allocate(path, INITIAL_SEGMENT_ID, self.options.segment_capacity)
        .map(|segment| vec![segment])
    } else {
      self.restore_segments(existing)
    };
    match restored {
      Ok(segments) => self.segments = segments,
      Err(err) => {
        // A failed open leaves the directory unlocked for the next attempt.
        self.lock_file = None;
        return Err(err);
      }
    }

    self.state = StorageState::Opened;
    Ok(true)
  }

  /// Appends one block and returns its address. Rolls over to a freshly
  /// allocated segment when the current one is out of capacity; a block that
  /// can never fit a whole segment is a hard error.
  pub fn append(&mut self, block: &[u8]) -> Result<LogAddress> {
    self.ensure_opened()?;

    let usable = self.options.segment_capacity as u64
      - SEGMENT_HEADER_SIZE as u64
      - BLOCK_LENGTH_PREFIX_SIZE as u64;
    if block.len() as u64 > usable {
      return Err(FlowlogError::BlockTooLarge {
        block_len: block.len(),
        capacity: self.options.segment_capacity,
      });
    }

    let current = self.current_segment_mut();
    match current.append(block) {
      Ok(offset) => {
        let id = current.id();
        Ok(log_address(id, offset))
      }
      Err(FlowlogError::InsufficientCapacity) => {
        self.roll_over()?;
        let current = self.current_segment_mut();
        let offset = current.append(block)?;
        let id = current.id();
        Ok(log_address(id, offset))
      }
      Err(other) => Err(other),
    }
  }

  /// Reads the block at `address` into `buf`.
  pub fn read(&mut self, buf: &mut [u8], address: LogAddress) -> Result<ReadOutcome> {
    self.ensure_opened()?;

    let segment_id = address_segment_id(address);
    let index = self
      .segment_index(segment_id)
      .ok_or(FlowlogError::InvalidAddress { address })?;
    self.segments[index].read_block(buf, address_offset(address))
  }

  /// Removes every segment fully superseded by `address`: all segments with
  /// an id strictly below the segment containing the address. The appendable
  /// segment and the segment holding the lowest retained address survive,
  /// and an address beyond the newest segment clamps to a no-op. Idempotent.
  /// Returns the number of deleted segments.
  pub fn delete(&mut self, address: LogAddress) -> Result<usize> {
    self.ensure_opened()?;

    let segment_id = address_segment_id(address);
    let last_id = self.current_segment().id();
    if segment_id > last_id {
      debug!(segment_id, last_id, "delete address beyond newest segment, clamping to no-op");
      return Ok(0);
    }

    let mut pruned = 0;
    while self.segments.len() > 1 && self.segments[0].id() < segment_id {
      let segment = self.segments.remove(0);
      let id = segment.id();
      segment.delete()?;
      debug!(segment = id, "deleted superseded segment");
      pruned += 1;
    }

    Ok(pruned)
  }

  /// Visits every block, oldest segment first, in append order. Used to
  /// rebuild in-memory state on startup.
  pub fn for_each_block(&mut self, mut f: impl FnMut(LogAddress, &[u8])) -> Result<()> {
    self.ensure_opened()?;

    let mut buf = vec![0u8; self.options.segment_capacity as usize];
    for segment in &mut self.segments {
      let id = segment.id();
      let mut offset = SEGMENT_HEADER_SIZE;
      loop {
        match segment.read_block(&mut buf, offset)? {
          ReadOutcome::Block(len) => {
            f(log_address(id, offset), &buf[..len]);
            offset += BLOCK_LENGTH_PREFIX_SIZE + len as u32;
          }
          ReadOutcome::NoData | ReadOutcome::EndOfSegment => break,
        }
      }
    }
    Ok(())
  }

  /// Fsyncs the appendable segment.
  pub fn flush(&mut self) -> Result<()> {
    self.ensure_opened()?;
    self.current_segment_mut().flush()
  }

  /// Flushes and closes the log; with `delete_on_close` the whole directory
  /// is removed afterwards.
  pub fn close(&mut self) -> Result<()> {
    if self.state != StorageState::Opened {
      return Err(FlowlogError::StorageNotOpen);
    }

    for segment in &mut self.segments {
      segment.flush()?;
    }
    self.segments.clear();
    self.lock_file = None;
    self.state = StorageState::Closed;

    if self.options.delete_on_close {
      fs::remove_dir_all(&self.directory)?;
    }
    Ok(())
  }

  pub fn is_open(&self) -> bool {
    self.state == StorageState::Opened
  }

  pub fn status(&self) -> Result<StorageStatus> {
    self.ensure_opened()?;
    let current = self.current_segment();
    Ok(StorageStatus {
      segment_count: self.segments.len(),
      first_segment_id: self.segments[0].id(),
      current_segment_id: current.id(),
      next_address: log_address(current.id(), current.size()),
    })
  }

  // --------------------------------------------------------------------------
  // internals
  // --------------------------------------------------------------------------

  fn ensure_opened(&self) -> Result<()> {
    if self.state != StorageState::Opened {
      return Err(FlowlogError::StorageNotOpen);
    }
    Ok(())
  }

  fn current_segment(&self) -> &Segment {
    self
      .segments
      .last()
      .expect("an opened log always has a segment")
  }

  fn current_segment_mut(&mut self) -> &mut Segment {
    self
      .segments
      .last_mut()
      .expect("an opened log always has a segment")
  }

  fn segment_index(&self, segment_id: u32) -> Option<usize> {
    self
      .segments
      .binary_search_by_key(&segment_id, Segment::id)
      .ok()
  }

  fn segment_path(&self, id: u32) -> PathBuf {
    self
      .directory
      .join(format!("{id:06}.{SEGMENT_FILE_EXTENSION}"))
  }

  fn roll_over(&mut self) -> Result<()> {
    let next_id = {
      let current = self.current_segment_mut();
      current.mark_filled()?;
      current.id() + 1
    };

    let path = self.segment_path(next_id);
    let segment = Segment::allocate(path, next_id, self.options.segment_capacity)?;
    debug!(segment = next_id, "rolled over to new segment");
    self.segments.push(segment);
    Ok(())
  }

  fn list_segment_files(&self) -> Result<Vec<PathBuf>> {
    if !self.directory.is_dir() {
      return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in fs::read_dir(&self.directory)? {
      let path = entry?.path();
      let is_segment = path
        .extension()
        .map(|ext| ext == SEGMENT_FILE_EXTENSION)
        .unwrap_or(false);
      if is_segment {
        files.push(path);
      }
    }
    files.sort();
    Ok(files)
  }

  fn restore_segments(&self, files: Vec<PathBuf>) -> Result<Vec<Segment>> {
    let mut segments = Vec::with_capacity(files.len());
    for path in files {
      segments.push(Segment::open(path)?);
    }
    segments.sort_by_key(Segment::id);

    for window in segments.windows(2) {
      if window[1].id() != window[0].id() + 1 {
        return Err(FlowlogError::CorruptSegment {
          path: self.directory.clone(),
          reason: format!(
            "segment ids are not sequential: {} is followed by {}",
            window[0].id(),
            window[1].id()
          ),
        });
      }
    }

    let last_index = segments.len() - 1;
    for (index, segment) in segments.iter_mut().enumerate() {
      if segment.is_truncated_below_commit()? {
        return Err(FlowlogError::CorruptSegment {
          path: segment.path().to_path_buf(),
          reason: "file is shorter than the committed size".to_string(),
        });
      }

      if segment.is_consistent()? {
        continue;
      }

      if index == last_index {
        segment.truncate_uncommitted()?;
        info!(
          segment = segment.id(),
          "discarded uncommitted bytes from trailing segment"
        );
      } else {
        return Err(FlowlogError::CorruptSegment {
          path: segment.path().to_path_buf(),
          reason: "non-trailing segment size does not match its committed size".to_string(),
        });
      }
    }

    Ok(segments)
  }
}

fn acquire_directory_lock(directory: &Path) -> Result<File> {
  let lock_path = directory.join(STORAGE_LOCK_FILE_NAME);
  let file = OpenOptions::new()
    .create(true)
    .truncate(false)
    .read(true)
    .write(true)
    .open(&lock_path)?;
  file.try_lock_exclusive().map_err(|_| {
    FlowlogError::Internal(format!(
      "log directory is locked by another writer: {}",
      directory.display()
    ))
  })?;
  Ok(file)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_log(dir: &Path, capacity: u32) -> LogStorage {
    let mut log = LogStorage::new(dir, LogStorageOptions::new().segment_capacity(capacity));
    assert!(log.open(true).expect("open"));
    log
  }

  #[test]
  fn open_without_create_and_without_files_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let missing = dir.path().join("log");

    let mut log = LogStorage::new(&missing, LogStorageOptions::new());
    assert!(!log.open(false).expect("open"));
    assert!(!missing.exists());
    assert!(matches!(
      log.append(b"x"),
      Err(FlowlogError::StorageNotOpen)
    ));
  }

  #[test]
  fn operations_are_rejected_while_closed() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = LogStorage::new(dir.path().join("log"), LogStorageOptions::new());

    let mut buf = [0u8; 8];
    assert!(matches!(
      log.append(b"x"),
      Err(FlowlogError::StorageNotOpen)
    ));
    assert!(matches!(
      log.read(&mut buf, log_address(1, SEGMENT_HEADER_SIZE)),
      Err(FlowlogError::StorageNotOpen)
    ));
    assert!(matches!(log.delete(0), Err(FlowlogError::StorageNotOpen)));
    assert!(matches!(log.close(), Err(FlowlogError::StorageNotOpen)));
  }

  #[test]
  fn append_and_read_roundtrip_across_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");

    let mut log = open_log(&log_dir, 16 * 1024);
    let first = log.append(b"one").expect("append");
    let second = log.append(b"two-and-more").expect("append");
    log.close().expect("close");

    let mut log = LogStorage::new(
      &log_dir,
      LogStorageOptions::new().segment_capacity(16 * 1024),
    );
    assert!(log.open(false).expect("reopen"));

    let mut buf = [0u8; 64];
    assert_eq!(
      log.read(&mut buf, first).expect("read"),
      ReadOutcome::Block(3)
    );
    assert_eq!(&buf[..3], b"one");
    assert_eq!(
      log.read(&mut buf, second).expect("read"),
      ReadOutcome::Block(12)
    );
    assert_eq!(&buf[..12], b"two-and-more");
  }

  #[test]
  fn first_append_lands_right_after_the_header() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = open_log(&dir.path().join("log"), 16 * 1024);

    let address = log.append(b"test").expect("append");
    assert_eq!(address_segment_id(address), INITIAL_SEGMENT_ID);
    assert_eq!(address_offset(address), SEGMENT_HEADER_SIZE);
  }

  #[test]
  fn oversized_block_triggers_rollover_on_next_append() {
    let dir = tempfile::tempdir().expect("tempdir");
    let capacity = 16 * 1024;
    let mut log = open_log(&dir.path().join("log"), capacity);

    log.append(b"test").expect("append");

    // Fits a fresh segment but not the remaining space of the first.
    let big = vec![1u8; (capacity - SEGMENT_HEADER_SIZE - BLOCK_LENGTH_PREFIX_SIZE) as usize];
    let address = log.append(&big).expect("append with rollover");
    assert_eq!(address_segment_id(address), INITIAL_SEGMENT_ID + 1);
    assert_eq!(address_offset(address), SEGMENT_HEADER_SIZE);

    let status = log.status().expect("status");
    assert_eq!(status.segment_count, 2);
  }

  #[test]
  fn block_larger_than_a_segment_is_a_hard_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut log = open_log(&dir.path().join("log"), 1024);

    let block = vec![0u8; 2048];
    assert!(matches!(
      log.append(&block),
      Err(FlowlogError::BlockTooLarge { .. })
    ));
    assert_eq!(log.status().expect("status").segment_count, 1);
  }

  #[test]
  fn delete_is_monotonic_and_spares_the_current_segment() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Small capacity so every append rolls into a new segment.
    let capacity = SEGMENT_HEADER_SIZE + BLOCK_LENGTH_PREFIX_SIZE + 64;
    let mut log = open_log(&dir.path().join("log"), capacity);

    let block = [9u8; 64];
    let mut addresses = Vec::new();
    for _ in 0..4 {
      addresses.push(log.append(&block).expect("append"));
    }
    assert_eq!(log.status().expect("status").segment_count, 4);

    let pruned = log.delete(addresses[2]).expect("delete");
    assert_eq!(pruned, 2);
    assert_eq!(log.status().expect("status").first_segment_id, 3);

    // Same or lower address: nothing further happens.
    assert_eq!(log.delete(addresses[2]).expect("delete"), 0);
    assert_eq!(log.delete(addresses[0]).expect("delete"), 0);
    assert_eq!(log.status().expect("status").segment_count, 2);

    // Beyond the newest segment: clamped no-op, current segment survives.
    let beyond = log_address(100, SEGMENT_HEADER_SIZE);
    assert_eq!(log.delete(beyond).expect("delete"), 0);
    let status = log.status().expect("status");
    assert_eq!(status.segment_count, 2);
    assert_eq!(status.current_segment_id, 4);
  }

  #[test]
  fn trailing_torn_append_is_repaired_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");

    let mut log = open_log(&log_dir, 16 * 1024);
    log.append(b"durable").expect("append");
    let committed = address_offset(log.status().expect("status").next_address);
    log.close().expect("close");

    let segment_path = log_dir.join("000001.seg");
    let mut file = OpenOptions::new()
      .append(true)
      .open(&segment_path)
      .expect("open segment");
    std::io::Write::write_all(&mut file, b"torn tail").expect("write");
    file.sync_all().expect("sync");
    drop(file);

    let mut log = LogStorage::new(
      &log_dir,
      LogStorageOptions::new().segment_capacity(16 * 1024),
    );
    assert!(log.open(false).expect("open repairs"));
    assert_eq!(
      fs::metadata(&segment_path).expect("metadata").len(),
      committed as u64
    );
    log.close().expect("close");

    // Opening again is a no-op repair.
    let mut log = LogStorage::new(
      &log_dir,
      LogStorageOptions::new().segment_capacity(16 * 1024),
    );
    assert!(log.open(false).expect("open"));
    assert_eq!(
      fs::metadata(&segment_path).expect("metadata").len(),
      committed as u64
    );
  }

  #[test]
  fn non_trailing_inconsistency_is_fatal() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");
    let capacity = SEGMENT_HEADER_SIZE + BLOCK_LENGTH_PREFIX_SIZE + 32;

    let mut log = open_log(&log_dir, capacity);
    let block = [1u8; 32];
    log.append(&block).expect("append");
    log.append(&block).expect("append rolls over");
    log.close().expect("close");

    let first_segment = log_dir.join("000001.seg");
    let mut file = OpenOptions::new()
      .append(true)
      .open(&first_segment)
      .expect("open segment");
    std::io::Write::write_all(&mut file, b"junk").expect("write");
    drop(file);

    let mut log = LogStorage::new(&log_dir, LogStorageOptions::new().segment_capacity(capacity));
    assert!(matches!(
      log.open(false),
      Err(FlowlogError::CorruptSegment { .. })
    ));
  }

  #[test]
  fn delete_on_close_removes_the_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");

    let mut log = LogStorage::new(
      &log_dir,
      LogStorageOptions::new()
        .segment_capacity(16 * 1024)
        .delete_on_close(true),
    );
    assert!(log.open(true).expect("open"));
    log.append(b"ephemeral").expect("append");
    log.close().expect("close");

    assert!(!log_dir.exists());
  }

  #[test]
  fn for_each_block_visits_every_block_in_append_order() {
    let dir = tempfile::tempdir().expect("tempdir");
    // Small capacity so the blocks spread over several segments.
    let capacity = SEGMENT_HEADER_SIZE + 2 * (BLOCK_LENGTH_PREFIX_SIZE + 8);
    let mut log = open_log(&dir.path().join("log"), capacity);

    let blocks: Vec<Vec<u8>> = (0u8..5).map(|n| vec![n; 8]).collect();
    let mut addresses = Vec::new();
    for block in &blocks {
      addresses.push(log.append(block).expect("append"));
    }

    let mut visited = Vec::new();
    log
      .for_each_block(|address, block| visited.push((address, block.to_vec())))
      .expect("scan");

    let expected: Vec<(LogAddress, Vec<u8>)> =
      addresses.into_iter().zip(blocks).collect();
    assert_eq!(visited, expected);
  }

  #[test]
  fn failed_open_releases_the_directory_lock() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");
    let capacity = SEGMENT_HEADER_SIZE + BLOCK_LENGTH_PREFIX_SIZE + 32;

    let mut log = open_log(&log_dir, capacity);
    let block = [1u8; 32];
    log.append(&block).expect("append");
    log.append(&block).expect("append rolls over");
    log.close().expect("close");

    // Non-trailing inconsistency makes every open fail.
    let first_segment = log_dir.join("000001.seg");
    let mut file = OpenOptions::new()
      .append(true)
      .open(&first_segment)
      .expect("open segment");
    std::io::Write::write_all(&mut file, b"junk").expect("write");
    drop(file);

    let mut log = LogStorage::new(&log_dir, LogStorageOptions::new().segment_capacity(capacity));
    assert!(matches!(
      log.open(false),
      Err(FlowlogError::CorruptSegment { .. })
    ));

    // The failed open must not hold the lock: the next attempt sees the
    // corruption again instead of a locked directory.
    let mut again = LogStorage::new(&log_dir, LogStorageOptions::new().segment_capacity(capacity));
    assert!(matches!(
      again.open(false),
      Err(FlowlogError::CorruptSegment { .. })
    ));
  }

  #[test]
  fn second_writer_on_the_same_directory_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir");
    let log_dir = dir.path().join("log");

    let mut first = open_log(&log_dir, 16 * 1024);
    let mut second = LogStorage::new(
      &log_dir,
      LogStorageOptions::new().segment_capacity(16 * 1024),
    );
    assert!(second.open(false).is_err());

    first.close().expect("close");
  }
}
