//! Fixed-capacity append-only log segment.
//!
//! A segment is one file holding a 24-byte header followed by length-prefixed
//! data blocks. The header records the committed size; the file on disk may
//! only legitimately differ from it by trailing bytes of a torn append, which
//! `truncate_uncommitted` discards.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};

use crate::constants::{
  BLOCK_LENGTH_PREFIX_SIZE, SEGMENT_FLAG_FILLED, SEGMENT_FORMAT_VERSION, SEGMENT_HEADER_SIZE,
  SEGMENT_MAGIC,
};
use crate::error::{FlowlogError, Result};

/// Outcome of a read at a valid position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
  /// A block of this many bytes was copied into the destination buffer.
  Block(usize),
  /// The address points at the append position of a still-open segment.
  NoData,
  /// The address points at the append position of a filled segment.
  EndOfSegment,
}

/// Decoded segment header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
  pub id: u32,
  pub capacity: u32,
  /// Committed size in bytes, header included. Bytes past this offset are
  /// uncommitted and discarded on recovery.
  pub size: u32,
  pub filled: bool,
}

impl SegmentHeader {
  fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
    LittleEndian::write_u32(&mut buf[0..4], SEGMENT_MAGIC);
    LittleEndian::write_u16(&mut buf[4..6], SEGMENT_FORMAT_VERSION);
    let flags = if self.filled { SEGMENT_FLAG_FILLED } else { 0 };
    LittleEndian::write_u16(&mut buf[6..8], flags);
    LittleEndian::write_u32(&mut buf[8..12], self.id);
    LittleEndian::write_u32(&mut buf[12..16], self.capacity);
    LittleEndian::write_u32(&mut buf[16..20], self.size);
    let crc = crc32fast::hash(&buf[0..20]);
    LittleEndian::write_u32(&mut buf[20..24], crc);
    buf
  }

  fn decode(buf: &[u8; SEGMENT_HEADER_SIZE as usize], path: &Path) -> Result<Self> {
    let magic = LittleEndian::read_u32(&buf[0..4]);
    if magic != SEGMENT_MAGIC {
      return Err(FlowlogError::CorruptSegment {
        path: path.to_path_buf(),
        reason: format!("invalid magic: {magic:#010x}"),
      });
    }

    let version = LittleEndian::read_u16(&buf[4..6]);
    if version != SEGMENT_FORMAT_VERSION {
      return Err(FlowlogError::VersionMismatch {
        found: version,
        supported: SEGMENT_FORMAT_VERSION,
      });
    }

    let stored = LittleEndian::read_u32(&buf[20..24]);
    let computed = crc32fast::hash(&buf[0..20]);
    if stored != computed {
      return Err(FlowlogError::CrcMismatch { stored, computed });
    }

    let flags = LittleEndian::read_u16(&buf[6..8]);
    Ok(Self {
      id: LittleEndian::read_u32(&buf[8..12]),
      capacity: LittleEndian::read_u32(&buf[12..16]),
      size: LittleEndian::read_u32(&buf[16..20]),
      filled: flags & SEGMENT_FLAG_FILLED != 0,
    })
  }
}

/// One open segment file.
#[derive(Debug)]
pub struct Segment {
  path: PathBuf,
  file: File,
  header: SegmentHeader,
}

impl Segment {
  /// Creates a new segment file and writes its initial header.
  /// The committed size starts at the header length.
  pub fn allocate(path: impl AsRef<Path>, id: u32, capacity: u32) -> Result<Self> {
    let path = path.as_ref().to_path_buf();

    let min_capacity = SEGMENT_HEADER_SIZE + BLOCK_LENGTH_PREFIX_SIZE + 1;
    if capacity < min_capacity {
      return Err(FlowlogError::InvalidConfig(format!(
        "segment capacity {capacity} is below the minimum of {min_capacity} bytes"
      )));
    }

    let mut file = OpenOptions::new()
      .create_new(true)
      .read(true)
      .write(true)
      .open(&path)?;

    let header = SegmentHeader {
      id,
      capacity,
      size: SEGMENT_HEADER_SIZE,
      filled: false,
    };
    file.write_all(&header.encode())?;
    file.sync_all()?;

    Ok(Self { path, file, header })
  }

  /// Opens an existing segment file and decodes its header. The file size is
  /// not reconciled here; `is_consistent`/`truncate_uncommitted` handle that
  /// during log recovery.
  pub fn open(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref().to_path_buf();
    let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

    let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
    file
      .read_exact(&mut buf)
      .map_err(|error| map_truncated_header(error, &path))?;
    let header = SegmentHeader::decode(&buf, &path)?;

    Ok(Self { path, file, header })
  }

  pub fn id(&self) -> u32 {
    self.header.id
  }

  pub fn capacity(&self) -> u32 {
    self.header.capacity
  }

  /// Committed size in bytes, header included.
  pub fn size(&self) -> u32 {
    self.header.size
  }

  pub fn is_filled(&self) -> bool {
    self.header.filled
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  /// Largest block payload this segment could ever hold.
  pub fn max_block_len(&self) -> usize {
    (self.header.capacity - SEGMENT_HEADER_SIZE - BLOCK_LENGTH_PREFIX_SIZE) as usize
  }

  /// Appends one length-prefixed block. Returns the in-segment offset of the
  /// block, or `InsufficientCapacity` without any partial write when the
  /// framed block does not fit the remaining capacity.
  ///
  /// The block bytes land on disk before the header's committed size is
  /// advanced; a crash in between leaves trailing bytes that recovery
  /// truncates away.
  pub fn append(&mut self, block: &[u8]) -> Result<u32> {
    if self.header.filled {
      return Err(FlowlogError::InsufficientCapacity);
    }

    let framed_len = BLOCK_LENGTH_PREFIX_SIZE as u64 + block.len() as u64;
    let end = self.header.size as u64 + framed_len;
    if end > self.header.capacity as u64 {
      return Err(FlowlogError::InsufficientCapacity);
    }

    let offset = self.header.size;
    let mut prefix = [0u8; BLOCK_LENGTH_PREFIX_SIZE as usize];
    LittleEndian::write_u32(&mut prefix, block.len() as u32);

    self.file.seek(SeekFrom::Start(offset as u64))?;
    self.file.write_all(&prefix)?;
    self.file.write_all(block)?;
    self.file.sync_data()?;

    self.header.size = end as u32;
    self.write_header()?;

    Ok(offset)
  }

  /// Reads the block at `offset` into `buf`.
  pub fn read_block(&mut self, buf: &mut [u8], offset: u32) -> Result<ReadOutcome> {
    if offset < SEGMENT_HEADER_SIZE || offset > self.header.size {
      return Err(FlowlogError::InvalidAddress {
        address: crate::types::log_address(self.header.id, offset),
      });
    }

    if offset == self.header.size {
      return Ok(if self.header.filled {
        ReadOutcome::EndOfSegment
      } else {
        ReadOutcome::NoData
      });
    }

    let mut prefix = [0u8; BLOCK_LENGTH_PREFIX_SIZE as usize];
    self.file.seek(SeekFrom::Start(offset as u64))?;
    self.file.read_exact(&mut prefix)?;
    let block_len = LittleEndian::read_u32(&prefix) as usize;

    if buf.len() < block_len {
      return Err(FlowlogError::BufferTooSmall {
        buffer_len: buf.len(),
        block_len,
      });
    }

    self.file.read_exact(&mut buf[..block_len])?;
    Ok(ReadOutcome::Block(block_len))
  }

  /// Marks the segment as filled; it accepts no further appends.
  pub fn mark_filled(&mut self) -> Result<()> {
    if !self.header.filled {
      self.header.filled = true;
      self.write_header()?;
    }
    Ok(())
  }

  /// True when the on-disk file length matches the committed size.
  pub fn is_consistent(&self) -> Result<bool> {
    let file_len = self.file.metadata()?.len();
    Ok(file_len == self.header.size as u64)
  }

  /// True when the file is shorter than the committed size: committed bytes
  /// are missing and the segment cannot be repaired.
  pub fn is_truncated_below_commit(&self) -> Result<bool> {
    let file_len = self.file.metadata()?.len();
    Ok(file_len < self.header.size as u64)
  }

  /// Shrinks the file back to the committed size, discarding bytes from a
  /// torn append. Idempotent.
  pub fn truncate_uncommitted(&mut self) -> Result<()> {
    self.file.set_len(self.header.size as u64)?;
    self.file.sync_all()?;
    Ok(())
  }

  pub fn flush(&mut self) -> Result<()> {
    self.file.sync_all()?;
    Ok(())
  }

  /// Deletes the backing file.
  pub fn delete(self) -> Result<()> {
    std::fs::remove_file(&self.path)?;
    Ok(())
  }

  fn write_header(&mut self) -> Result<()> {
    let encoded = self.header.encode();
    self.file.seek(SeekFrom::Start(0))?;
    self.file.write_all(&encoded)?;
    self.file.sync_data()?;
    Ok(())
  }
}

fn map_truncated_header(error: std::io::Error, path: &Path) -> FlowlogError {
  if error.kind() == std::io::ErrorKind::UnexpectedEof {
    FlowlogError::CorruptSegment {
      path: path.to_path_buf(),
      reason: "file is shorter than the segment header".to_string(),
    }
  } else {
    FlowlogError::Io(error)
  }
}
