// BSD mbox driver: a single spool file whose messages are separated by
// `From ` lines at the start of a line. Indexing mmaps the file read-only
// and walks it once; compaction on `apply_changes` reopens it writable and
// does an in-place `memmove`-style walk, exactly mirroring the original's
// mailspool.c (the original literally calls `mmap`/`memmove`/`ftruncate`;
// `memmap2` is the idiomatic modern stand-in for the raw syscalls).

use super::{locks, Driver, IndexEntry, OpenError};
use anyhow::Context as _;
use md5::{Digest as _, Md5};
use memmap2::{Mmap, MmapMut};
use std::{
  fs,
  io::{self, Write as _},
  path,
};

struct Segment {
  /// Offset of the `From ` line that opens this message.
  start: u64,
  /// Offset one past the end of this message (next `From ` line, or EOF).
  end: u64,
  /// Length of the `From ` line itself, including its terminating `\n`.
  envelope_len: u64,
}

pub struct Mbox {
  path: path::PathBuf,
  file: fs::File,
  _lock: locks::Lock,
  segments: Vec<Segment>,
  entries: Vec<IndexEntry>,
}

pub fn open(path: &path::Path, locking: &locks::Config) -> Result<Mbox, OpenError> {
  let file = fs::OpenOptions::new().read(true).write(true).open(path)?;
  let lock_handle = locks::open_for_locking(path)?;
  let lock = locks::acquire(path, lock_handle, locking)?;

  let (segments, entries) = if file.metadata()?.len() == 0 {
    (Vec::new(), Vec::new())
  } else {
    let map = unsafe { Mmap::map(&file) }.context("mmap mailbox for indexing")?;
    build_index(&map)
  };

  Ok(Mbox { path: path.to_path_buf(), file, _lock: lock, segments, entries })
}

const HASH_PREFIX: usize = 512;

fn is_from_line(data: &[u8], at: usize) -> bool {
  data[at..].starts_with(b"From ")
}

fn build_index(data: &[u8]) -> (Vec<Segment>, Vec<IndexEntry>) {
  let mut starts = Vec::new();
  if !data.is_empty() && is_from_line(data, 0) {
    starts.push(0usize);
  }
  let mut offset = 0;
  while let Some(pos) = memchr::memchr(b'\n', &data[offset..]) {
    let absolute = offset + pos + 1;
    if absolute < data.len() && is_from_line(data, absolute) {
      starts.push(absolute);
    }
    offset = absolute;
    if offset >= data.len() {
      break;
    }
  }

  let mut segments = Vec::with_capacity(starts.len());
  let mut entries = Vec::with_capacity(starts.len());
  for (i, &start) in starts.iter().enumerate() {
    let end = starts.get(i + 1).copied().unwrap_or(data.len());
    let envelope_len = memchr::memchr(b'\n', &data[start..end]).map(|p| p + 1).unwrap_or(end - start);
    let content = &data[start + envelope_len..end];
    let prefix = &content[..content.len().min(HASH_PREFIX)];
    let hash: [u8; 16] = Md5::digest(prefix).into();
    segments.push(Segment { start: start as u64, end: end as u64, envelope_len: envelope_len as u64 });
    entries.push(IndexEntry { deleted: false, hash, length: content.len() as u64 });
  }
  (segments, entries)
}

impl Driver for Mbox {
  fn total_octets(&self) -> u64 {
    self.file.metadata().map(|m| m.len()).unwrap_or(0)
  }

  fn index(&self) -> &[IndexEntry] {
    &self.entries
  }

  fn index_mut(&mut self) -> &mut [IndexEntry] {
    &mut self.entries
  }

  fn send_message(&self, message: usize, max_body_lines: Option<u32>, writer: &mut dyn io::Write) -> io::Result<()> {
    let segment = &self.segments[message];
    let map = unsafe { Mmap::map(&self.file) }?;
    let content_start = (segment.start + segment.envelope_len) as usize;
    let content_end = segment.end as usize;
    let content = &map[content_start..content_end];

    let mut in_headers = true;
    let mut body_lines_sent = 0u32;
    for line in content.split_inclusive(|&b| b == b'\n') {
      let line = line.strip_suffix(b"\n").unwrap_or(line);
      let line = line.strip_suffix(b"\r").unwrap_or(line);
      let text = String::from_utf8_lossy(line);

      if in_headers {
        if text.is_empty() {
          in_headers = false;
        }
        write_stuffed(writer, &text)?;
        continue;
      }

      if let Some(limit) = max_body_lines {
        if body_lines_sent >= limit {
          break;
        }
        body_lines_sent += 1;
      }
      write_stuffed(writer, &text)?;
    }
    writer.write_all(crate::pop3::TERMINATOR.as_bytes())
  }

  fn apply_changes(&mut self) -> anyhow::Result<()> {
    let deleted = self.entries.iter().filter(|e| e.deleted).count();
    if deleted == 0 {
      return Ok(());
    }
    if deleted == self.entries.len() {
      self.file.set_len(0).context("truncating mailbox")?;
      self.segments.clear();
      self.entries.clear();
      return Ok(());
    }

    let mut map = unsafe { MmapMut::map_mut(&self.file) }.context("mmap mailbox for compaction")?;

    // Walk the index once, sliding each contiguous run of surviving messages
    // down to a compaction cursor `dest`. Deleted messages are simply
    // skipped over; nothing is written for them.
    let mut dest = 0u64;
    let mut run: Option<(usize, usize)> = None; // (byte start, byte end) of the pending run
    for (i, segment) in self.segments.iter().enumerate() {
      if self.entries[i].deleted {
        if let Some((start, end)) = run.take() {
          dest += memmove_down(&mut map, start, end, dest);
        }
        continue;
      }
      run = Some(match run {
        Some((start, _)) => (start, segment.end as usize),
        None => (segment.start as usize, segment.end as usize),
      });
    }
    if let Some((start, end)) = run {
      dest += memmove_down(&mut map, start, end, dest);
    }

    map.flush().context("flushing compacted mailbox")?;
    drop(map);
    self.file.set_len(dest).context("truncating mailbox")?;

    // Re-derive offsets from scratch: simplest way to keep segment start/end
    // consistent with the bytes that actually survived the memmove above.
    let map = unsafe { Mmap::map(&self.file) }.context("remapping after compaction")?;
    let (segments, entries) = build_index(&map);
    self.segments = segments;
    self.entries = entries;
    Ok(())
  }
}

/// Move the byte range `[start, end)` down to `dest`, returning its length.
/// `dest` is always <= `start`, so this is a safe forward-reading, backward-
/// writing shift within the same mapping.
fn memmove_down(map: &mut MmapMut, start: usize, end: usize, dest: u64) -> u64 {
  let dest = dest as usize;
  if start != dest {
    map.copy_within(start..end, dest);
  }
  (end - start) as u64
}

fn write_stuffed(writer: &mut dyn io::Write, line: &str) -> io::Result<()> {
  write!(writer, "{}\r\n", crate::pop3::stuff_line(line))
}

pub fn path_of(mailbox: &Mbox) -> &path::Path {
  &mailbox.path
}
