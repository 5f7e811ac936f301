// Maildir driver: index `new/` and `cur/` by mtime (ignoring anything
// delivered after the scan started, to avoid racing a concurrent delivery),
// send messages byte-for-byte with dot-stuffing, and on `apply_changes`
// unlink deleted files while best-effort renaming survivors out of `new/`
// into `cur/`. Grounded on the original's maildir.c, generalized from the
// teacher's `Builder`/`Maildir` directory layout in what was source/maildir.rs.

use super::{Driver, IndexEntry, OpenError};
use anyhow::Context as _;
use md5::{Digest as _, Md5};
use std::{
  fs,
  io::{self, Read as _, Write as _},
  path, time,
};

const HASH_PREFIX: usize = 512;

#[derive(Debug)]
pub struct Maildir {
  root: path::PathBuf,
  files: Vec<path::PathBuf>,
  entries: Vec<IndexEntry>,
}

pub fn open(path: &path::Path) -> Result<Maildir, OpenError> {
  if !path.join("cur").is_dir() || !path.join("new").is_dir() {
    return Err(OpenError::NoSuchMailbox);
  }

  let scan_started = time::SystemTime::now();
  let mut listed = Vec::new();
  for subdir in ["new", "cur"] {
    scan_directory(&path.join(subdir), scan_started, &mut listed)?;
  }
  listed.sort_by_key(|(_, mtime, _)| *mtime);

  let mut files = Vec::with_capacity(listed.len());
  let mut entries = Vec::with_capacity(listed.len());
  for (file_path, _mtime, size) in listed {
    let hash = hash_prefix(&file_path).with_context(|| format!("hashing {file_path:?}"))?;
    entries.push(IndexEntry { deleted: false, hash, length: size });
    files.push(file_path);
  }

  Ok(Maildir { root: path.to_path_buf(), files, entries })
}

/// Hash the first 512 bytes of a message's content for its UID, exactly as
/// the mbox driver does - never the on-disk path, which `apply_changes`
/// below mutates by renaming survivors from `new/` into `cur/` (the
/// original's maildir.c deliberately skips the `new/`/`cur/` prefix for the
/// same reason: a UID must stay stable even though the path doesn't).
fn hash_prefix(path: &path::Path) -> io::Result<[u8; 16]> {
  let mut buffer = [0u8; HASH_PREFIX];
  let mut file = fs::File::open(path)?;
  let mut filled = 0;
  while filled < buffer.len() {
    match file.read(&mut buffer[filled..])? {
      0 => break,
      n => filled += n,
    }
  }
  Ok(Md5::digest(&buffer[..filled]).into())
}

fn scan_directory(
  dir: &path::Path,
  scan_started: time::SystemTime,
  out: &mut Vec<(path::PathBuf, time::SystemTime, u64)>,
) -> anyhow::Result<()> {
  for entry in fs::read_dir(dir).with_context(|| format!("reading {dir:?}"))? {
    let entry = entry?;
    let name = entry.file_name();
    if name.as_encoded_bytes().starts_with(b".") {
      continue;
    }
    let metadata = entry.metadata()?;
    if !metadata.is_file() {
      continue;
    }
    let mtime = metadata.modified()?;
    if mtime >= scan_started {
      // Ignore messages delivered mid-scan: we'd otherwise race a
      // concurrent delivery that hasn't finished writing the file yet.
      continue;
    }
    out.push((entry.path(), mtime, metadata.len()));
  }
  Ok(())
}

impl Driver for Maildir {
  fn total_octets(&self) -> u64 {
    self.entries.iter().map(|e| e.length).sum()
  }

  fn index(&self) -> &[IndexEntry] {
    &self.entries
  }

  fn index_mut(&mut self) -> &mut [IndexEntry] {
    &mut self.entries
  }

  fn send_message(&self, message: usize, max_body_lines: Option<u32>, writer: &mut dyn io::Write) -> io::Result<()> {
    let mut contents = Vec::new();
    fs::File::open(&self.files[message])?.read_to_end(&mut contents)?;

    let mut in_headers = true;
    let mut body_lines_sent = 0u32;
    for line in contents.split_inclusive(|&b| b == b'\n') {
      let line = line.strip_suffix(b"\n").unwrap_or(line);
      let line = line.strip_suffix(b"\r").unwrap_or(line);
      let text = String::from_utf8_lossy(line);

      if in_headers {
        if text.is_empty() {
          in_headers = false;
        }
        write!(writer, "{}\r\n", crate::pop3::stuff_line(&text))?;
        continue;
      }
      if let Some(limit) = max_body_lines {
        if body_lines_sent >= limit {
          break;
        }
        body_lines_sent += 1;
      }
      write!(writer, "{}\r\n", crate::pop3::stuff_line(&text))?;
    }
    writer.write_all(crate::pop3::TERMINATOR.as_bytes())
  }

  fn apply_changes(&mut self) -> anyhow::Result<()> {
    for (i, path) in self.files.iter().enumerate() {
      if self.entries[i].deleted {
        fs::remove_file(path).with_context(|| format!("unlinking {path:?}"))?;
        continue;
      }
      if let Some(new_path) = promote_to_cur(&self.root, path) {
        // Best-effort: a failed rename just leaves the message in new/.
        let _ = fs::rename(path, new_path);
      }
    }
    Ok(())
  }
}

fn promote_to_cur(root: &path::Path, path: &path::Path) -> Option<path::PathBuf> {
  let parent = path.parent()?;
  if parent != root.join("new") {
    return None;
  }
  Some(root.join("cur").join(path.file_name()?))
}

pub fn root_of(maildir: &Maildir) -> &path::Path {
  &maildir.root
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn indexes_and_counts_messages() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let root = directory.path();
    for subdir in ["cur", "new", "tmp"] {
      fs::create_dir(root.join(subdir))?;
    }
    fs::write(root.join("cur").join("1"), b"Subject: a\r\n\r\nbody\r\n")?;
    fs::write(root.join("new").join("2"), b"Subject: b\r\n\r\nbody\r\n")?;

    let maildir = open(root)?;
    assert_eq!(maildir.index().len(), 2);
    Ok(())
  }

  #[test]
  fn ignores_messages_delivered_after_scan_started() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let root = directory.path();
    for subdir in ["cur", "new", "tmp"] {
      fs::create_dir(root.join(subdir))?;
    }
    let maildir = open(root)?;
    assert_eq!(maildir.index().len(), 0);
    Ok(())
  }
}
