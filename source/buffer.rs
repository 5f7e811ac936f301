// A small circular-ish buffer: a fixed-capacity byte vector with a contiguous
// write cursor and a contiguous consume cursor. Bytes below the consume
// cursor have already been handed to the caller and are compacted away on
// the next `consume` call, which is cheap enough for POP3 line traffic.

use std::cmp;

/// Maximum length of a single POP3 command or response line, CRLF included.
pub const MAX_LINE: usize = 1024;

#[derive(Debug)]
pub struct Buffer {
  data: Vec<u8>,
  filled: usize,
  capacity: usize,
}

impl Buffer {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      data: vec![0; capacity],
      filled: 0,
      capacity,
    }
  }

  /// The region available to write new bytes into.
  pub fn write_slice(&mut self) -> &mut [u8] {
    &mut self.data[self.filled..self.capacity]
  }

  /// Commit `n` bytes previously written via `write_slice`.
  pub fn commit(&mut self, n: usize) {
    self.filled = cmp::min(self.filled + n, self.capacity);
  }

  /// The region available to read already-committed bytes from.
  pub fn readable(&self) -> &[u8] {
    &self.data[..self.filled]
  }

  pub fn is_full(&self) -> bool {
    self.filled == self.capacity
  }

  pub fn is_empty(&self) -> bool {
    self.filled == 0
  }

  pub fn len(&self) -> usize {
    self.filled
  }

  /// Find the first occurrence of `needle` in the readable region.
  pub fn find(&self, needle: u8) -> Option<usize> {
    memchr::memchr(needle, self.readable())
  }

  /// Drop the first `n` bytes, sliding the remainder down to offset 0.
  pub fn consume(&mut self, n: usize) {
    let n = cmp::min(n, self.filled);
    self.data.copy_within(n..self.filled, 0);
    self.filled -= n;
  }

  /// Pop one CR?LF-terminated line (without the terminator) out of the
  /// buffer, or `None` if no complete line is present yet. A line longer
  /// than `MAX_LINE` without a terminator is a protocol error: the caller
  /// should close the connection in that case rather than keep waiting.
  pub fn take_line(&mut self) -> Option<Vec<u8>> {
    let data = self.readable();
    let newline = memchr::memchr(b'\n', data)?;
    let end = if newline > 0 && data[newline - 1] == b'\r' {
      newline - 1
    } else {
      newline
    };
    let line = data[..end].to_vec();
    self.consume(newline + 1);
    Some(line)
  }

  pub fn overlong(&self) -> bool {
    self.filled >= MAX_LINE && self.find(b'\n').is_none()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn write_and_take_line() {
    let mut buffer = Buffer::with_capacity(64);
    let written = b"USER alice\r\n";
    buffer.write_slice()[..written.len()].copy_from_slice(written);
    buffer.commit(written.len());
    assert_eq!(buffer.take_line().unwrap(), b"USER alice");
    assert!(buffer.is_empty());
  }

  #[test]
  fn take_line_without_cr() {
    let mut buffer = Buffer::with_capacity(64);
    let written = b"NOOP\n";
    buffer.write_slice()[..written.len()].copy_from_slice(written);
    buffer.commit(written.len());
    assert_eq!(buffer.take_line().unwrap(), b"NOOP");
  }

  #[test]
  fn take_line_needs_more_data() {
    let mut buffer = Buffer::with_capacity(64);
    let written = b"STAT";
    buffer.write_slice()[..written.len()].copy_from_slice(written);
    buffer.commit(written.len());
    assert!(buffer.take_line().is_none());
  }

  #[test]
  fn takes_multiple_pipelined_lines() {
    let mut buffer = Buffer::with_capacity(64);
    let written = b"NOOP\r\nNOOP\r\n";
    buffer.write_slice()[..written.len()].copy_from_slice(written);
    buffer.commit(written.len());
    assert_eq!(buffer.take_line().unwrap(), b"NOOP");
    assert_eq!(buffer.take_line().unwrap(), b"NOOP");
    assert!(buffer.take_line().is_none());
  }

  #[test]
  fn overlong_without_terminator() {
    let mut buffer = Buffer::with_capacity(MAX_LINE + 16);
    let written = vec![b'a'; MAX_LINE];
    buffer.write_slice()[..written.len()].copy_from_slice(&written);
    buffer.commit(written.len());
    assert!(buffer.overlong());
  }
}
