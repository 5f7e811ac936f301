// Last-login bookkeeping: a `.lastlogin` file dropped next to the mailbox
// recording the client's source address, written via a temp file and atomic
// rename so a reader never observes a half-written file. Grounded on
// original_source's persisted-state convention referenced from main.c.

use std::{fs, io::Write as _, path};

pub fn record(mailbox_directory: &path::Path, client_ip: &str) -> anyhow::Result<()> {
  let target = mailbox_directory.join(".lastlogin");
  let temp = mailbox_directory.join(".lastlogin.tmp");
  {
    let mut file = fs::File::create(&temp)?;
    writeln!(file, "{client_ip}")?;
    file.sync_all()?;
  }
  fs::rename(&temp, &target)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn writes_client_ip_atomically() {
    let directory = tempfile::tempdir().unwrap();
    record(directory.path(), "192.0.2.1").unwrap();
    let contents = fs::read_to_string(directory.path().join(".lastlogin")).unwrap();
    assert_eq!(contents, "192.0.2.1\n");
    assert!(!directory.path().join(".lastlogin.tmp").exists());
  }
}
