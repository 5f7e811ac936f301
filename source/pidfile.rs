// Exclusive-create PID file, matching the original's write/read/remove
// semantics: creation fails loudly if a PID file already exists (a previous
// instance may still be running) rather than silently overwriting it.

use std::{
  fs,
  io::{self, Write as _},
  os::unix::fs::OpenOptionsExt as _,
  path,
};

pub fn write(path: &path::Path) -> io::Result<()> {
  let mut file = fs::OpenOptions::new()
    .write(true)
    .create_new(true)
    .mode(0o644)
    .open(path)?;
  write!(file, "{}", std::process::id())?;
  Ok(())
}

pub fn remove(path: &path::Path) -> io::Result<()> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(error) => Err(error),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn refuses_to_clobber_an_existing_pidfile() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("tpop3d.pid");
    write(&path).unwrap();
    let error = write(&path).unwrap_err();
    assert_eq!(error.kind(), io::ErrorKind::AlreadyExists);
    remove(&path).unwrap();
    assert!(!path.exists());
  }

  #[test]
  fn remove_is_idempotent() {
    let directory = tempfile::tempdir().unwrap();
    let path = directory.path().join("tpop3d.pid");
    remove(&path).unwrap();
  }
}
