// mbox locking: fcntl whole-file write lock, flock, and a dotlock created
// via an atomic link(2) from a uniquely named "hitching post" file, so the
// dotlock is safe even over NFS. Grounded on the original's locks.c, which
// layers all three because no single scheme is reliable across every
// filesystem an mbox might live on.

use anyhow::Context as _;
use std::{
  fs, io,
  os::unix::io::AsRawFd as _,
  path, thread, time,
};

#[derive(Debug, Clone, Copy)]
pub struct Config {
  pub retries: u32,
  pub retry_sleep: time::Duration,
  pub use_fcntl: bool,
  pub use_flock: bool,
  pub use_dotlock: bool,
  pub cclient_steal: bool,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      retries: 5,
      retry_sleep: time::Duration::from_millis(500),
      use_fcntl: true,
      use_flock: true,
      use_dotlock: true,
      cclient_steal: false,
    }
  }
}

pub struct Lock {
  file: fs::File,
  dotlock_path: Option<path::PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
  #[error("mailbox locked; do you have another concurrent session?")]
  Contended,
  #[error(transparent)]
  Io(#[from] io::Error),
}

pub fn acquire(path: &path::Path, file: fs::File, config: &Config) -> Result<Lock, Error> {
  if config.cclient_steal {
    cclient_steal(&file);
  }

  for attempt in 0..=config.retries {
    match try_once(path, &file, config) {
      Ok(dotlock_path) => return Ok(Lock { file, dotlock_path }),
      Err(Error::Contended) if attempt < config.retries => {
        thread::sleep(config.retry_sleep);
      }
      Err(error) => return Err(error),
    }
  }
  Err(Error::Contended)
}

fn try_once(path: &path::Path, file: &fs::File, config: &Config) -> Result<Option<path::PathBuf>, Error> {
  if config.use_fcntl && fcntl_lock(file).is_err() {
    return Err(Error::Contended);
  }
  if config.use_flock && flock_lock(file).is_err() {
    return Err(Error::Contended);
  }
  if config.use_dotlock {
    match dotlock(path) {
      Ok(dotlock_path) => Ok(Some(dotlock_path)),
      Err(Error::Contended) => Err(Error::Contended),
      Err(other) => Err(other),
    }
  } else {
    Ok(None)
  }
}

impl Drop for Lock {
  fn drop(&mut self) {
    if let Some(path) = &self.dotlock_path {
      let _ = fs::remove_file(path);
    }
    let _ = flock_unlock(&self.file);
    let _ = fcntl_unlock(&self.file);
  }
}

fn fcntl_lock(file: &fs::File) -> io::Result<()> {
  let mut lock: libc::flock = unsafe { std::mem::zeroed() };
  lock.l_type = libc::F_WRLCK as libc::c_short;
  lock.l_whence = libc::SEEK_SET as libc::c_short;
  lock.l_start = 0;
  lock.l_len = 0;
  if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

fn fcntl_unlock(file: &fs::File) -> io::Result<()> {
  let mut lock: libc::flock = unsafe { std::mem::zeroed() };
  lock.l_type = libc::F_UNLCK as libc::c_short;
  lock.l_whence = libc::SEEK_SET as libc::c_short;
  if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

fn flock_lock(file: &fs::File) -> io::Result<()> {
  if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

fn flock_unlock(file: &fs::File) -> io::Result<()> {
  if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

fn lockfile_path(mailbox: &path::Path) -> path::PathBuf {
  let mut name = mailbox.as_os_str().to_owned();
  name.push(".lock");
  path::PathBuf::from(name)
}

/// Create a dotlock by writing our PID to a unique hitching-post file and
/// `link(2)`-ing it onto the lockfile name. `link` fails if the target
/// already exists, which is what makes this atomic even on NFS.
fn dotlock(mailbox: &path::Path) -> Result<path::PathBuf, Error> {
  let lockfile = lockfile_path(mailbox);

  if dotlock_is_stale(&lockfile) {
    let _ = fs::remove_file(&lockfile);
  }

  let hostname = hostname();
  let pid = std::process::id();
  let hitching_post = mailbox.with_extension(format!(
    "{pid}.{}.{hostname}",
    time::SystemTime::now()
      .duration_since(time::UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs()
  ));
  {
    let mut file = fs::File::create(&hitching_post)?;
    use io::Write as _;
    write!(file, "{pid}")?;
  }

  let linked = link(&hitching_post, &lockfile);
  let metadata = fs::metadata(&hitching_post);
  let _ = fs::remove_file(&hitching_post);

  use std::os::unix::fs::MetadataExt as _;
  match (linked, metadata) {
    (Ok(()), Ok(metadata)) if metadata.nlink() == 2 => Ok(lockfile),
    _ => Err(Error::Contended),
  }
}

fn link(from: &path::Path, to: &path::Path) -> io::Result<()> {
  fs::hard_link(from, to)
}

fn dotlock_is_stale(lockfile: &path::Path) -> bool {
  let Ok(contents) = fs::read_to_string(lockfile) else {
    return false;
  };
  let Ok(pid) = contents.trim().parse::<libc::pid_t>() else {
    return false;
  };
  let result = unsafe { libc::kill(pid, 0) };
  result == -1 && io::Error::last_os_error().raw_os_error() == Some(libc::ESRCH)
}

fn hostname() -> String {
  let mut buffer = [0u8; 256];
  if unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) } == 0 {
    let end = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
    String::from_utf8_lossy(&buffer[..end]).into_owned()
  } else {
    "localhost".to_string()
  }
}

/// Best-effort PINE/c-client interoperability: probe its sentinel lock file
/// for this device/inode pair and, if another process holds it, nudge it
/// with SIGUSR2 and give it a moment to let go. Never treated as fatal.
fn cclient_steal(file: &fs::File) {
  let Ok(metadata) = file.metadata() else { return };
  use std::os::unix::fs::MetadataExt as _;
  let sentinel = path::PathBuf::from(format!("/tmp/.{:x}.{:x}", metadata.dev(), metadata.ino()));
  let Ok(sentinel_file) = fs::OpenOptions::new().read(true).write(true).open(&sentinel) else {
    return;
  };
  if flock_lock(&sentinel_file).is_ok() {
    let _ = flock_unlock(&sentinel_file);
    return;
  }
  if let Ok(contents) = fs::read_to_string(&sentinel) {
    if let Ok(pid) = contents.trim().parse::<libc::pid_t>() {
      unsafe { libc::kill(pid, libc::SIGUSR2) };
      thread::sleep(time::Duration::from_secs(2));
    }
  }
}

pub fn open_for_locking(path: &path::Path) -> anyhow::Result<fs::File> {
  fs::OpenOptions::new()
    .read(true)
    .write(true)
    .open(path)
    .with_context(|| format!("opening {path:?} for locking"))
}
