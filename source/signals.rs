// Self-pipe signal delivery: the handlers themselves do nothing but an
// async-signal-safe `write(2)` of one byte into a pipe that the reactor's
// `select` loop also watches. No allocation, no logging, no syscalls beyond
// `write` happen inside the handler itself.

use std::{
  io,
  os::unix::io::RawFd,
  sync::atomic::{AtomicBool, AtomicI32, Ordering},
};

pub static TERMINATE: AtomicBool = AtomicBool::new(false);
pub static RESTART: AtomicBool = AtomicBool::new(false);
pub static CHILD_EXITED: AtomicBool = AtomicBool::new(false);

static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn notify(_signum: libc::c_int) {
  let fd = WRITE_FD.load(Ordering::Relaxed);
  if fd >= 0 {
    let byte = 0u8;
    unsafe {
      libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
    }
  }
}

extern "C" fn on_terminate(signum: libc::c_int) {
  TERMINATE.store(true, Ordering::Relaxed);
  notify(signum);
}

extern "C" fn on_restart(signum: libc::c_int) {
  TERMINATE.store(true, Ordering::Relaxed);
  RESTART.store(true, Ordering::Relaxed);
  notify(signum);
}

extern "C" fn on_child(signum: libc::c_int) {
  CHILD_EXITED.store(true, Ordering::Relaxed);
  notify(signum);
}

fn install(signum: libc::c_int, handler: extern "C" fn(libc::c_int)) -> io::Result<()> {
  let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
  action.sa_sigaction = handler as usize;
  action.sa_flags = libc::SA_RESTART;
  unsafe { libc::sigemptyset(&mut action.sa_mask) };
  if unsafe { libc::sigaction(signum, &action, std::ptr::null_mut()) } == -1 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Install handlers for SIGTERM/SIGINT (graceful shutdown), SIGHUP (restart)
/// and SIGCHLD (child reaping), all funnelled through `pipe_write_fd`.
/// Returns the read end's fd for the caller to register with `select`.
pub fn install_self_pipe() -> io::Result<(RawFd, RawFd)> {
  let mut fds = [0 as libc::c_int; 2];
  if unsafe { libc::pipe(fds.as_mut_ptr()) } == -1 {
    return Err(io::Error::last_os_error());
  }
  let [read_fd, write_fd] = fds;
  for fd in [read_fd, write_fd] {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
  }
  WRITE_FD.store(write_fd, Ordering::Relaxed);

  install(libc::SIGTERM, on_terminate)?;
  install(libc::SIGINT, on_terminate)?;
  install(libc::SIGHUP, on_restart)?;
  install(libc::SIGCHLD, on_child)?;
  unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };

  Ok((read_fd, write_fd))
}

/// Drain every byte currently sitting in the self-pipe's read end.
pub fn drain(read_fd: RawFd) {
  let mut scratch = [0u8; 64];
  loop {
    let n = unsafe { libc::read(read_fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
    if n <= 0 {
      break;
    }
  }
}

/// Reap every exited child without blocking, returning their pids.
pub fn reap_children() -> Vec<libc::pid_t> {
  let mut reaped = Vec::new();
  loop {
    let mut status = 0;
    let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
    if pid <= 0 {
      break;
    }
    reaped.push(pid);
  }
  CHILD_EXITED.store(false, Ordering::Relaxed);
  reaped
}
