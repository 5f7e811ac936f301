// The `select`(2) event loop: owns the listening sockets and the slot table
// of active connections, accepts new clients, pumps buffered I/O, and hands
// a connection off to a forked, setuid child once it authenticates. Grounded
// on original_source/netloop.c's net_loop/fork_child/connections_post_select
// trio, collapsed into one struct because Rust doesn't need the C version's
// scattered globals (`post_fork`, `this_child_connection`, `num_running_children`)
// to thread the same state through.

use crate::{auth, connection, lastlogin, listener, mailbox, signals};
use anyhow::Context as _;
use std::{io, net, path, sync::atomic::Ordering};

pub struct DiscoveryTemplates {
  /// `(driver name, mailbox template)`, in switch order.
  pub per_driver: Vec<(String, String)>,
  pub global: Option<String>,
  pub default_root: path::PathBuf,
  pub locking: mailbox::locks::Config,
}

pub struct Config {
  pub max_children: usize,
  pub limits: connection::Limits,
  pub discovery: DiscoveryTemplates,
  pub lastlogin_enabled: bool,
}

/// Host-based access control, e.g. a TCP-wrappers-style allow/deny list
/// supplied by the configuration layer. `true` admits the connection.
pub type AccessControl = Box<dyn Fn(net::IpAddr) -> bool>;

pub struct Reactor {
  listeners: Vec<listener::Listener>,
  connections: Vec<Option<connection::Connection>>,
  switch: auth::Switch,
  config: Config,
  access_control: AccessControl,
  num_running_children: usize,
  /// Set once in a forked child; gates re-accepting connections and the
  /// SIGHUP restart path, which only the parent acts on.
  post_fork: bool,
}

/// Shrink a newly accepted socket's send buffer so a slow client yields
/// `EAGAIN` promptly instead of letting us buffer arbitrarily much data it
/// hasn't acknowledged yet.
const MAX_DATA_IN_FLIGHT: libc::c_int = 8192;

impl Reactor {
  pub fn new(listeners: Vec<listener::Listener>, switch: auth::Switch, config: Config, access_control: AccessControl) -> Self {
    let capacity = 2 * config.max_children.max(1);
    Self {
      listeners,
      connections: (0..capacity).map(|_| None).collect(),
      switch,
      config,
      access_control,
      num_running_children: 0,
      post_fork: false,
    }
  }

  /// Run until terminated by SIGTERM/SIGINT/SIGHUP. Returns whether the
  /// caller should re-exec (SIGHUP was the cause).
  pub fn run(mut self) -> anyhow::Result<bool> {
    let (signal_read_fd, _signal_write_fd) = signals::install_self_pipe().context("installing signal handlers")?;

    log::info!("tpop3d successfully started");

    while !signals::TERMINATE.load(Ordering::Relaxed) {
      let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
      let mut writefds: libc::fd_set = unsafe { std::mem::zeroed() };
      let mut max_fd = signal_read_fd;
      unsafe { libc::FD_SET(signal_read_fd, &mut readfds) };

      if !self.post_fork {
        for listener in &self.listeners {
          let fd = listener.raw_fd();
          unsafe { libc::FD_SET(fd, &mut readfds) };
          max_fd = max_fd.max(fd);
        }
      }
      for slot in self.connections.iter().flatten() {
        let fd = slot.raw_fd();
        let interest = slot.pre_select();
        if interest.read {
          unsafe { libc::FD_SET(fd, &mut readfds) };
        }
        if interest.write {
          unsafe { libc::FD_SET(fd, &mut writefds) };
        }
        max_fd = max_fd.max(fd);
      }

      // Must stay under the idle timeout and short enough that a SIGTERM is
      // noticed promptly.
      let mut timeout = libc::timeval { tv_sec: 1, tv_usec: 0 };
      let ready = unsafe { libc::select(max_fd + 1, &mut readfds, &mut writefds, std::ptr::null_mut(), &mut timeout) };

      if ready < 0 {
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
          log::warn!("select: {error}");
        }
      } else {
        if unsafe { libc::FD_ISSET(signal_read_fd, &readfds) } {
          signals::drain(signal_read_fd);
        }
        if !self.post_fork {
          self.accept_ready(&readfds);
        }
        self.service_connections(&readfds, &writefds);
      }

      if signals::CHILD_EXITED.load(Ordering::Relaxed) {
        for pid in signals::reap_children() {
          self.num_running_children = self.num_running_children.saturating_sub(1);
          log::debug!("child {pid} exited; {} running", self.num_running_children);
        }
      }

      if self.post_fork && self.connections.iter().all(Option::is_none) {
        // Our one connection finished UPDATE and was reaped below.
        unsafe { libc::_exit(0) };
      }
    }

    let restart = signals::RESTART.load(Ordering::Relaxed);
    if restart {
      log::info!("restarting on signal");
    } else {
      log::info!("terminating on signal");
    }
    self.switch.close();
    Ok(restart)
  }

  fn accept_ready(&mut self, readfds: &libc::fd_set) {
    for index in 0..self.listeners.len() {
      if !unsafe { libc::FD_ISSET(self.listeners[index].raw_fd(), readfds) } {
        continue;
      }
      match self.listeners[index].accept() {
        Ok(Some((stream, peer))) => self.accept_one(index, stream, peer),
        Ok(None) => {}
        Err(error) => log::error!("accept: {error}"),
      }
    }
  }

  fn accept_one(&mut self, listener_index: usize, stream: net::TcpStream, peer: net::SocketAddr) {
    if !(self.access_control)(peer.ip()) {
      log::warn!("refused connection from {peer}: access denied");
      return;
    }

    let local_addr = match stream.local_addr() {
      Ok(addr) => addr,
      Err(error) => {
        log::error!("getsockname on accepted connection from {peer}: {error}");
        return;
      }
    };

    let value: libc::c_int = MAX_DATA_IN_FLIGHT;
    let result = unsafe {
      libc::setsockopt(
        std::os::unix::io::AsRawFd::as_raw_fd(&stream),
        libc::SOL_SOCKET,
        libc::SO_SNDBUF,
        &value as *const _ as *const libc::c_void,
        std::mem::size_of_val(&value) as libc::socklen_t,
      )
    };
    if result != 0 {
      log::error!("setsockopt(SO_SNDBUF) for {peer}: {}", io::Error::last_os_error());
      return;
    }

    if self.num_running_children >= self.config.max_children {
      log::warn!("rejected connection from {peer} owing to high load");
      let _ = stream.shutdown(net::Shutdown::Both);
      return;
    }
    let Some(free_slot) = self.connections.iter().position(Option::is_none) else {
      log::warn!("rejected connection from {peer} owing to high load");
      let _ = stream.shutdown(net::Shutdown::Both);
      return;
    };

    let listener = &self.listeners[listener_index];
    let transport = match &listener.tls_mode {
      listener::TlsMode::Implicit(config) => {
        if let Err(error) = stream.set_nonblocking(true) {
          log::error!("set_nonblocking for {peer}: {error}");
          return;
        }
        match crate::transport::tls::Tls::accept(stream, config.clone()) {
          Ok(tls) => crate::transport::Transport::Tls(tls),
          Err(error) => {
            log::error!("TLS accept setup for {peer}: {error}");
            return;
          }
        }
      }
      listener::TlsMode::Plain | listener::TlsMode::Stls(_) => match crate::transport::tcp::Tcp::new(stream) {
        Ok(tcp) => crate::transport::Transport::Tcp(tcp),
        Err(error) => {
          log::error!("set_nonblocking for {peer}: {error}");
          return;
        }
      },
    };
    let tls_config = listener.tls_mode.stls_config();
    let connection = connection::Connection::new(
      transport,
      peer,
      local_addr,
      listener.domain.clone(),
      self.config.limits,
      tls_config,
    );
    log::info!("{}: connected to local address {local_addr}", connection.idstr);
    self.connections[free_slot] = Some(connection);
  }

  fn service_connections(&mut self, readfds: &libc::fd_set, writefds: &libc::fd_set) {
    for slot in 0..self.connections.len() {
      let Some(fd) = self.connections[slot].as_ref().map(connection::Connection::raw_fd) else { continue };
      let readable = unsafe { libc::FD_ISSET(fd, readfds) };
      let writable = unsafe { libc::FD_ISSET(fd, writefds) };
      self.service_one(slot, readable, writable);
    }
  }

  fn service_one(&mut self, slot: usize, readable: bool, writable: bool) {
    let progressed = {
      let Some(connection) = self.connections[slot].as_mut() else { return };
      match connection.post_select(readable, writable) {
        Ok(progressed) => progressed,
        Err(error) => {
          log::debug!("{}: {error}", connection.idstr);
          false
        }
      }
    };

    if progressed {
      if let Some(outcome) = self.pump_slot(slot) {
        match outcome {
          connection::Outcome::Continue => {}
          connection::Outcome::Close => {
            if let Some(connection) = self.connections[slot].as_mut() {
              connection.shutdown();
            }
          }
          connection::Outcome::ForkAndSetuid(context) => self.fork_and_setuid(slot, *context),
        }
      }
    }

    let Some(connection) = self.connections[slot].as_mut() else { return };

    if connection.state == connection::ConnState::Running && connection.is_idle_expired() {
      log::info!("{}: timed out", connection.idstr);
      connection.reject("client has been idle for too long");
    }

    if connection.state == connection::ConnState::Closing {
      connection.shutdown();
    }

    if connection.state == connection::ConnState::Closed {
      log::info!("{}: disconnected", connection.idstr);
      self.connections[slot] = None;
    }
  }

  /// Pump one connection's input buffer for complete command lines. Only
  /// the first non-`Continue` outcome within a tick is surfaced, matching
  /// `Connection::pump`'s own early-return-on-terminal-outcome behaviour.
  fn pump_slot(&mut self, slot: usize) -> Option<connection::Outcome> {
    let server_ip = self.connections[slot].as_ref()?.local_addr.ip().to_string();
    let connection = self.connections[slot].as_mut()?;
    if connection.state != connection::ConnState::Running {
      return None;
    }
    Some(connection.pump(&mut self.switch, &server_ip))
  }

  /// Fork, dropping every fd the child doesn't need, then drop privileges
  /// and open the mailbox in the child. Blocks SIGCHLD around the fork so a
  /// child that exits immediately can't race the parent's bookkeeping.
  fn fork_and_setuid(&mut self, slot: usize, context: auth::AuthContext) {
    let mut mask: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
      libc::sigemptyset(&mut mask);
      libc::sigaddset(&mut mask, libc::SIGCHLD);
      libc::sigprocmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut());
    }

    match unsafe { libc::fork() } {
      -1 => {
        log::error!("fork: {}", io::Error::last_os_error());
        if let Some(connection) = self.connections[slot].as_mut() {
          connection.fail_after_fork("everything was fine until now, but suddenly I realise I just can't go on. Sorry.");
        }
      }
      0 => {
        self.listeners.clear();
        for (index, slot_connection) in self.connections.iter_mut().enumerate() {
          if index != slot {
            *slot_connection = None;
          }
        }
        self.switch.post_fork();
        self.post_fork = true;

        let client_ip = self.connections[slot].as_ref().map(|c| c.remote_addr.ip().to_string()).unwrap_or_default();
        let mailbox_directory;
        let opened: Result<mailbox::Mailbox, mailbox::OpenError> = if context.uid == 0 {
          mailbox_directory = None;
          Err(mailbox::OpenError::Failed(anyhow::anyhow!("authentication context has a UID of 0")))
        } else if unsafe { libc::setgid(context.gid) } == -1 {
          mailbox_directory = None;
          Err(mailbox::OpenError::Failed(
            anyhow::Error::from(io::Error::last_os_error()).context(format!("setgid({})", context.gid)),
          ))
        } else if unsafe { libc::setuid(context.uid) } == -1 {
          mailbox_directory = None;
          Err(mailbox::OpenError::Failed(
            anyhow::Error::from(io::Error::last_os_error()).context(format!("setuid({})", context.uid)),
          ))
        } else {
          let pairs: Vec<(&str, &str)> = self.config.discovery.per_driver.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
          let discovery = mailbox::DiscoveryConfig {
            per_driver_templates: &pairs,
            global_template: self.config.discovery.global.as_deref(),
            default_root: &self.config.discovery.default_root,
            locking: self.config.discovery.locking,
          };
          match mailbox::discover(&context, &discovery) {
            Ok(mailbox) => {
              mailbox_directory = Some(mailbox.directory());
              Ok(mailbox)
            }
            Err(error) => {
              mailbox_directory = None;
              Err(error)
            }
          }
        };

        let Some(connection) = self.connections[slot].as_mut() else { return };
        match opened {
          Ok(mailbox) => {
            log::info!(
              "{}: began session for {:?} with {}",
              connection.idstr,
              context.user,
              context.driver.as_deref().unwrap_or("?"),
            );
            if self.config.lastlogin_enabled {
              if let Some(directory) = mailbox_directory {
                if let Err(error) = lastlogin::record(&directory, &client_ip) {
                  log::warn!("{}: writing .lastlogin: {error:#}", connection.idstr);
                }
              }
            }
            connection.enter_transaction(context, mailbox);
          }
          Err(mailbox::OpenError::Locked(error)) => {
            log::warn!("{}: {error}", connection.idstr);
            connection.fail_after_fork(&error.to_string());
          }
          Err(error @ mailbox::OpenError::NoSuchMailbox) => {
            log::error!("{}: {error}", connection.idstr);
            connection.fail_after_fork("unable to open mailbox");
          }
          Err(mailbox::OpenError::Failed(error)) => {
            log::error!("{}: {error:#}", connection.idstr);
            connection.fail_after_fork("unable to open mailbox");
          }
        }
      }
      pid => {
        if let Some(connection) = self.connections[slot].as_ref() {
          log::info!(
            "{}: began session for {:?} with {}; child PID is {pid}",
            connection.idstr,
            context.user,
            context.driver.as_deref().unwrap_or("?"),
          );
        }
        self.connections[slot] = None;
        self.num_running_children += 1;
      }
    }

    unsafe { libc::sigprocmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()) };
  }
}

