// Per-connection POP3 state machine: RFC 1939 AUTHORIZATION -> TRANSACTION
// -> UPDATE, driven one complete command line at a time. The reactor owns
// the socket-level plumbing (select, accept, fork); this module only ever
// sees already-demultiplexed read/write progress on one connection.

use crate::{auth, buffer::Buffer, mailbox, pop3, transport};
use rand::RngCore as _;
use std::{io, net, sync::Arc, time};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
  Running,
  Closing,
  Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
  Auth,
  Transaction,
  Update,
}

/// What the reactor should do after pumping a connection's input buffer for
/// complete command lines.
pub enum Outcome {
  Continue,
  /// Authentication succeeded; the reactor must fork and drop privileges.
  ForkAndSetuid(Box<auth::AuthContext>),
  Close,
}

#[derive(Debug, Clone, Copy)]
pub struct Limits {
  pub idle_timeout: time::Duration,
  pub max_protocol_errors: u32,
  pub max_auth_attempts: u32,
}

impl Default for Limits {
  fn default() -> Self {
    Self {
      idle_timeout: time::Duration::from_secs(30),
      max_protocol_errors: 8,
      max_auth_attempts: 3,
    }
  }
}

/// A small growable FIFO of bytes queued for the transport; unlike the fixed
/// `Buffer` used for inbound line framing, outbound data (a `RETR`'d
/// message) has no a priori size bound.
#[derive(Default)]
struct Outbox(Vec<u8>);

impl Outbox {
  fn push_str(&mut self, text: &str) {
    self.0.extend_from_slice(text.as_bytes());
  }

  fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  fn drain_into(&mut self, transport: &mut transport::Transport) -> io::Result<()> {
    while !self.0.is_empty() {
      match transport.write(&self.0) {
        Ok(0) => break,
        Ok(n) => {
          self.0.drain(..n);
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
        Err(error) => return Err(error),
      }
    }
    Ok(())
  }
}

impl io::Write for Outbox {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.0.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}

pub struct Connection {
  pub remote_addr: net::SocketAddr,
  pub local_addr: net::SocketAddr,
  pub idstr: String,

  transport: Option<transport::Transport>,
  read_buf: Buffer,
  outbox: Outbox,

  pub state: ConnState,
  session: SessionState,
  idlesince: time::Instant,

  banner_timestamp: String,
  domain: String,

  user: Option<String>,
  secret: Option<String>,
  auth_attempts: u32,
  protocol_errors: u32,
  limits: Limits,

  pub auth: Option<auth::AuthContext>,
  pub mailbox: Option<mailbox::Mailbox>,
  last_retrieved: u32,

  tls_config: Option<Arc<rustls::ServerConfig>>,
  stls_issued: bool,
  capa_stls: bool,
}

impl Connection {
  pub fn new(
    transport: transport::Transport,
    remote_addr: net::SocketAddr,
    local_addr: net::SocketAddr,
    domain: String,
    limits: Limits,
    tls_config: Option<Arc<rustls::ServerConfig>>,
  ) -> Self {
    let banner_timestamp = make_banner_timestamp();
    let idstr = format!("{remote_addr}");
    let capa_stls = tls_config.is_some();
    let mut connection = Self {
      remote_addr,
      local_addr,
      idstr,
      transport: Some(transport),
      read_buf: Buffer::with_capacity(buffer::size()),
      outbox: Outbox::default(),
      state: ConnState::Running,
      session: SessionState::Auth,
      idlesince: time::Instant::now(),
      banner_timestamp,
      domain,
      user: None,
      secret: None,
      auth_attempts: 0,
      protocol_errors: 0,
      limits,
      auth: None,
      mailbox: None,
      last_retrieved: 0,
      tls_config,
      stls_issued: false,
      capa_stls,
    };
    connection.send_banner();
    connection
  }

  fn send_banner(&mut self) {
    let banner = format!("+OK <{}@{}>\r\n", self.banner_timestamp, self.domain);
    self.send_immediate(&banner);
  }

  /// Write straight to the transport, bypassing the outbound queue, for
  /// responses that must reach the wire before a transport-level state
  /// change (the banner, and the `+OK` that precedes an STLS upgrade).
  /// Whatever doesn't fit in one non-blocking write falls back to the
  /// regular queue so it still gets flushed on a later tick.
  fn send_immediate(&mut self, text: &str) {
    let bytes = text.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
      match self.transport.as_mut().expect("transport present").immediate_write(&bytes[written..]) {
        Ok(0) => break,
        Ok(n) => written += n,
        Err(_) => break,
      }
    }
    if written < bytes.len() {
      self.outbox.0.extend_from_slice(&bytes[written..]);
    }
  }

  pub fn is_idle_expired(&self) -> bool {
    self.idlesince.elapsed() >= self.limits.idle_timeout
  }

  pub fn raw_fd(&self) -> std::os::unix::io::RawFd {
    self.transport().raw_fd()
  }

  pub fn pre_select(&self) -> transport::Interest {
    self.transport().pre_select(!self.outbox.is_empty())
  }

  fn transport(&self) -> &transport::Transport {
    self.transport.as_ref().expect("transport always present outside STLS upgrade")
  }

  fn transport_mut(&mut self) -> &mut transport::Transport {
    self.transport.as_mut().expect("transport always present outside STLS upgrade")
  }

  /// Drive transport-level progress (handshake bytes, writes, reads) for
  /// this tick. Returns whether new application bytes are now readable.
  pub fn post_select(&mut self, readable: bool, writable: bool) -> io::Result<bool> {
    if self.state == ConnState::Closed {
      return Ok(false);
    }
    if let Err(error) = self.transport_mut().post_select(readable, writable) {
      self.state = ConnState::Closed;
      return Err(error);
    }
    if !self.outbox.is_empty() {
      if let Err(error) = self.outbox.drain_into(self.transport_mut()) {
        self.state = ConnState::Closed;
        return Err(error);
      }
    }

    let mut read_progress = false;
    loop {
      if self.read_buf.is_full() {
        break;
      }
      match self.transport_mut().read(self.read_buf.write_slice()) {
        Ok(0) => {
          self.state = ConnState::Closing;
          break;
        }
        Ok(n) => {
          self.read_buf.commit(n);
          read_progress = true;
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => break,
        Err(error) => {
          self.state = ConnState::Closed;
          return Err(error);
        }
      }
    }
    Ok(read_progress)
  }

  pub fn shutdown(&mut self) {
    if self.outbox.is_empty() {
      match self.transport_mut().shutdown() {
        Ok(transport::ShutdownStatus::Done) | Err(_) => self.state = ConnState::Closed,
        Ok(transport::ShutdownStatus::Pending) => self.state = ConnState::Closing,
      }
    } else {
      self.state = ConnState::Closing;
    }
  }

  /// Consume whole lines out of the read buffer, dispatching each to the
  /// command table, until no full line remains or a terminal outcome is
  /// reached.
  pub fn pump(&mut self, switch: &mut auth::Switch, server_ip: &str) -> Outcome {
    loop {
      if self.read_buf.overlong() {
        self.queue_line(&pop3::err("line too long"));
        return Outcome::Close;
      }
      let Some(line) = self.read_buf.take_line() else { break };
      match self.dispatch(&line, switch, server_ip) {
        Outcome::Continue => continue,
        other => return other,
      }
    }
    Outcome::Continue
  }

  fn bump_error(&mut self) -> Outcome {
    self.protocol_errors += 1;
    if self.protocol_errors >= self.limits.max_protocol_errors {
      Outcome::Close
    } else {
      Outcome::Continue
    }
  }

  fn queue_line(&mut self, line: &str) {
    self.outbox.push_str(line);
  }

  fn dispatch(&mut self, line: &[u8], switch: &mut auth::Switch, server_ip: &str) -> Outcome {
    let command = pop3::parse(line);
    if !matches!(command, pop3::Command::Noop) {
      self.idlesince = time::Instant::now();
    }
    match self.session {
      SessionState::Auth => self.dispatch_auth(command, switch, server_ip),
      SessionState::Transaction => self.dispatch_transaction(command),
      SessionState::Update => Outcome::Close,
    }
  }

  fn dispatch_auth(&mut self, command: pop3::Command, switch: &mut auth::Switch, server_ip: &str) -> Outcome {
    use pop3::Command::*;
    match command {
      User(name) => {
        if self.user.is_some() {
          self.queue_line(&pop3::err("USER already given"));
          return self.bump_error();
        }
        self.user = Some(name);
        self.queue_line(&pop3::ok("send PASS"));
        Outcome::Continue
      }
      Pass(secret) => {
        let Some(user) = self.user.clone() else {
          self.queue_line(&pop3::err("USER first"));
          return self.bump_error();
        };
        let context = switch.try_user_pass(&user, &secret, &self.remote_addr.ip().to_string(), server_ip);
        self.secret = Some(secret);
        self.finish_auth(context)
      }
      Apop { name, digest } => {
        let timestamp = format!("<{}@{}>", self.banner_timestamp, self.domain);
        let context = switch.try_apop(&name, &timestamp, &digest, &self.remote_addr.ip().to_string(), server_ip);
        self.finish_auth(context)
      }
      Capa => {
        self.queue_line(&pop3::ok("Capability list follows"));
        for capability in ["USER", "TOP", "UIDL", "RESP-CODES", "PIPELINING"] {
          self.queue_line(&pop3::data_line(capability));
        }
        if self.capa_stls && !self.stls_issued {
          self.queue_line(&pop3::data_line("STLS"));
        }
        self.queue_line(pop3::TERMINATOR);
        Outcome::Continue
      }
      Stls => {
        if self.stls_issued || self.tls_config.is_none() {
          self.queue_line(&pop3::err("command not permitted"));
          return self.bump_error();
        }
        // Must reach the client in plaintext before the transport is replaced.
        self.send_immediate(&pop3::ok("begin TLS negotiation"));
        let config = self.tls_config.clone().expect("checked above");
        let transport = self.transport.take().expect("transport present");
        match transport.upgrade_to_tls(config) {
          Ok(upgraded) => {
            self.transport = Some(upgraded);
            self.stls_issued = true;
            self.protocol_errors = 0;
            self.auth_attempts = 0;
            Outcome::Continue
          }
          Err(_) => Outcome::Close,
        }
      }
      Quit => {
        self.queue_line(&pop3::ok("dewey POP3 server signing off"));
        Outcome::Close
      }
      _ => {
        self.queue_line(&pop3::err("command not valid in this state"));
        self.bump_error()
      }
    }
  }

  fn finish_auth(&mut self, context: Option<auth::AuthContext>) -> Outcome {
    if let Some(mut secret) = self.secret.take() {
      use zeroize::Zeroize as _;
      secret.zeroize();
    }
    self.user = None;
    match context {
      Some(context) => Outcome::ForkAndSetuid(Box::new(context)),
      None => {
        self.auth_attempts += 1;
        if self.auth_attempts >= self.limits.max_auth_attempts {
          self.queue_line(&pop3::err("authentication failed; goodbye"));
          Outcome::Close
        } else {
          self.queue_line(&pop3::err("authentication failed"));
          Outcome::Continue
        }
      }
    }
  }

  /// Take the mailbox out of `self` for the duration of command handling so
  /// that error/response helpers can still borrow `self` freely (a `&mut
  /// Mailbox` held directly from `self.mailbox` would otherwise keep all of
  /// `self` borrowed for as long as the match arm needs it).
  fn dispatch_transaction(&mut self, command: pop3::Command) -> Outcome {
    let Some(mut mailbox) = self.mailbox.take() else {
      self.queue_line(&pop3::err("no mailbox"));
      return Outcome::Close;
    };
    let outcome = self.dispatch_with_mailbox(&mut mailbox, command);
    self.mailbox = Some(mailbox);
    outcome
  }

  fn dispatch_with_mailbox(&mut self, mailbox: &mut mailbox::Mailbox, command: pop3::Command) -> Outcome {
    use pop3::Command::*;
    match command {
      Stat => {
        let (count, octets) = mailbox.stat();
        self.queue_line(&pop3::ok(&format!("{count} {octets}")));
        Outcome::Continue
      }
      List(None) => {
        self.queue_line(&pop3::ok("scan listing follows"));
        for (i, entry) in mailbox.index_iter() {
          if !entry.deleted {
            self.queue_line(&pop3::data_line(&format!("{} {}", i + 1, entry.length)));
          }
        }
        self.queue_line(pop3::TERMINATOR);
        Outcome::Continue
      }
      List(Some(n)) => match addressable(mailbox, n) {
        Some(entry) => {
          self.queue_line(&pop3::ok(&format!("{n} {}", entry.length)));
          Outcome::Continue
        }
        None => self.no_such_message(),
      },
      Uidl(None) => {
        self.queue_line(&pop3::ok("unique-id listing follows"));
        for (i, entry) in mailbox.index_iter() {
          if !entry.deleted {
            self.queue_line(&pop3::data_line(&format!("{} {}", i + 1, mailbox::hex_uid(&entry.hash))));
          }
        }
        self.queue_line(pop3::TERMINATOR);
        Outcome::Continue
      }
      Uidl(Some(n)) => match addressable(mailbox, n) {
        Some(entry) => {
          self.queue_line(&pop3::ok(&format!("{n} {}", mailbox::hex_uid(&entry.hash))));
          Outcome::Continue
        }
        None => self.no_such_message(),
      },
      Retr(n) => {
        if addressable(mailbox, n).is_none() {
          return self.no_such_message();
        }
        self.queue_line(&pop3::ok("message follows"));
        if mailbox.send_message((n - 1) as usize, None, &mut self.outbox).is_err() {
          self.queue_line(&pop3::err("error reading message"));
          return self.bump_error();
        }
        self.last_retrieved = self.last_retrieved.max(n);
        Outcome::Continue
      }
      Top { message, lines } => {
        if addressable(mailbox, message).is_none() {
          return self.no_such_message();
        }
        self.queue_line(&pop3::ok("top of message follows"));
        if mailbox.send_message((message - 1) as usize, Some(lines), &mut self.outbox).is_err() {
          self.queue_line(&pop3::err("error reading message"));
          return self.bump_error();
        }
        Outcome::Continue
      }
      Dele(n) => {
        if addressable(mailbox, n).is_none() {
          return self.no_such_message();
        }
        mailbox.mark_deleted((n - 1) as usize);
        self.queue_line(&pop3::ok("message deleted"));
        Outcome::Continue
      }
      Rset => {
        mailbox.reset();
        self.last_retrieved = 0;
        self.queue_line(&pop3::ok("maildrop has been reset"));
        Outcome::Continue
      }
      Noop => {
        self.queue_line(&pop3::ok(""));
        Outcome::Continue
      }
      Last => {
        self.queue_line(&pop3::ok(&self.last_retrieved.to_string()));
        Outcome::Continue
      }
      Quit => {
        self.session = SessionState::Update;
        match mailbox.apply_changes() {
          Ok(()) => {
            self.queue_line(&pop3::ok("dewey POP3 server signing off"));
            Outcome::Close
          }
          Err(error) => {
            log::error!("{}: apply_changes: {error:#}", self.idstr);
            self.queue_line(&pop3::err("couldn't commit changes to the mailbox"));
            Outcome::Close
          }
        }
      }
      _ => {
        self.queue_line(&pop3::err("command not valid in this state"));
        self.bump_error()
      }
    }
  }

  fn no_such_message(&mut self) -> Outcome {
    self.queue_line(&pop3::err("no such message"));
    self.bump_error()
  }

  /// Enter TRANSACTION after a successful fork+setuid, having opened the
  /// mailbox. Queues the "Welcome aboard!" greeting with the message count.
  pub fn enter_transaction(&mut self, context: auth::AuthContext, mailbox: mailbox::Mailbox) {
    let count = mailbox.message_count();
    self.auth = Some(context);
    self.mailbox = Some(mailbox);
    self.session = SessionState::Transaction;
    let greeting = match count {
      0 => "Welcome aboard! You have no messages at all.".to_string(),
      1 => "Welcome aboard! You have exactly one message.".to_string(),
      n => format!("Welcome aboard! You have {n} messages."),
    };
    self.queue_line(&pop3::ok(&greeting));
  }

  /// Queue an error response and mark the connection for closing once it
  /// drains, e.g. a fork or mailbox-open failure in the child, or the
  /// reactor rejecting a connection outright (overload, idle timeout).
  pub fn reject(&mut self, text: &str) {
    self.queue_line(&pop3::err(text));
    self.state = ConnState::Closing;
  }

  /// Alias kept for the fork/setuid handoff call sites, where "reject" reads
  /// oddly for a mailbox-open failure after a successful login.
  pub fn fail_after_fork(&mut self, text: &str) {
    self.reject(text);
  }
}

mod buffer {
  pub fn size() -> usize {
    64 * 1024
  }
}

fn addressable(mailbox: &mailbox::Mailbox, n: u32) -> Option<&mailbox::IndexEntry> {
  if n == 0 {
    return None;
  }
  let entry = mailbox.entry((n - 1) as usize)?;
  (!entry.deleted).then_some(entry)
}

fn make_banner_timestamp() -> String {
  let mut bytes = [0u8; 8];
  rand::thread_rng().fill_bytes(&mut bytes);
  bytes.iter().map(|b| format!("{b:02x}")).collect()
}
