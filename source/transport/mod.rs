// Transport abstraction: a byte stream that the reactor can register for
// `select`(2) without caring whether bytes on the wire are plaintext or
// wrapped in TLS. The plaintext leg follows the teacher's `TCP`/`sync::Open`
// split in what was source/lib.rs; the TLS leg generalizes the teacher's
// client-side `TLSStream` (`rustls::ClientConnection` + `ouroboros`) to a
// server-side `rustls::ServerConnection`. rustls's own `wants_read`/
// `wants_write` already fold handshake and shutdown readiness together, so
// those flags don't need to be tracked by hand here.

pub mod tcp;
pub mod tls;

use std::{io, os::unix::io::RawFd};

#[derive(Debug, Clone, Copy, Default)]
pub struct Interest {
  pub read: bool,
  pub write: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
  Done,
  Pending,
}

pub enum Transport {
  Tcp(tcp::Tcp),
  Tls(tls::Tls),
}

impl Transport {
  pub fn raw_fd(&self) -> RawFd {
    match self {
      Transport::Tcp(t) => t.raw_fd(),
      Transport::Tls(t) => t.raw_fd(),
    }
  }

  /// What the reactor should register this fd for, given whether the
  /// caller currently has application bytes queued to write.
  pub fn pre_select(&self, has_pending_write: bool) -> Interest {
    match self {
      Transport::Tcp(t) => t.pre_select(has_pending_write),
      Transport::Tls(t) => t.pre_select(has_pending_write),
    }
  }

  /// Drive any protocol-level I/O (TLS handshake bytes, record framing)
  /// that isn't application data, after `select` reports readiness.
  pub fn post_select(&mut self, readable: bool, writable: bool) -> io::Result<()> {
    match self {
      Transport::Tcp(_) => Ok(()),
      Transport::Tls(t) => t.post_select(readable, writable),
    }
  }

  pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match self {
      Transport::Tcp(t) => t.read(buf),
      Transport::Tls(t) => t.read(buf),
    }
  }

  pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    match self {
      Transport::Tcp(t) => t.write(buf),
      Transport::Tls(t) => t.write(buf),
    }
  }

  /// Write bypassing any queueing the caller does at the connection level -
  /// used for the one-shot greeting banner, which must go out before the
  /// client has sent anything for us to react to.
  pub fn immediate_write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.write(buf)
  }

  /// Begin (or continue) an orderly shutdown. Returns `Pending` while the
  /// transport still has protocol bytes to exchange (e.g. a TLS
  /// close_notify); the caller should keep calling this as the fd becomes
  /// ready until it returns `Done`.
  pub fn shutdown(&mut self) -> io::Result<ShutdownStatus> {
    match self {
      Transport::Tcp(t) => t.shutdown(),
      Transport::Tls(t) => t.shutdown(),
    }
  }

  pub fn upgrade_to_tls(self, config: std::sync::Arc<rustls::ServerConfig>) -> anyhow::Result<Transport> {
    match self {
      Transport::Tcp(t) => Ok(Transport::Tls(tls::Tls::accept(t.into_stream(), config)?)),
      Transport::Tls(_) => anyhow::bail!("TLS already active on this connection"),
    }
  }
}
