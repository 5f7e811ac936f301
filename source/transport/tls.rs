use super::{Interest, ShutdownStatus};
use std::{
  io,
  net,
  os::unix::io::{AsRawFd as _, RawFd},
  sync::Arc,
};

pub struct Tls {
  stream: net::TcpStream,
  connection: rustls::ServerConnection,
  sent_close_notify: bool,
}

impl Tls {
  pub fn accept(stream: net::TcpStream, config: Arc<rustls::ServerConfig>) -> anyhow::Result<Self> {
    Ok(Self {
      stream,
      connection: rustls::ServerConnection::new(config)?,
      sent_close_notify: false,
    })
  }

  pub fn raw_fd(&self) -> RawFd {
    self.stream.as_raw_fd()
  }

  pub fn pre_select(&self, has_pending_write: bool) -> Interest {
    Interest {
      read: self.connection.wants_read(),
      write: self.connection.wants_write() || has_pending_write,
    }
  }

  /// Exchange any TLS record bytes the previous `select` round found ready,
  /// independent of whatever application data accompanies them. Handshake
  /// progress, renegotiation and close_notify framing all flow through
  /// here; `read`/`write` only ever see the decrypted plaintext.
  pub fn post_select(&mut self, readable: bool, writable: bool) -> io::Result<()> {
    if writable && self.connection.wants_write() {
      self.connection.write_tls(&mut self.stream)?;
    }
    if readable && self.connection.wants_read() {
      match self.connection.read_tls(&mut self.stream) {
        Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "TLS peer closed connection")),
        Ok(_) => {
          if let Err(error) = self.connection.process_new_packets() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, error));
          }
        }
        Err(error) if error.kind() == io::ErrorKind::WouldBlock => {}
        Err(error) => return Err(error),
      }
    }
    Ok(())
  }

  pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    match io::Read::read(&mut self.connection.reader(), buf) {
      // rustls reports a clean close_notify as a zero-size read via this
      // specific error kind; the reactor treats it the same as a plain EOF.
      Err(error) if error.kind() == io::ErrorKind::ConnectionAborted => Ok(0),
      other => other,
    }
  }

  pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    io::Write::write(&mut self.connection.writer(), buf)
  }

  pub fn shutdown(&mut self) -> io::Result<ShutdownStatus> {
    if !self.sent_close_notify {
      self.connection.send_close_notify();
      self.sent_close_notify = true;
    }
    if self.connection.wants_write() {
      self.connection.write_tls(&mut self.stream)?;
    }
    if self.connection.wants_write() {
      return Ok(ShutdownStatus::Pending);
    }
    Ok(ShutdownStatus::Done)
  }
}
