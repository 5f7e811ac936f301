use super::{Interest, ShutdownStatus};
use std::{
  io,
  net,
  os::unix::io::{AsRawFd as _, RawFd},
};

pub struct Tcp {
  stream: net::TcpStream,
}

impl Tcp {
  pub fn new(stream: net::TcpStream) -> io::Result<Self> {
    stream.set_nonblocking(true)?;
    Ok(Self { stream })
  }

  pub fn into_stream(self) -> net::TcpStream {
    self.stream
  }

  pub fn raw_fd(&self) -> RawFd {
    self.stream.as_raw_fd()
  }

  pub fn pre_select(&self, has_pending_write: bool) -> Interest {
    Interest { read: true, write: has_pending_write }
  }

  pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    io::Read::read(&mut self.stream, buf)
  }

  pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    io::Write::write(&mut self.stream, buf)
  }

  pub fn shutdown(&mut self) -> io::Result<ShutdownStatus> {
    match self.stream.shutdown(net::Shutdown::Write) {
      Ok(()) => Ok(ShutdownStatus::Done),
      Err(error) if error.kind() == io::ErrorKind::NotConnected => Ok(ShutdownStatus::Done),
      Err(error) => Err(error),
    }
  }
}
