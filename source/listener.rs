// Listening sockets: one per configured `listen-address`, each optionally
// wrapped for TLS from accept onward. Grounded on the original's
// listener.c, including its fallback chain for deriving the domain suffix
// advertised in the APOP greeting banner when no explicit `domain` is
// configured for a listener (reverse DNS, then host aliases, then the
// system's own nodename, then a last-resort sentinel).

use anyhow::Context as _;
use std::{
  net,
  os::unix::io::{AsRawFd as _, RawFd},
  sync::Arc,
};

/// Whether, and how, TLS applies to connections accepted on a listener.
#[derive(Clone)]
pub enum TlsMode {
  Plain,
  /// Starts in plaintext; a client may upgrade in place via STLS.
  Stls(Arc<rustls::ServerConfig>),
  /// TLS from the first byte (e.g. the traditional pop3s port 995); STLS
  /// is not offered since the session is already encrypted.
  Implicit(Arc<rustls::ServerConfig>),
}

impl TlsMode {
  /// The config a freshly accepted connection should carry for an in-place
  /// STLS upgrade later - `None` both for plaintext-only listeners and for
  /// already-TLS implicit ones, since STLS on top of STLS makes no sense.
  pub fn stls_config(&self) -> Option<Arc<rustls::ServerConfig>> {
    match self {
      TlsMode::Stls(config) => Some(config.clone()),
      TlsMode::Plain | TlsMode::Implicit(_) => None,
    }
  }
}

pub struct Listener {
  pub socket: net::TcpListener,
  pub domain: String,
  pub tls_mode: TlsMode,
}

impl Listener {
  pub fn bind(address: &str, domain_override: Option<&str>, tls_mode: TlsMode) -> anyhow::Result<Self> {
    let socket = net::TcpListener::bind(address).with_context(|| format!("binding {address}"))?;
    socket.set_nonblocking(true)?;
    set_reuseaddr(&socket)?;

    let domain = match domain_override {
      Some(domain) => domain.to_string(),
      None => derive_domain_suffix(&socket),
    };

    Ok(Self { socket, domain, tls_mode })
  }

  pub fn raw_fd(&self) -> RawFd {
    self.socket.as_raw_fd()
  }

  pub fn accept(&self) -> io::Result<Option<(net::TcpStream, net::SocketAddr)>> {
    match self.socket.accept() {
      Ok((stream, peer)) => Ok(Some((stream, peer))),
      Err(error) if error.kind() == io::ErrorKind::WouldBlock => Ok(None),
      Err(error) => Err(error),
    }
  }
}

use std::io;

fn set_reuseaddr(socket: &net::TcpListener) -> io::Result<()> {
  let value: libc::c_int = 1;
  let result = unsafe {
    libc::setsockopt(
      socket.as_raw_fd(),
      libc::SOL_SOCKET,
      libc::SO_REUSEADDR,
      &value as *const _ as *const libc::c_void,
      std::mem::size_of_val(&value) as libc::socklen_t,
    )
  };
  if result != 0 {
    return Err(io::Error::last_os_error());
  }
  Ok(())
}

/// Derive a domain suffix for the APOP greeting banner when none is
/// configured: try reverse DNS on the bound address, fall back to the local
/// hostname, and failing that use a sentinel the client can't mistake for a
/// real routable name.
fn derive_domain_suffix(socket: &net::TcpListener) -> String {
  if let Ok(addr) = socket.local_addr() {
    if let Some(name) = reverse_dns(addr.ip()) {
      return name;
    }
  }
  if let Some(name) = local_hostname() {
    return name;
  }
  "x.invalid".to_string()
}

fn reverse_dns(ip: net::IpAddr) -> Option<String> {
  if ip.is_unspecified() || ip.is_loopback() {
    return None;
  }
  let sockaddr = net::SocketAddr::new(ip, 0);
  dns_lookup::lookup_addr(&sockaddr.ip()).ok()
}

fn local_hostname() -> Option<String> {
  let mut buffer = vec![0u8; 256];
  let result = unsafe { libc::gethostname(buffer.as_mut_ptr() as *mut libc::c_char, buffer.len()) };
  if result != 0 {
    return None;
  }
  let len = buffer.iter().position(|&b| b == 0).unwrap_or(buffer.len());
  buffer.truncate(len);
  String::from_utf8(buffer).ok()
}
