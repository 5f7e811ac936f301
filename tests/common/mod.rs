// Integration test harness: spawns the real `tpop3d` binary as a subprocess
// against a generated config file and tempdir-backed mailbox, then drives
// it over a plain TCP connection exactly as a client would. Mirrors the way
// the original test suite exercised a real server/client pair rather than
// mocking internals; here there's only one binary to spawn instead of the
// teacher's separate dovecot/notmuch fixtures.

use std::{
  io::{BufRead as _, BufReader, Write as _},
  net, ops, process,
  time::{Duration, Instant},
};

pub struct UserSpec {
  pub name: String,
  pub password: String,
}

impl UserSpec {
  pub fn new(name: &str, password: &str) -> Self {
    Self { name: name.to_string(), password: password.to_string() }
  }
}

struct Child(process::Child);

impl ops::Drop for Child {
  fn drop(&mut self) {
    let _ = self.0.kill();
    let _ = self.0.wait();
  }
}

pub struct Server {
  pub directory: tempfile::TempDir,
  pub port: u16,
  _child: Child,
}

/// Extra raw `key: value\n` lines appended to the generated config, for
/// tests that need a directive beyond the baseline (timeout-seconds, TLS,
/// etc).
pub fn spawn(users: &[UserSpec], extra_config: &str) -> anyhow::Result<Server> {
  let directory = tempfile::tempdir()?;
  let mail_dir = directory.path().join("mail");
  std::fs::create_dir_all(&mail_dir)?;

  let users_db = directory.path().join("users.db");
  {
    let mut file = std::fs::File::create(&users_db)?;
    let uid = unsafe { libc::getuid() };
    let gid = unsafe { libc::getgid() };
    for user in users {
      let hash = pwhash::unix::crypt(&user.password, "$1$tpop3dts$")
        .map_err(|error| anyhow::anyhow!("hashing password for {}: {error}", user.name))?;
      writeln!(file, "{}:{}:{}:{}:{}", user.name, hash, uid, gid, directory.path().display())?;
    }
  }

  let port = portpicker::pick_unused_port().ok_or_else(|| anyhow::anyhow!("no free port"))?;
  let config_path = directory.path().join("tpop3d.conf");
  std::fs::write(
    &config_path,
    format!(
      "listen-address: 127.0.0.1:{port}\n\
       max-children: 10\n\
       mailspool-dir: {mail_dir}\n\
       mailbox: mbox:{mail_dir}/$(user)\n\
       auth-order: flatfile\n\
       auth-flatfile-enable: yes\n\
       auth-flatfile-path: {users_db}\n\
       {extra_config}\n",
      mail_dir = mail_dir.display(),
      users_db = users_db.display(),
    ),
  )?;

  let child = process::Command::new(env!("CARGO_BIN_EXE_tpop3d"))
    .arg("-d")
    .arg("-f")
    .arg(&config_path)
    .spawn()
    .map_err(|error| anyhow::anyhow!("spawning tpop3d: {error}"))?;

  wait_for_port(port)?;

  Ok(Server { directory, port, _child: Child(child) })
}

fn wait_for_port(port: u16) -> anyhow::Result<()> {
  let deadline = Instant::now() + Duration::from_secs(5);
  loop {
    if net::TcpStream::connect(("127.0.0.1", port)).is_ok() {
      return Ok(());
    }
    if Instant::now() >= deadline {
      anyhow::bail!("tpop3d never started listening on port {port}");
    }
    std::thread::sleep(Duration::from_millis(50));
  }
}

impl Server {
  /// Path of the mbox file a flatfile user's mailbox resolves to.
  pub fn mailbox_path(&self, user: &str) -> std::path::PathBuf {
    self.directory.path().join("mail").join(user)
  }

  pub fn write_mailbox(&self, user: &str, contents: &[u8]) -> anyhow::Result<()> {
    std::fs::write(self.mailbox_path(user), contents)?;
    Ok(())
  }

  pub fn connect(&self) -> anyhow::Result<Pop3Client> {
    let stream = net::TcpStream::connect(("127.0.0.1", self.port))?;
    Pop3Client::new(stream)
  }
}

pub struct Pop3Client {
  stream: net::TcpStream,
  reader: BufReader<net::TcpStream>,
  pub banner: String,
}

impl Pop3Client {
  fn new(stream: net::TcpStream) -> anyhow::Result<Self> {
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let reader = BufReader::new(stream.try_clone()?);
    let mut client = Self { stream, reader, banner: String::new() };
    client.banner = client.read_line()?;
    Ok(client)
  }

  pub fn with_read_timeout(self, timeout: Duration) -> anyhow::Result<Self> {
    self.stream.set_read_timeout(Some(timeout))?;
    Ok(self)
  }

  fn read_line(&mut self) -> anyhow::Result<String> {
    let mut line = String::new();
    let n = self.reader.read_line(&mut line)?;
    anyhow::ensure!(n > 0, "connection closed unexpectedly while reading a line");
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
  }

  /// Read one line without failing if the connection is already closed -
  /// used to assert a connection was dropped rather than kept open.
  pub fn try_read_line(&mut self) -> anyhow::Result<Option<String>> {
    let mut line = String::new();
    let n = self.reader.read_line(&mut line)?;
    if n == 0 {
      return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
  }

  pub fn send(&mut self, line: &str) -> anyhow::Result<()> {
    write!(self.stream, "{line}\r\n")?;
    Ok(())
  }

  pub fn command(&mut self, line: &str) -> anyhow::Result<String> {
    self.send(line)?;
    self.read_line()
  }

  pub fn multiline(&mut self) -> anyhow::Result<Vec<String>> {
    let mut lines = Vec::new();
    loop {
      let line = self.read_line()?;
      if line == "." {
        break;
      }
      lines.push(line);
    }
    Ok(lines)
  }

  pub fn command_multiline(&mut self, line: &str) -> anyhow::Result<(String, Vec<String>)> {
    let status = self.command(line)?;
    let body = self.multiline()?;
    Ok((status, body))
  }

  /// The `<hex@domain>` portion of the banner, needed to compute an APOP digest.
  pub fn banner_timestamp(&self) -> &str {
    self.banner.trim_start_matches("+OK ")
  }
}
