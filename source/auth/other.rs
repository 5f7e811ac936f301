// External-process driver: spawns a helper subprocess once per
// authentication attempt and exchanges a tiny framed protocol over its
// stdin/stdout - null-terminated `key\0value\0` pairs, request then
// response, each capped at 4KB - mirroring the original's auth_other.c.
// `TPOP3D_CONTEXT` tells the helper which operation it's being asked to
// perform, since the wire format itself doesn't distinguish APOP from
// USER/PASS.

use super::{AuthContext, Driver};
use std::{
  io::{Read as _, Write as _},
  os::unix::io::AsRawFd as _,
  process, time,
};

const FRAME_CAP: usize = 4096;
const KILL_GRACE: time::Duration = time::Duration::from_millis(500);

pub struct Other {
  command: String,
  args: Vec<String>,
  enabled: bool,
  read_deadline: time::Duration,
}

impl Other {
  pub fn new(command: String, args: Vec<String>, enabled: bool, read_deadline: time::Duration) -> Self {
    Self { command, args, enabled, read_deadline }
  }

  fn run(&self, context: &str, fields: &[(&str, &str)]) -> anyhow::Result<Option<Vec<(String, String)>>> {
    let mut child = process::Command::new(&self.command)
      .args(&self.args)
      .env("PATH", "/bin")
      .env("TPOP3D_CONTEXT", context)
      .stdin(process::Stdio::piped())
      .stdout(process::Stdio::piped())
      .stderr(process::Stdio::null())
      .spawn()?;

    let mut request = Vec::new();
    for (key, value) in fields {
      request.extend_from_slice(key.as_bytes());
      request.push(0);
      request.extend_from_slice(value.as_bytes());
      request.push(0);
    }
    if request.len() > FRAME_CAP {
      anyhow::bail!("external auth request exceeds {FRAME_CAP} bytes");
    }

    let write_result = child.stdin.take().unwrap().write_all(&request);
    if let Err(error) = write_result {
      kill(&mut child);
      return Err(error.into());
    }

    let mut stdout = child.stdout.take().unwrap();
    let response = match read_with_deadline(&mut stdout, self.read_deadline) {
      Ok(bytes) => bytes,
      Err(error) => {
        kill(&mut child);
        return Err(error);
      }
    };

    let status = child.wait()?;
    if !status.success() {
      return Ok(None);
    }
    Ok(Some(parse_frame(&response)))
  }
}

fn kill(child: &mut process::Child) {
  unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
  std::thread::sleep(KILL_GRACE);
  if child.try_wait().ok().flatten().is_none() {
    let _ = child.kill();
  }
  let _ = child.wait();
}

fn read_with_deadline(stdout: &mut process::ChildStdout, deadline: time::Duration) -> anyhow::Result<Vec<u8>> {
  let fd = stdout.as_raw_fd();
  let started = time::Instant::now();
  let mut buffer = Vec::new();
  let mut chunk = [0u8; 512];
  loop {
    let elapsed = started.elapsed();
    if elapsed >= deadline {
      anyhow::bail!("external auth helper timed out");
    }
    let remaining = deadline - elapsed;
    let mut read_fds: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_SET(fd, &mut read_fds) };
    let mut timeout = libc::timeval {
      tv_sec: remaining.as_secs() as libc::time_t,
      tv_usec: remaining.subsec_micros() as libc::suseconds_t,
    };
    let ready = unsafe { libc::select(fd + 1, &mut read_fds, std::ptr::null_mut(), std::ptr::null_mut(), &mut timeout) };
    if ready < 0 {
      return Err(std::io::Error::last_os_error().into());
    }
    if ready == 0 {
      anyhow::bail!("external auth helper timed out");
    }
    let read = stdout.read(&mut chunk)?;
    if read == 0 {
      return Ok(buffer);
    }
    buffer.extend_from_slice(&chunk[..read]);
    if buffer.len() > FRAME_CAP {
      anyhow::bail!("external auth response exceeds {FRAME_CAP} bytes");
    }
  }
}

fn parse_frame(data: &[u8]) -> Vec<(String, String)> {
  let mut fields = Vec::new();
  let mut parts = data.split(|&b| b == 0).map(|s| String::from_utf8_lossy(s).into_owned());
  while let (Some(key), Some(value)) = (parts.next(), parts.next()) {
    if key.is_empty() {
      break;
    }
    fields.push((key, value));
  }
  fields
}

fn context_from_fields(
  fields: &[(String, String)],
  user: &str,
  local_part: Option<&str>,
  domain: Option<&str>,
) -> Option<AuthContext> {
  let get = |key: &str| fields.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());
  if !get("result").is_some_and(|result| result.eq_ignore_ascii_case("yes")) {
    return None;
  }
  let uid: u32 = get("uid")?.parse().ok()?;
  let gid: u32 = get("gid")?.parse().ok()?;
  let home = get("home").unwrap_or("/").to_string();
  let mailbox_hint = get("mailbox").map(str::to_string);
  Some(AuthContext {
    uid,
    gid,
    user: user.to_string(),
    local_part: local_part.map(str::to_string),
    domain: domain.map(str::to_string),
    home,
    mailbox_hint,
    driver: None,
  })
}

impl Driver for Other {
  fn name(&self) -> &'static str {
    "other"
  }

  fn try_apop(
    &self,
    user: &str,
    local_part: Option<&str>,
    domain: Option<&str>,
    timestamp: &str,
    digest: &[u8; 16],
    client_ip: &str,
    server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>> {
    if !self.enabled {
      return Ok(None);
    }
    let digest_hex = crate::pop3::hex_digest(digest);
    let fields = [
      ("user", user),
      ("timestamp", timestamp),
      ("digest", digest_hex.as_str()),
      ("clientip", client_ip),
      ("serverip", server_ip),
    ];
    let Some(response) = self.run("auth_apop", &fields)? else { return Ok(None) };
    Ok(context_from_fields(&response, user, local_part, domain))
  }

  fn try_user_pass(
    &self,
    user: &str,
    local_part: Option<&str>,
    domain: Option<&str>,
    secret: &str,
    client_ip: &str,
    server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>> {
    if !self.enabled {
      return Ok(None);
    }
    let fields = [("user", user), ("pass", secret), ("clientip", client_ip), ("serverip", server_ip)];
    let Some(response) = self.run("auth_other", &fields)? else { return Ok(None) };
    Ok(context_from_fields(&response, user, local_part, domain))
  }
}
