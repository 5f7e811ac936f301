// Flat-file driver: a passwd(5)-like text file of
// `user:hash:uid:gid:home[:mailbox]` lines, reparsed on every lookup (these
// files are small and change rarely enough that caching isn't worth the
// staleness risk), mirroring the original's auth_other.c sibling
// auth_flatfile.c.

use super::{AuthContext, Driver};
use std::{fs, path};

pub struct Flatfile {
  path: path::PathBuf,
  enabled: bool,
}

impl Flatfile {
  pub fn new(path: path::PathBuf, enabled: bool) -> Self {
    Self { path, enabled }
  }

  fn find(&self, name: &str) -> anyhow::Result<Option<Record>> {
    let contents = fs::read_to_string(&self.path)?;
    for line in contents.lines() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let mut fields = line.splitn(6, ':');
      let entry_user = fields.next().unwrap_or("");
      if entry_user != name {
        continue;
      }
      let hash = fields.next().unwrap_or("").to_string();
      let uid: u32 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
      let gid: u32 = fields.next().and_then(|f| f.parse().ok()).unwrap_or(0);
      let home = fields.next().unwrap_or("").to_string();
      let mailbox = fields.next().filter(|s| !s.is_empty()).map(str::to_string);
      return Ok(Some(Record { hash, uid, gid, home, mailbox }));
    }
    Ok(None)
  }
}

struct Record {
  hash: String,
  uid: u32,
  gid: u32,
  home: String,
  mailbox: Option<String>,
}

impl Driver for Flatfile {
  fn name(&self) -> &'static str {
    "flatfile"
  }

  fn try_apop(
    &self,
    _user: &str,
    _local_part: Option<&str>,
    _domain: Option<&str>,
    _timestamp: &str,
    _digest: &[u8; 16],
    _client_ip: &str,
    _server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>> {
    Ok(None)
  }

  fn try_user_pass(
    &self,
    user: &str,
    local_part: Option<&str>,
    domain: Option<&str>,
    secret: &str,
    _client_ip: &str,
    _server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>> {
    if !self.enabled {
      return Ok(None);
    }
    let lookup_name = local_part.unwrap_or(user);
    let Some(record) = self.find(lookup_name)? else { return Ok(None) };
    if !pwhash::unix::verify(secret, &record.hash) {
      return Ok(None);
    }
    Ok(Some(AuthContext {
      uid: record.uid,
      gid: record.gid,
      user: user.to_string(),
      local_part: Some(lookup_name.to_string()),
      domain: domain.map(str::to_string),
      home: record.home,
      mailbox_hint: record.mailbox,
      driver: None,
    }))
  }
}
