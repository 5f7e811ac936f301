// DBM-style driver: a flat key-value store mapping `user` to a
// `uid:gid:home:hash` record, mirroring the original's auth_gdbm.c but
// backed by `sled` (an embedded ordered key-value store already pulled in
// by the pack's sibling POP3 implementation for its own persistent state)
// rather than a vendored gdbm binding.

use super::{AuthContext, Driver};

pub struct Dbm {
  tree: sled::Db,
  enabled: bool,
}

impl Dbm {
  pub fn open(path: &std::path::Path, enabled: bool) -> anyhow::Result<Self> {
    Ok(Self { tree: sled::open(path)?, enabled })
  }
}

impl Driver for Dbm {
  fn name(&self) -> &'static str {
    "dbm"
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
    let Some(record) = self.tree.get(lookup_name)? else { return Ok(None) };
    let record = std::str::from_utf8(&record)?;
    let mut fields = record.splitn(4, ':');
    let uid: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(|| anyhow::anyhow!("malformed dbm record"))?;
    let gid: u32 = fields.next().and_then(|f| f.parse().ok()).ok_or_else(|| anyhow::anyhow!("malformed dbm record"))?;
    let home = fields.next().ok_or_else(|| anyhow::anyhow!("malformed dbm record"))?.to_string();
    let hash = fields.next().ok_or_else(|| anyhow::anyhow!("malformed dbm record"))?;

    if !pwhash::unix::verify(secret, hash) {
      return Ok(None);
    }

    Ok(Some(AuthContext {
      uid,
      gid,
      user: user.to_string(),
      local_part: Some(lookup_name.to_string()),
      domain: domain.map(str::to_string),
      home,
      mailbox_hint: None,
      driver: None,
    }))
  }
}
