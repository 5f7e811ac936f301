// System password database driver: authenticates against `getpwnam`/shadow
// via the `users` crate and verifies secrets with crypt(3)-compatible
// hashes via `pwhash`, mirroring the original's auth_passwd.c /
// auth_passwd_fake_hash fallback for unknown users (to avoid leaking
// account existence through timing).

use super::{AuthContext, Driver};
use std::sync::atomic::{AtomicBool, Ordering};

pub struct Passwd {
  enabled: AtomicBool,
}

impl Passwd {
  pub fn new(enabled: bool) -> Self {
    Self { enabled: AtomicBool::new(enabled) }
  }
}

impl Driver for Passwd {
  fn name(&self) -> &'static str {
    "passwd"
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
    // The system password database only ever stores a crypt(3) hash, which
    // cannot reproduce an MD5(timestamp + cleartext) digest: APOP is
    // structurally unsupported by this driver, same as the original.
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
    if !self.enabled.load(Ordering::Relaxed) {
      return Ok(None);
    }
    let lookup_name = local_part.unwrap_or(user);
    let Some(account) = users::get_user_by_name(lookup_name) else {
      // Run the hash comparison anyway against a fixed dummy hash so a
      // nonexistent account takes the same time as a wrong password.
      let _ = pwhash::unix::verify(secret, "$1$00000000$xxxxxxxxxxxxxxxxxxxxxx");
      return Ok(None);
    };

    let hash = shadow_hash(lookup_name)?;
    let Some(hash) = hash else { return Ok(None) };
    if !pwhash::unix::verify(secret, &hash) {
      return Ok(None);
    }

    Ok(Some(AuthContext {
      uid: account.uid(),
      gid: account.primary_group_id(),
      user: user.to_string(),
      local_part: local_part.map(str::to_string),
      domain: domain.map(str::to_string),
      home: account.home_dir().to_string_lossy().into_owned(),
      mailbox_hint: None,
      driver: None,
    }))
  }

  fn post_fork(&self) {
    // Re-open any cached database handle; the `users` crate keeps none, so
    // there is nothing to do, but shadow-reading drivers built on a
    // long-lived file handle would reopen it here.
  }
}

/// Look up the shadow (or passwd, if shadow is unreadable post-privilege-
/// drop) hash for `name`. Returns `Ok(None)` for an unknown account.
fn shadow_hash(name: &str) -> anyhow::Result<Option<String>> {
  match std::fs::read_to_string("/etc/shadow") {
    Ok(contents) => Ok(contents
      .lines()
      .find_map(|line| {
        let mut fields = line.split(':');
        let entry_name = fields.next()?;
        let hash = fields.next()?;
        (entry_name == name).then(|| hash.to_string())
      })),
    Err(_) => Ok(None),
  }
}
