// LDAP driver: binds as a configured search account, locates the user's
// entry by a configurable filter, then re-binds as that entry's DN with the
// supplied password to verify it, mirroring the original's auth_ldap.c
// "search then bind" pattern (simple bind is the only credential check an
// LDAP server offers; there's no portable way to read back a comparable
// secret, so unlike the SQL driver there's no local hash verification path).

use super::{AuthContext, Driver};
use ldap3::{LdapConn, Scope, SearchEntry};

pub struct Ldap {
  url: String,
  bind_dn: String,
  bind_password: String,
  base_dn: String,
  filter_template: String,
  uid_attribute: String,
  home_attribute: String,
  enabled: bool,
}

pub struct Config {
  pub url: String,
  pub bind_dn: String,
  pub bind_password: String,
  pub base_dn: String,
  /// e.g. `(uid=$(user))`.
  pub filter_template: String,
  pub uid_attribute: String,
  pub home_attribute: String,
  pub enabled: bool,
}

impl Ldap {
  pub fn new(config: Config) -> Self {
    Self {
      url: config.url,
      bind_dn: config.bind_dn,
      bind_password: config.bind_password,
      base_dn: config.base_dn,
      filter_template: config.filter_template,
      uid_attribute: config.uid_attribute,
      home_attribute: config.home_attribute,
      enabled: config.enabled,
    }
  }

  fn find_entry(&self, local_part: &str) -> anyhow::Result<Option<SearchEntry>> {
    let mut connection = LdapConn::new(&self.url)?;
    connection.simple_bind(&self.bind_dn, &self.bind_password)?.success()?;
    let filter = self.filter_template.replace("$(user)", local_part);
    let (results, _) = connection
      .search(
        &self.base_dn,
        Scope::Subtree,
        &filter,
        vec![self.uid_attribute.as_str(), self.home_attribute.as_str()],
      )?
      .success()?;
    Ok(results.into_iter().next().map(SearchEntry::construct))
  }
}

impl Driver for Ldap {
  fn name(&self) -> &'static str {
    "ldap"
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
    let local_part = local_part.unwrap_or(user);
    let Some(entry) = self.find_entry(local_part)? else { return Ok(None) };

    let mut verifying = LdapConn::new(&self.url)?;
    if verifying.simple_bind(&entry.dn, secret)?.success().is_err() {
      return Ok(None);
    }

    let uid = entry
      .attrs
      .get(&self.uid_attribute)
      .and_then(|values| values.first())
      .and_then(|value| value.parse::<u32>().ok())
      .ok_or_else(|| anyhow::anyhow!("LDAP entry {} missing numeric {}", entry.dn, self.uid_attribute))?;
    let home = entry
      .attrs
      .get(&self.home_attribute)
      .and_then(|values| values.first())
      .cloned()
      .unwrap_or_else(|| format!("/home/{local_part}"));

    Ok(Some(AuthContext {
      uid,
      gid: uid,
      user: user.to_string(),
      local_part: Some(local_part.to_string()),
      domain: domain.map(str::to_string),
      home,
      mailbox_hint: None,
      driver: None,
    }))
  }
}
