// Authentication switch: a chain-of-responsibility over several
// authenticators, fronted by a result cache. Drivers are tried in
// configured order; the first non-null context wins and every enabled
// driver is then given a fire-and-forget `on_login` notification,
// mirroring the original's authswitch.c.

pub mod cache;
pub mod dbm;
pub mod flatfile;
pub mod ldap;
pub mod other;
pub mod passwd;
pub mod sql;

#[derive(Debug, Clone)]
pub struct AuthContext {
  pub uid: u32,
  pub gid: u32,
  pub user: String,
  pub local_part: Option<String>,
  pub domain: Option<String>,
  pub home: String,
  /// A driver-supplied mailbox location hint (`[driver:]path` template).
  pub mailbox_hint: Option<String>,
  /// Name of the driver that produced this context, possibly suffixed
  /// `+cache` when served from the auth cache.
  pub driver: Option<String>,
}

pub trait Driver: Send + Sync {
  fn name(&self) -> &'static str;

  fn try_apop(
    &self,
    user: &str,
    local_part: Option<&str>,
    domain: Option<&str>,
    timestamp: &str,
    digest: &[u8; 16],
    client_ip: &str,
    server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>>;

  fn try_user_pass(
    &self,
    user: &str,
    local_part: Option<&str>,
    domain: Option<&str>,
    secret: &str,
    client_ip: &str,
    server_ip: &str,
  ) -> anyhow::Result<Option<AuthContext>>;

  fn on_login(&self, _context: &AuthContext, _client_ip: &str, _server_ip: &str) {}

  /// Reinitialise per-process state after `fork`; called once in the child.
  fn post_fork(&self) {}

  fn close(&self) {}
}

/// Split `user@domain`, `user%domain` or `user!domain` into parts. Absent a
/// separator, `local_part` is the whole input and `domain` falls back to
/// `default_domain` (the configured `append-domain`, or empty).
pub fn decompose<'a>(user: &'a str, default_domain: Option<&'a str>) -> (&'a str, Option<&'a str>) {
  match user.find(['@', '%', '!']) {
    Some(index) => (&user[..index], Some(&user[index + 1..])),
    None => (user, default_domain),
  }
}

pub struct Switch {
  drivers: Vec<Box<dyn Driver>>,
  cache: Option<cache::Cache>,
  default_domain: Option<String>,
  /// Whether the auth cache key includes the client's address; disabling
  /// this lets a client behind a changing NAT address still hit the cache.
  cache_use_client_host: bool,
}

impl Switch {
  pub fn new(
    drivers: Vec<Box<dyn Driver>>,
    cache: Option<cache::Cache>,
    default_domain: Option<String>,
    cache_use_client_host: bool,
  ) -> Self {
    Self { drivers, cache, default_domain, cache_use_client_host }
  }

  fn cache_client_ip<'a>(&self, client_ip: &'a str) -> &'a str {
    if self.cache_use_client_host {
      client_ip
    } else {
      ""
    }
  }

  pub fn try_apop(
    &mut self,
    user: &str,
    timestamp: &str,
    digest: &[u8; 16],
    client_ip: &str,
    server_ip: &str,
  ) -> Option<AuthContext> {
    let (local_part, domain) = decompose(user, self.default_domain.as_deref());
    for driver in &self.drivers {
      match driver.try_apop(user, Some(local_part), domain, timestamp, digest, client_ip, server_ip) {
        Ok(Some(mut context)) => {
          context.driver = Some(driver.name().to_string());
          self.notify_login(&context, client_ip, server_ip);
          return Some(context);
        }
        Ok(None) => continue,
        Err(error) => {
          log::warn!("auth driver {} failed: {error:#}", driver.name());
          continue;
        }
      }
    }
    None
  }

  pub fn try_user_pass(
    &mut self,
    user: &str,
    secret: &str,
    client_ip: &str,
    server_ip: &str,
  ) -> Option<AuthContext> {
    let (local_part, domain) = decompose(user, self.default_domain.as_deref());
    let cache_client_ip = self.cache_client_ip(client_ip);

    if let Some(cache) = &mut self.cache {
      if let Some(context) = cache.lookup(user, local_part, domain, secret, cache_client_ip, server_ip) {
        return Some(context);
      }
    }

    for driver in &self.drivers {
      match driver.try_user_pass(user, Some(local_part), domain, secret, client_ip, server_ip) {
        Ok(Some(mut context)) => {
          context.driver = Some(driver.name().to_string());
          if let Some(cache) = &mut self.cache {
            cache.save(user, local_part, domain, secret, cache_client_ip, server_ip, &context, driver.name());
          }
          self.notify_login(&context, client_ip, server_ip);
          return Some(context);
        }
        Ok(None) => continue,
        Err(error) => {
          log::warn!("auth driver {} failed: {error:#}", driver.name());
          continue;
        }
      }
    }
    None
  }

  fn notify_login(&self, context: &AuthContext, client_ip: &str, server_ip: &str) {
    for driver in &self.drivers {
      driver.on_login(context, client_ip, server_ip);
    }
  }

  pub fn post_fork(&mut self) {
    for driver in &self.drivers {
      driver.post_fork();
    }
    if let Some(cache) = &mut self.cache {
      cache.forget();
    }
  }

  pub fn close(&self) {
    for driver in &self.drivers {
      driver.close();
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn decomposes_on_first_separator() {
    assert_eq!(decompose("alice@example.com", None), ("alice", Some("example.com")));
    assert_eq!(decompose("alice%example.com", None), ("alice", Some("example.com")));
    assert_eq!(decompose("alice!example.com", None), ("alice", Some("example.com")));
    assert_eq!(decompose("alice", None), ("alice", None));
  }

  #[test]
  fn falls_back_to_configured_domain() {
    assert_eq!(decompose("alice", Some("example.com")), ("alice", Some("example.com")));
    assert_eq!(decompose("alice@other.com", Some("example.com")), ("alice", Some("other.com")));
  }
}
