// Auth-result cache: an open-addressing, power-of-two hash table keyed on
// the MD5 of the concatenated credential tuple, mirroring the original's
// authcache.c. Successful USER/PASS authentications are cached for a
// configurable lifetime so that clients that poll frequently (common POP3
// behaviour) don't re-run an expensive driver (SQL/LDAP/external-process) on
// every connection. APOP results are never cached: the challenge is
// single-use by construction, so a cached digest could never be replayed.

use super::AuthContext;
use md5::{Digest as _, Md5};
use std::time::{Duration, Instant};

const DEFAULT_LIFETIME: Duration = Duration::from_secs(3600);
const INITIAL_BITS: u32 = 4; // 16 slots

struct Slot {
  key: [u8; 16],
  context: AuthContext,
  driver: String,
  inserted_at: Instant,
}

pub struct Cache {
  slots: Vec<Option<Slot>>,
  bits: u32,
  count: usize,
  lifetime: Duration,
}

impl Cache {
  pub fn new(lifetime: Duration) -> Self {
    let bits = INITIAL_BITS;
    Self { slots: new_slots(bits), bits, count: 0, lifetime }
  }

  pub fn lookup(
    &mut self,
    user: &str,
    local_part: &str,
    domain: Option<&str>,
    secret: &str,
    client_ip: &str,
    server_ip: &str,
  ) -> Option<AuthContext> {
    let key = make_key(user, local_part, domain, secret, client_ip, server_ip);
    let mask = self.mask();
    let mut index = hash_index(&key, self.bits);
    for _ in 0..self.slots.len() {
      match &self.slots[index] {
        Some(slot) if slot.key == key => {
          if slot.inserted_at.elapsed() > self.lifetime {
            self.remove_at(index);
            return None;
          }
          let mut context = slot.context.clone();
          context.driver = Some(format!("{}+cache", slot.driver));
          return Some(context);
        }
        Some(_) => {
          index = (index + 1) & mask;
          continue;
        }
        None => return None,
      }
    }
    None
  }

  pub fn save(
    &mut self,
    user: &str,
    local_part: &str,
    domain: Option<&str>,
    secret: &str,
    client_ip: &str,
    server_ip: &str,
    context: &AuthContext,
    driver: &str,
  ) {
    if self.count + 1 >= self.slots.len() {
      self.grow();
    }
    let key = make_key(user, local_part, domain, secret, client_ip, server_ip);
    let mask = self.mask();
    let mut index = hash_index(&key, self.bits);
    while self.slots[index].is_some() {
      index = (index + 1) & mask;
    }
    self.slots[index] =
      Some(Slot { key, context: context.clone(), driver: driver.to_string(), inserted_at: Instant::now() });
    self.count += 1;
  }

  /// Drop cached credentials after `fork`: the child only ever needs the one
  /// context it was handed, and holding secrets around longer than necessary
  /// is unwelcome in a process about to drop privileges.
  pub fn forget(&mut self) {
    self.slots = new_slots(self.bits);
    self.count = 0;
  }

  fn mask(&self) -> usize {
    self.slots.len() - 1
  }

  fn grow(&mut self) {
    let old = std::mem::replace(&mut self.slots, Vec::new());
    self.bits += 1;
    self.slots = new_slots(self.bits);
    self.count = 0;
    let mask = self.mask();
    for slot in old.into_iter().flatten() {
      let mut index = hash_index(&slot.key, self.bits);
      while self.slots[index].is_some() {
        index = (index + 1) & mask;
      }
      self.slots[index] = Some(slot);
      self.count += 1;
    }
  }

  /// Remove the entry at `index` and close the open-addressing probe chain
  /// behind it by shuffling forward any entry that would otherwise become
  /// unreachable, exactly as the original's cache removal does.
  fn remove_at(&mut self, index: usize) {
    let mask = self.mask();
    self.slots[index] = None;
    self.count -= 1;
    let mut hole = index;
    let mut probe = (index + 1) & mask;
    while let Some(slot) = &self.slots[probe] {
      let ideal = hash_index(&slot.key, self.bits);
      let distance_to_hole = (hole as isize - ideal as isize).rem_euclid(self.slots.len() as isize);
      let distance_to_probe = (probe as isize - ideal as isize).rem_euclid(self.slots.len() as isize);
      if distance_to_hole <= distance_to_probe {
        self.slots.swap(hole, probe);
        hole = probe;
      }
      probe = (probe + 1) & mask;
    }
  }
}

fn new_slots(bits: u32) -> Vec<Option<Slot>> {
  let mut slots = Vec::with_capacity(1 << bits);
  slots.resize_with(1 << bits, || None);
  slots
}

fn hash_index(key: &[u8; 16], bits: u32) -> usize {
  let leading = u32::from_be_bytes([key[0], key[1], key[2], key[3]]);
  (leading >> (32 - bits)) as usize
}

fn make_key(user: &str, local_part: &str, domain: Option<&str>, secret: &str, client_ip: &str, server_ip: &str) -> [u8; 16] {
  let mut hasher = Md5::new();
  for part in [user, local_part, domain.unwrap_or(""), secret, client_ip, server_ip] {
    hasher.update(part.as_bytes());
    hasher.update([0u8]);
  }
  hasher.finalize().into()
}

impl Default for Cache {
  fn default() -> Self {
    Self::new(DEFAULT_LIFETIME)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn context(uid: u32) -> AuthContext {
    AuthContext {
      uid,
      gid: uid,
      user: "alice".to_string(),
      local_part: None,
      domain: None,
      home: "/home/alice".to_string(),
      mailbox_hint: None,
      driver: None,
    }
  }

  #[test]
  fn saves_and_finds_entries() {
    let mut cache = Cache::new(Duration::from_secs(60));
    cache.save("alice", "alice", None, "secret", "127.0.0.1", "127.0.0.1", &context(500), "passwd");
    let found = cache.lookup("alice", "alice", None, "secret", "127.0.0.1", "127.0.0.1");
    assert!(found.is_some());
    assert_eq!(found.unwrap().driver.as_deref(), Some("passwd+cache"));
  }

  #[test]
  fn misses_on_wrong_secret() {
    let mut cache = Cache::new(Duration::from_secs(60));
    cache.save("alice", "alice", None, "secret", "127.0.0.1", "127.0.0.1", &context(500), "passwd");
    assert!(cache.lookup("alice", "alice", None, "wrong", "127.0.0.1", "127.0.0.1").is_none());
  }

  #[test]
  fn expires_stale_entries() {
    let mut cache = Cache::new(Duration::from_millis(1));
    cache.save("alice", "alice", None, "secret", "127.0.0.1", "127.0.0.1", &context(500), "passwd");
    std::thread::sleep(Duration::from_millis(5));
    assert!(cache.lookup("alice", "alice", None, "secret", "127.0.0.1", "127.0.0.1").is_none());
  }

  #[test]
  fn grows_and_keeps_all_entries_reachable() {
    let mut cache = Cache::new(Duration::from_secs(60));
    for i in 0..40u32 {
      let user = i.to_string();
      cache.save(&user, &user, None, "secret", "127.0.0.1", "127.0.0.1", &context(i), "passwd");
    }
    for i in 0..40u32 {
      let user = i.to_string();
      assert!(cache.lookup(&user, &user, None, "secret", "127.0.0.1", "127.0.0.1").is_some(), "missing {i}");
    }
  }

  #[test]
  fn removal_keeps_probe_chain_reachable() {
    let mut cache = Cache::new(Duration::from_millis(1));
    cache.save("a", "a", None, "secret", "127.0.0.1", "127.0.0.1", &context(1), "passwd");
    cache.save("b", "b", None, "secret", "127.0.0.1", "127.0.0.1", &context(2), "passwd");
    std::thread::sleep(Duration::from_millis(5));
    // Expiring "a" (if it collides with "b"'s slot) must not strand "b".
    cache.lookup("a", "a", None, "secret", "127.0.0.1", "127.0.0.1");
    cache.lifetime = Duration::from_secs(60);
    cache.save("b", "b", None, "secret", "127.0.0.1", "127.0.0.1", &context(2), "passwd");
    assert!(cache.lookup("b", "b", None, "secret", "127.0.0.1", "127.0.0.1").is_some());
  }
}
