mod common;

use common::UserSpec;
use md5::{Digest as _, Md5};

fn apop_digest_hex(timestamp: &str, password: &str) -> String {
  let mut hasher = Md5::new();
  hasher.update(timestamp.as_bytes());
  hasher.update(password.as_bytes());
  let digest: [u8; 16] = hasher.finalize().into();
  digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

// None of the built-in storage-backed drivers (flatfile, dbm, sql, ldap,
// passwd) can support APOP - they only ever hold a hashed or externally
// verified secret, never the cleartext needed to reproduce the
// MD5(timestamp + secret) challenge. Only the external-process driver can,
// by delegating the computation to a helper that knows the cleartext. With
// just flatfile configured, APOP must always be declined.

#[test_log::test]
fn apop_is_declined_by_a_flatfile_only_configuration() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("alice", "swordfish")], "")?;
  let mut client = server.connect()?;

  let timestamp = client.banner_timestamp().to_string();
  let digest_hex = apop_digest_hex(&timestamp, "swordfish");

  let response = client.command(&format!("APOP alice {digest_hex}"))?;
  assert!(response.starts_with("-ERR"), "unexpected response: {response}");
  assert!(response.contains("authentication failed"), "unexpected response: {response}");
  Ok(())
}

#[test_log::test]
fn repeated_apop_failures_share_the_authentication_attempt_budget() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("bob", "hunter2")], "max-auth-attempts: 2")?;
  let mut client = server.connect()?;

  let bogus_digest = "00000000000000000000000000000000";
  let first = client.command(&format!("APOP bob {bogus_digest}"))?;
  assert!(first.starts_with("-ERR"), "unexpected response: {first}");

  let second = client.command(&format!("APOP bob {bogus_digest}"))?;
  assert!(second.starts_with("-ERR"), "unexpected response: {second}");

  let after = client.try_read_line()?;
  assert!(after.is_none(), "connection should be closed after exhausting auth attempts via APOP");
  Ok(())
}
