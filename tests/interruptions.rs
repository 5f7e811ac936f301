mod common;

use common::UserSpec;
use std::time::Duration;

#[test_log::test]
fn idle_connection_is_dropped_after_the_configured_timeout() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("alice", "swordfish")], "timeout-seconds: 1")?;
  let mut client = server.connect()?.with_read_timeout(Duration::from_secs(5))?;

  // Sit idle past the 1-second timeout without sending anything.
  let response = client.try_read_line()?;
  assert!(response.is_some(), "server should have closed with a message, not silently");
  let response = response.unwrap();
  assert!(response.starts_with("-ERR"), "unexpected response: {response}");
  assert!(response.contains("idle"), "unexpected response: {response}");

  // The server should follow up by closing the socket.
  let followup = client.try_read_line()?;
  assert!(followup.is_none(), "connection should be closed after the timeout notice");
  Ok(())
}

#[test_log::test]
fn repeated_failed_logins_close_the_connection() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("bob", "hunter2")], "max-auth-attempts: 2")?;
  let mut client = server.connect()?;

  client.command("USER bob")?;
  let first = client.command("PASS wrong1")?;
  assert!(first.starts_with("-ERR"), "unexpected response: {first}");

  client.command("USER bob")?;
  let second = client.command("PASS wrong2")?;
  assert!(second.starts_with("-ERR"), "unexpected response: {second}");

  // The second failure should have hit the limit and closed the connection.
  let after = client.try_read_line()?;
  assert!(after.is_none(), "connection should be closed after exhausting auth attempts");
  Ok(())
}

#[test_log::test]
fn repeated_malformed_commands_close_the_connection() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("carol", "letmein")], "max-protocol-errors: 3")?;
  let mut client = server.connect()?;

  for _ in 0..3 {
    let response = client.command("THIS IS NOT A COMMAND")?;
    assert!(response.starts_with("-ERR"), "unexpected response: {response}");
  }

  let after = client.try_read_line()?;
  assert!(after.is_none(), "connection should be closed after exhausting the protocol error budget");
  Ok(())
}

#[test_log::test]
fn connections_beyond_max_children_are_rejected() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("dave", "opensesame")], "max-children: 1")?;
  server.write_mailbox("dave", b"")?;

  // Authenticating forks a child and counts against max-children; the
  // parent reactor keeps running to accept (and immediately refuse)
  // further connections.
  let mut held = server.connect()?;
  held.command("USER dave")?;
  held.command("PASS opensesame")?;

  // With the one available slot taken, a new connection is refused at
  // accept() time - the socket is closed before a banner is ever sent.
  let refused = server.connect();
  assert!(refused.is_err(), "expected the connection to be refused for lack of a free slot");

  held.command("QUIT")?;
  Ok(())
}
