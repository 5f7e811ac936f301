mod common;

use common::UserSpec;

#[test_log::test]
fn a_second_session_is_refused_while_the_mailbox_is_locked() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("alice", "swordfish")], "")?;
  server.write_mailbox("alice", b"From a@b Mon Jan 01 00:00:00 2024\r\nSubject: one\r\n\r\nbody\r\n")?;

  // First session authenticates and stays in TRANSACTION, holding the
  // mbox lock open for as long as the connection lives.
  let mut first = server.connect()?;
  first.command("USER alice")?;
  let greeting = first.command("PASS swordfish")?;
  assert!(greeting.starts_with("+OK"), "unexpected greeting: {greeting}");

  // A second session against the same mailbox must fail to acquire the
  // lock and be told so, rather than being handed a half-open maildrop.
  let mut second = server.connect()?;
  second.command("USER alice")?;
  let response = second.command("PASS swordfish")?;
  assert!(response.starts_with("-ERR"), "unexpected response: {response}");
  assert!(response.contains("locked"), "unexpected response: {response}");

  // The second connection should then be closed rather than left in
  // AUTHORIZATION state.
  let after = second.try_read_line()?;
  assert!(after.is_none(), "second connection should be closed after the lock failure");

  first.command("QUIT")?;
  Ok(())
}

#[test_log::test]
fn the_lock_is_released_once_the_first_session_quits() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("bob", "hunter2")], "")?;
  server.write_mailbox("bob", b"")?;

  let mut first = server.connect()?;
  first.command("USER bob")?;
  first.command("PASS hunter2")?;
  first.command("QUIT")?;

  // Give the forked child a moment to exit and release its file lock.
  std::thread::sleep(std::time::Duration::from_millis(200));

  let mut second = server.connect()?;
  second.command("USER bob")?;
  let response = second.command("PASS hunter2")?;
  assert!(response.starts_with("+OK"), "second session should succeed once the lock is released: {response}");
  second.command("QUIT")?;
  Ok(())
}
