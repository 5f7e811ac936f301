mod common;

use common::UserSpec;
use pretty_assertions::assert_eq;

fn message(id: &str) -> String {
  format!("From: {id}@example.com\r\nTo: nobody@example.com\r\nSubject: {id}\r\n\r\nbody of {id}\r\n")
}

fn mbox(messages: &[&str]) -> Vec<u8> {
  let mut out = Vec::new();
  for (i, message) in messages.iter().enumerate() {
    out.extend_from_slice(format!("From test@example.com Mon Jan {:02} 00:00:00 2024\r\n", i + 1).as_bytes());
    out.extend_from_slice(message.as_bytes());
  }
  out
}

#[test_log::test]
fn user_pass_authenticates_and_enters_transaction() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("alice", "swordfish")], "")?;
  server.write_mailbox("alice", &mbox(&[&message("one"), &message("two")]))?;

  let mut client = server.connect()?;
  assert!(client.banner.starts_with("+OK "));
  assert_eq!(client.command("USER alice")?, "+OK send PASS");
  let greeting = client.command("PASS swordfish")?;
  assert!(greeting.starts_with("+OK"), "unexpected greeting: {greeting}");
  assert!(greeting.contains("2 messages"), "unexpected greeting: {greeting}");

  assert_eq!(client.command("QUIT")?, "+OK dewey POP3 server signing off");
  Ok(())
}

#[test_log::test]
fn wrong_password_is_rejected() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("alice", "swordfish")], "")?;
  server.write_mailbox("alice", &mbox(&[]))?;

  let mut client = server.connect()?;
  client.command("USER alice")?;
  let response = client.command("PASS wrong")?;
  assert!(response.starts_with("-ERR"), "unexpected response: {response}");
  Ok(())
}

#[test_log::test]
fn stat_list_uidl_and_retr_round_trip() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("bob", "hunter2")], "")?;
  let one = message("one");
  let two = message("two");
  server.write_mailbox("bob", &mbox(&[&one, &two]))?;

  let mut client = server.connect()?;
  client.command("USER bob")?;
  client.command("PASS hunter2")?;

  let stat = client.command("STAT")?;
  assert!(stat.starts_with("+OK 2 "), "unexpected STAT response: {stat}");

  let (status, listing) = client.command_multiline("LIST")?;
  assert_eq!(status, "+OK scan listing follows");
  assert_eq!(listing.len(), 2);
  assert!(listing[0].starts_with("1 "));
  assert!(listing[1].starts_with("2 "));

  let (status, uids) = client.command_multiline("UIDL")?;
  assert_eq!(status, "+OK unique-id listing follows");
  assert_eq!(uids.len(), 2);
  assert_ne!(uids[0].split(' ').nth(1), uids[1].split(' ').nth(1));

  let (status, body) = client.command_multiline("RETR 1")?;
  assert_eq!(status, "+OK message follows");
  assert!(body.iter().any(|line| line == "Subject: one"));
  assert!(body.iter().any(|line| line == "body of one"));

  client.command("QUIT")?;
  Ok(())
}

#[test_log::test]
fn dele_is_visible_only_after_quit_commits() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("carol", "letmein")], "")?;
  server.write_mailbox("carol", &mbox(&[&message("one"), &message("two")]))?;

  {
    let mut client = server.connect()?;
    client.command("USER carol")?;
    client.command("PASS letmein")?;
    assert_eq!(client.command("DELE 1")?, "+OK message deleted");
    // STAT still counts the deleted message as present until RSET/QUIT.
    let stat = client.command("STAT")?;
    assert!(stat.starts_with("+OK 1 "), "unexpected STAT after DELE: {stat}");
    client.command("QUIT")?;
  }

  let mut client = server.connect()?;
  client.command("USER carol")?;
  let greeting = client.command("PASS letmein")?;
  assert!(greeting.contains("exactly one message"), "unexpected greeting: {greeting}");
  client.command("QUIT")?;
  Ok(())
}

#[test_log::test]
fn rset_undoes_pending_deletions() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("dave", "opensesame")], "")?;
  server.write_mailbox("dave", &mbox(&[&message("one")]))?;

  let mut client = server.connect()?;
  client.command("USER dave")?;
  client.command("PASS opensesame")?;
  client.command("DELE 1")?;
  assert_eq!(client.command("RSET")?, "+OK maildrop has been reset");
  let stat = client.command("STAT")?;
  assert!(stat.starts_with("+OK 1 "), "unexpected STAT after RSET: {stat}");
  client.command("QUIT")?;
  Ok(())
}

#[test_log::test]
fn noop_and_last_behave() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("erin", "trustno1")], "")?;
  server.write_mailbox("erin", &mbox(&[&message("one"), &message("two")]))?;

  let mut client = server.connect()?;
  client.command("USER erin")?;
  client.command("PASS trustno1")?;

  assert_eq!(client.command("NOOP")?, "+OK ");
  assert_eq!(client.command("LAST")?, "+OK 0");
  client.command_multiline("RETR 2")?;
  assert_eq!(client.command("LAST")?, "+OK 2");
  client.command("QUIT")?;
  Ok(())
}

#[test_log::test]
fn capa_lists_capabilities() -> anyhow::Result<()> {
  let server = common::spawn(&[UserSpec::new("frank", "hunter3")], "")?;
  let mut client = server.connect()?;
  let (status, capabilities) = client.command_multiline("CAPA")?;
  assert!(status.starts_with("+OK"));
  assert!(capabilities.contains(&"UIDL".to_string()));
  assert!(capabilities.contains(&"USER".to_string()));
  client.command("QUIT")?;
  Ok(())
}
