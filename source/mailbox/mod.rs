// Polymorphic mailbox facade: one file per `From `-delimited mbox spool, or
// one file per message in a Maildir tree. Replaces the original's
// function-pointer table with a tagged enum exposing the same operations
// (`send_message`, `apply_changes`, plus indexing at open time).

pub mod locks;
pub mod maildir;
pub mod mbox;

use crate::{auth, substvars};
use std::{io, path};

#[derive(Debug, Clone)]
pub struct IndexEntry {
  pub deleted: bool,
  pub hash: [u8; 16],
  /// Message length excluding the mbox `From ` line, or file length for Maildir.
  pub length: u64,
}

pub trait Driver {
  /// Total apparent mailbox size reported by STAT (sum of message lengths).
  fn total_octets(&self) -> u64;
  fn index(&self) -> &[IndexEntry];
  fn index_mut(&mut self) -> &mut [IndexEntry];
  fn send_message(&self, message: usize, max_body_lines: Option<u32>, writer: &mut dyn io::Write) -> io::Result<()>;
  fn apply_changes(&mut self) -> anyhow::Result<()>;
}

pub enum Mailbox {
  Mbox(mbox::Mbox),
  Maildir(maildir::Maildir),
}

impl Mailbox {
  fn driver(&self) -> &dyn Driver {
    match self {
      Mailbox::Mbox(m) => m,
      Mailbox::Maildir(m) => m,
    }
  }

  fn driver_mut(&mut self) -> &mut dyn Driver {
    match self {
      Mailbox::Mbox(m) => m,
      Mailbox::Maildir(m) => m,
    }
  }

  pub fn message_count(&self) -> usize {
    self.driver().index().iter().filter(|entry| !entry.deleted).count()
  }

  pub fn stat(&self) -> (usize, u64) {
    let index = self.driver().index();
    let count = index.iter().filter(|e| !e.deleted).count();
    let octets = index.iter().filter(|e| !e.deleted).map(|e| e.length).sum();
    (count, octets)
  }

  pub fn total_octets(&self) -> u64 {
    self.driver().total_octets()
  }

  pub fn entry(&self, message: usize) -> Option<&IndexEntry> {
    self.driver().index().get(message)
  }

  pub fn index_iter(&self) -> impl Iterator<Item = (usize, &IndexEntry)> {
    self.driver().index().iter().enumerate()
  }

  pub fn len(&self) -> usize {
    self.driver().index().len()
  }

  pub fn mark_deleted(&mut self, message: usize) {
    if let Some(entry) = self.driver_mut().index_mut().get_mut(message) {
      entry.deleted = true;
    }
  }

  pub fn reset(&mut self) {
    for entry in self.driver_mut().index_mut() {
      entry.deleted = false;
    }
  }

  pub fn send_message(&self, message: usize, max_body_lines: Option<u32>, writer: &mut dyn io::Write) -> io::Result<()> {
    self.driver().send_message(message, max_body_lines, writer)
  }

  pub fn apply_changes(&mut self) -> anyhow::Result<()> {
    self.driver_mut().apply_changes()
  }

  /// Directory the last-login marker (and any other per-mailbox sidecar
  /// file) should live next to: the mbox file's parent, or the Maildir root.
  pub fn directory(&self) -> path::PathBuf {
    match self {
      Mailbox::Mbox(m) => mbox::path_of(m).parent().map(path::Path::to_path_buf).unwrap_or_default(),
      Mailbox::Maildir(m) => maildir::root_of(m).to_path_buf(),
    }
  }
}

pub fn hex_uid(hash: &[u8; 16]) -> String {
  crate::pop3::hex_digest(hash)
}

/// One `[driver:]path` candidate from a mailbox template directive.
struct Candidate<'a> {
  driver: Option<&'a str>,
  template: &'a str,
}

fn parse_candidates(spec: &str) -> Vec<Candidate<'_>> {
  spec
    .split_whitespace()
    .map(|token| match token.split_once(':') {
      Some((driver, template)) if matches!(driver, "mbox" | "maildir") => {
        Candidate { driver: Some(driver), template }
      }
      _ => Candidate { driver: None, template: token },
    })
    .collect()
}

/// Failure opening one mailbox candidate: distinguished so discovery knows
/// whether to fall through to the next candidate (no such mailbox) or stop
/// and surface an error to the client - and, in the `Locked` case, surface
/// the specific "mailbox locked" text from `locks::Error::Contended` rather
/// than a generic I/O failure message (spec.md §7).
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
  #[error("no such mailbox")]
  NoSuchMailbox,
  #[error("{0}")]
  Locked(locks::Error),
  #[error(transparent)]
  Failed(#[from] anyhow::Error),
}

impl OpenError {
  fn not_found(io_error: &io::Error) -> bool {
    io_error.kind() == io::ErrorKind::NotFound
  }
}

impl From<io::Error> for OpenError {
  fn from(io_error: io::Error) -> Self {
    if OpenError::not_found(&io_error) {
      OpenError::NoSuchMailbox
    } else {
      OpenError::Failed(io_error.into())
    }
  }
}

impl From<locks::Error> for OpenError {
  fn from(error: locks::Error) -> Self {
    match error {
      locks::Error::Contended => OpenError::Locked(error),
      locks::Error::Io(io_error) => io_error.into(),
    }
  }
}

pub struct DiscoveryConfig<'a> {
  /// Templates from `auth-<driver>-mailbox`, in switch order.
  pub per_driver_templates: &'a [(&'a str, &'a str)],
  pub global_template: Option<&'a str>,
  pub default_root: &'a path::Path,
  pub locking: locks::Config,
}

/// Resolve and open a mailbox for an authenticated user, trying candidates
/// in order: `auth-<driver>-mailbox`, global `mailbox`, then a compile-time
/// default `<default_root>/<user>`. The first candidate whose open succeeds
/// wins; `NoSuchMailbox` falls through, any other error stops the search.
pub fn discover(context: &auth::AuthContext, config: &DiscoveryConfig) -> Result<Mailbox, OpenError> {
  let mut specs: Vec<&str> = Vec::new();
  if let Some(driver) = &context.driver {
    if let Some((_, template)) = config.per_driver_templates.iter().find(|(name, _)| name == driver) {
      specs.push(template);
    }
  }
  if let Some(mailbox) = &context.mailbox_hint {
    specs.push(mailbox.as_str());
  }
  if let Some(global) = config.global_template {
    specs.push(global);
  }
  let default = format!("{}/{}", config.default_root.display(), context.user);

  let vars = [
    substvars::var("user", Some(&context.user)),
    substvars::var("domain", context.domain.as_deref()),
    substvars::var("home", Some(&context.home)),
  ];

  let mut last_error = None;
  for spec in specs.iter().copied().chain(std::iter::once(default.as_str())) {
    for candidate in parse_candidates(spec) {
      let resolved = match substvars::substitute(candidate.template, &vars) {
        Ok(resolved) => resolved,
        Err(error) => {
          last_error = Some(OpenError::Failed(anyhow::anyhow!("{error}")));
          continue;
        }
      };
      let path = path::PathBuf::from(resolved);
      let open_result = match candidate.driver {
        Some("maildir") => maildir::open(&path).map(Mailbox::Maildir),
        _ => mbox::open(&path, &config.locking).map(Mailbox::Mbox),
      };
      match open_result {
        Ok(mailbox) => return Ok(mailbox),
        Err(OpenError::NoSuchMailbox) => {
          last_error = Some(OpenError::NoSuchMailbox);
          continue;
        }
        Err(error) => return Err(error),
      }
    }
  }
  Err(last_error.unwrap_or(OpenError::NoSuchMailbox))
}
