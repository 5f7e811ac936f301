// The wire-level vocabulary of RFC 1939: command parsing and response
// formatting. Keyword lookup is a case-insensitive table scan, as in any
// POP3 server; the fiddly multi-argument forms (APOP's hex digest, TOP's
// pair of numbers) are each a small `peg` grammar, the same tool used
// elsewhere in this crate for the configuration file grammar.

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  User(String),
  Pass(String),
  Apop { name: String, digest: [u8; 16] },
  Quit,
  Stat,
  List(Option<u32>),
  Uidl(Option<u32>),
  Retr(u32),
  Top { message: u32, lines: u32 },
  Dele(u32),
  Rset,
  Noop,
  Last,
  Capa,
  Stls,
  /// Recognised keyword, but malformed arguments.
  Malformed(&'static str),
  /// Not one of the known keywords at all.
  Unknown,
}

peg::parser! {
  grammar arguments() for str {
    rule ws() = quiet!{[' ' | '\t']+}
    rule digit() -> char = c:['0'..='9'] { c }
    rule hex_digit() -> char = c:['0'..='9' | 'a'..='f' | 'A'..='F'] { c }

    pub rule number() -> u32
      = n:$(digit()+) {? n.parse().or(Err("number")) }

    pub rule hex32() -> [u8; 16]
      = s:$(hex_digit()*<32,32>) {?
          let mut out = [0u8; 16];
          for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16).ok_or("hex")?;
            let lo = (chunk[1] as char).to_digit(16).ok_or("hex")?;
            out[i] = ((hi << 4) | lo) as u8;
          }
          Ok(out)
        }

    pub rule apop_args() -> (&'input str, [u8; 16])
      = name:$((!ws() [_])+) ws() digest:hex32() { (name, digest) }

    pub rule top_args() -> (u32, u32)
      = message:number() ws() lines:number() { (message, lines) }
  }
}

fn trim(s: &str) -> &str {
  s.trim_matches([' ', '\t'])
}

/// Parse one already-dechunked line (CRLF already stripped) into a command.
pub fn parse(line: &[u8]) -> Command {
  let line = String::from_utf8_lossy(line);
  let line = trim(&line);
  let (keyword, tail) = match line.find([' ', '\t']) {
    Some(index) => (&line[..index], trim(&line[index..])),
    None => (line, ""),
  };

  macro_rules! is {
    ($name:literal) => {
      keyword.eq_ignore_ascii_case($name)
    };
  }

  if is!("USER") {
    if tail.is_empty() {
      Command::Malformed("USER requires a name")
    } else {
      Command::User(tail.to_string())
    }
  } else if is!("PASS") {
    if tail.is_empty() {
      Command::Malformed("PASS requires a secret")
    } else {
      Command::Pass(tail.to_string())
    }
  } else if is!("APOP") {
    match arguments::apop_args(tail) {
      Ok((name, digest)) => Command::Apop { name: name.to_string(), digest },
      Err(_) => Command::Malformed("APOP requires a name and a 32 hex digit digest"),
    }
  } else if is!("QUIT") {
    Command::Quit
  } else if is!("STAT") {
    Command::Stat
  } else if is!("LIST") {
    optional_message_number(tail).map_or(Command::Malformed("bad message number"), Command::List)
  } else if is!("UIDL") {
    optional_message_number(tail).map_or(Command::Malformed("bad message number"), Command::Uidl)
  } else if is!("RETR") {
    match arguments::number(tail) {
      Ok(n) => Command::Retr(n),
      Err(_) => Command::Malformed("RETR requires a message number"),
    }
  } else if is!("TOP") {
    match arguments::top_args(tail) {
      Ok((message, lines)) => Command::Top { message, lines },
      Err(_) => Command::Malformed("TOP requires a message number and a line count"),
    }
  } else if is!("DELE") {
    match arguments::number(tail) {
      Ok(n) => Command::Dele(n),
      Err(_) => Command::Malformed("DELE requires a message number"),
    }
  } else if is!("RSET") {
    Command::Rset
  } else if is!("NOOP") {
    Command::Noop
  } else if is!("LAST") {
    Command::Last
  } else if is!("CAPA") {
    Command::Capa
  } else if is!("STLS") {
    Command::Stls
  } else {
    Command::Unknown
  }
}

fn optional_message_number(tail: &str) -> Option<Option<u32>> {
  if tail.is_empty() {
    Some(None)
  } else {
    arguments::number(tail).ok().map(Some)
  }
}

pub struct Response<'a> {
  pub ok: bool,
  pub text: &'a str,
}

impl fmt::Display for Response<'_> {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{} {}\r\n", if self.ok { "+OK" } else { "-ERR" }, self.text)
  }
}

pub fn ok(text: &str) -> String {
  Response { ok: true, text }.to_string()
}

pub fn err(text: &str) -> String {
  Response { ok: false, text }.to_string()
}

pub fn data_line(text: &str) -> String {
  format!("{text}\r\n")
}

pub const TERMINATOR: &str = ".\r\n";

/// Dot-stuff one body line (without its terminator) for transmission.
pub fn stuff_line(line: &str) -> std::borrow::Cow<'_, str> {
  if line.starts_with('.') {
    std::borrow::Cow::Owned(format!(".{line}"))
  } else {
    std::borrow::Cow::Borrowed(line)
  }
}

pub fn hex_digest(hash: &[u8; 16]) -> String {
  hash.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keyword_lookup_is_case_insensitive() {
    assert_eq!(parse(b"user alice"), Command::User("alice".to_string()));
    assert_eq!(parse(b"UsEr alice"), Command::User("alice".to_string()));
  }

  #[test]
  fn trims_surrounding_whitespace() {
    assert_eq!(parse(b"  USER   alice  "), Command::User("alice".to_string()));
  }

  #[test]
  fn apop_parses_name_and_digest() {
    let digest = "0123456789abcdef0123456789abcdef";
    let command = parse(format!("APOP alice {digest}").as_bytes());
    match command {
      Command::Apop { name, digest: parsed } => {
        assert_eq!(name, "alice");
        assert_eq!(hex_digest(&parsed), digest);
      }
      other => panic!("unexpected {other:?}"),
    }
  }

  #[test]
  fn apop_rejects_short_digest() {
    assert!(matches!(parse(b"APOP alice deadbeef"), Command::Malformed(_)));
  }

  #[test]
  fn top_parses_two_numbers() {
    assert_eq!(parse(b"TOP 3 10"), Command::Top { message: 3, lines: 10 });
  }

  #[test]
  fn list_without_argument() {
    assert_eq!(parse(b"LIST"), Command::List(None));
  }

  #[test]
  fn unknown_command() {
    assert_eq!(parse(b"FROBNICATE"), Command::Unknown);
  }

  #[test]
  fn dot_stuffing() {
    assert_eq!(stuff_line("."), "..");
    assert_eq!(stuff_line(".leading"), "..leading");
    assert_eq!(stuff_line("plain"), "plain");
  }

  #[test]
  fn response_formatting() {
    assert_eq!(ok("2 3421"), "+OK 2 3421\r\n");
    assert_eq!(err("bad"), "-ERR bad\r\n");
  }
}
