// Configuration file parsing: line-oriented `key: value`, `#`-prefixed
// comments, keys may repeat (e.g. several `listen-address` lines). Parsed
// into a flat multimap with typed accessors, the same shape as the
// original's stringmap but expressed as an idiomatic Rust parser built with
// `peg`, mirroring the way the command grammar is built in source/pop3.rs.

use anyhow::Context as _;
use std::{collections, fs, path};

peg::parser! {
  grammar directive() for str {
    rule ws() = quiet!{[' ' | '\t']*}
    rule key() -> &'input str = s:$((!['\t'|' '|':'] [_])+) { s }
    rule value() -> &'input str = s:$([_]*) { s.trim_end_matches([' ', '\t']) }

    pub rule line() -> Option<(&'input str, &'input str)>
      = ws() k:key() ws() ":" ws() v:value() { Some((k, v)) }
      / ws() { None }
  }
}

#[derive(Debug, Default, Clone)]
pub struct Config {
  values: collections::HashMap<String, Vec<String>>,
}

impl Config {
  pub fn parse(text: &str) -> anyhow::Result<Self> {
    let mut values: collections::HashMap<String, Vec<String>> = collections::HashMap::new();
    for (lineno, raw) in text.lines().enumerate() {
      let stripped = match raw.find('#') {
        Some(hash) => &raw[..hash],
        None => raw,
      };
      match directive::line(stripped) {
        Ok(Some((key, value))) if !value.is_empty() => {
          values.entry(key.to_string()).or_default().push(value.to_string());
        }
        Ok(_) => {}
        Err(error) => anyhow::bail!("config line {}: {error}", lineno + 1),
      }
    }
    Ok(Self { values })
  }

  pub fn load(path: &path::Path) -> anyhow::Result<Self> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    Self::parse(&text).with_context(|| format!("parsing {path:?}"))
  }

  pub fn get(&self, key: &str) -> Option<&str> {
    self.values.get(key).and_then(|values| values.last()).map(String::as_str)
  }

  pub fn get_all(&self, key: &str) -> &[String] {
    self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn get_bool(&self, key: &str, default: bool) -> anyhow::Result<bool> {
    match self.get(key) {
      None => Ok(default),
      Some(value) => match value {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => anyhow::bail!("{key}: not a boolean: {other:?}"),
      },
    }
  }

  pub fn get_u64(&self, key: &str, default: u64) -> anyhow::Result<u64> {
    match self.get(key) {
      None => Ok(default),
      Some(value) => value.parse().with_context(|| format!("{key}: not an integer: {value:?}")),
    }
  }

  pub fn get_f64(&self, key: &str, default: f64) -> anyhow::Result<f64> {
    match self.get(key) {
      None => Ok(default),
      Some(value) => value.parse().with_context(|| format!("{key}: not a number: {value:?}")),
    }
  }

  pub fn is_driver_enabled(&self, driver: &str, default: bool) -> anyhow::Result<bool> {
    self.get_bool(&format!("auth-{driver}-enable"), default)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_simple_directives() {
    let config = Config::parse("listen-address: 0.0.0.0:110\n# a comment\nmax-children: 100\n").unwrap();
    assert_eq!(config.get("listen-address"), Some("0.0.0.0:110"));
    assert_eq!(config.get_u64("max-children", 0).unwrap(), 100);
  }

  #[test]
  fn repeated_directives_accumulate() {
    let config = Config::parse("listen-address: 0.0.0.0:110\nlisten-address: [::]:110\n").unwrap();
    assert_eq!(config.get_all("listen-address"), ["0.0.0.0:110", "[::]:110"]);
  }

  #[test]
  fn trailing_comment_is_stripped() {
    let config = Config::parse("timeout-seconds: 30 # half a minute\n").unwrap();
    assert_eq!(config.get("timeout-seconds"), Some("30"));
  }

  #[test]
  fn driver_gate_defaults() {
    let config = Config::parse("auth-passwd-enable: no\n").unwrap();
    assert!(!config.is_driver_enabled("passwd", true).unwrap());
    assert!(config.is_driver_enabled("ldap", true).unwrap());
  }
}
