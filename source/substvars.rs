// $(var) / $(var[n]) template substitution, used for mailbox path templates
// and SQL/LDAP query templates. A pure function from (template, variables)
// to a string, with explicit error positions rather than a panic, so the
// caller can report a useful config-time diagnostic.

use std::fmt;

#[derive(Debug, PartialEq, Eq)]
pub struct Error {
  pub message: &'static str,
  pub offset: usize,
}

impl fmt::Display for Error {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{} (at offset {})", self.message, self.offset)
  }
}

impl std::error::Error for Error {}

/// One substitutable variable: a name and an optional value (`None` means
/// "known but null", which is a substitution error if actually referenced).
pub struct Variable<'a> {
  pub name: &'a str,
  pub value: Option<&'a str>,
}

pub fn var<'a>(name: &'a str, value: Option<&'a str>) -> Variable<'a> {
  Variable { name, value }
}

/// Substitute every `$(name)` or `$(name[index])` occurrence in `template`.
/// Negative indices count from the end of the value, as in Python slicing.
pub fn substitute(template: &str, variables: &[Variable]) -> Result<String, Error> {
  let mut result = String::with_capacity(template.len());
  let mut rest = template;
  let mut consumed = 0usize;

  loop {
    let Some(start) = rest.find("$(") else {
      result.push_str(rest);
      break;
    };
    result.push_str(&rest[..start]);
    let after_marker = &rest[start + 2..];
    let offset_of_marker = consumed + start;

    let matched = variables
      .iter()
      .find(|candidate| after_marker.starts_with(candidate.name));
    let Some(variable) = matched else {
      return Err(Error {
        message: "syntax error or unknown variable",
        offset: offset_of_marker,
      });
    };

    let after_name = &after_marker[variable.name.len()..];
    let mut chars = after_name.char_indices();
    match chars.next() {
      Some((_, ')')) => {
        let value = variable.value.ok_or(Error {
          message: "variable has null value",
          offset: offset_of_marker,
        })?;
        result.push_str(value);
        rest = &after_name[1..];
      }
      Some((_, '[')) => {
        let index_text_start = 1;
        let close = after_name[index_text_start..]
          .find(']')
          .map(|i| i + index_text_start);
        let Some(close) = close else {
          return Err(Error {
            message: "syntax error in character index",
            offset: offset_of_marker,
          });
        };
        let index_text = &after_name[index_text_start..close];
        let Ok(index) = index_text.parse::<i64>() else {
          return Err(Error {
            message: "syntax error in character index",
            offset: offset_of_marker,
          });
        };
        if after_name.as_bytes().get(close + 1) != Some(&b')') {
          return Err(Error {
            message: "syntax error in character index",
            offset: offset_of_marker,
          });
        }
        let value = variable.value.ok_or(Error {
          message: "variable has null value",
          offset: offset_of_marker,
        })?;
        let length = value.chars().count() as i64;
        let resolved = if index < 0 { index + length } else { index };
        if resolved < 0 || resolved >= length {
          return Err(Error {
            message: "character index out of range",
            offset: offset_of_marker,
          });
        }
        let ch = value
          .chars()
          .nth(resolved as usize)
          .expect("bounds already checked");
        result.push(ch);
        rest = &after_name[close + 2..];
      }
      _ => {
        return Err(Error {
          message: "syntax error or unknown variable",
          offset: offset_of_marker,
        });
      }
    }
    consumed = template.len() - rest.len();
  }

  Ok(result)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_substitution() {
    let vars = [var("user", Some("chris")), var("domain", Some("ex-parrot.com"))];
    let result = substitute("$(user)@$(domain)", &vars).unwrap();
    assert_eq!(result, "chris@ex-parrot.com");
  }

  #[test]
  fn indexed_substitution() {
    let vars = [var("user", Some("chris"))];
    assert_eq!(substitute("$(user[0])", &vars).unwrap(), "c");
    assert_eq!(substitute("$(user[-1])", &vars).unwrap(), "s");
  }

  #[test]
  fn index_out_of_range() {
    let vars = [var("user", Some("c"))];
    let error = substitute("$(user[5])", &vars).unwrap_err();
    assert_eq!(error.message, "character index out of range");
  }

  #[test]
  fn unknown_variable() {
    let vars = [var("user", Some("chris"))];
    let error = substitute("$(nope)", &vars).unwrap_err();
    assert_eq!(error.message, "syntax error or unknown variable");
  }

  #[test]
  fn null_value() {
    let vars = [var("domain", None)];
    let error = substitute("$(domain)", &vars).unwrap_err();
    assert_eq!(error.message, "variable has null value");
  }

  #[test]
  fn no_substitution_needed() {
    let result = substitute("/var/spool/mail/static", &[]).unwrap();
    assert_eq!(result, "/var/spool/mail/static");
  }

  #[test]
  fn mixed_text_and_variables() {
    let vars = [var("user", Some("chris")), var("home", Some("/home/chris"))];
    assert_eq!(substitute("$(home)/Maildir/$(user)", &vars).unwrap(), "/home/chris/Maildir/chris");
  }
}
