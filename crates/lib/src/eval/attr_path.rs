//! Dotted attribute paths such as `packages.x86_64-linux."foo.bar"`.

use super::EvalError;

/// Split an attribute path at dots outside double quotes.
pub fn parse_attr_path(s: &str) -> Result<Vec<String>, EvalError> {
  let mut path = Vec::new();
  if s.is_empty() {
    return Ok(path);
  }

  let mut current = String::new();
  let mut quoted = false;
  for c in s.chars() {
    match c {
      '"' => quoted = !quoted,
      '.' if !quoted => path.push(std::mem::take(&mut current)),
      c => current.push(c),
    }
  }
  if quoted {
    return Err(EvalError::BadAttrPath(format!("missing closing quote in '{s}'")));
  }
  path.push(current);
  Ok(path)
}

/// Render a path, quoting elements that would not parse back unquoted.
pub fn show_attr_path<S: AsRef<str>>(path: &[S]) -> String {
  path
    .iter()
    .map(|p| {
      let p = p.as_ref();
      if p.is_empty() || p.contains('.') || p.contains('"') {
        format!("\"{p}\"")
      } else {
        p.to_string()
      }
    })
    .collect::<Vec<_>>()
    .join(".")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse() {
    assert!(parse_attr_path("").unwrap().is_empty());
    assert_eq!(parse_attr_path("a.b").unwrap(), ["a", "b"]);
    assert_eq!(parse_attr_path("a.\"b.c\".d").unwrap(), ["a", "b.c", "d"]);
    assert_eq!(parse_attr_path("packages.x86_64-linux.").unwrap(), ["packages", "x86_64-linux", ""]);
    assert!(parse_attr_path("a.\"b").is_err());
  }

  #[test]
  fn show_quotes_when_needed() {
    assert_eq!(show_attr_path(&["a", "b.c"]), "a.\"b.c\"");
    assert_eq!(parse_attr_path(&show_attr_path(&["x", "y.z"])).unwrap(), ["x", "y.z"]);
  }
}
