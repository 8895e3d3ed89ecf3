//! Placeholders for outputs whose store paths are not yet known.
//!
//! An output of an input-addressed derivation has a path fixed at
//! instantiation time, but the output of a derivation that is itself
//! produced by another build does not. Such references are written into
//! strings as placeholders and substituted when the referring derivation is
//! built.
//!
//! # Placeholder Formats
//!
//! - `$${built:<derived path>}` - an output of a derivation, written in the
//!   store-independent form `<hash>-<name>.drv^out[^out...]`
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$out` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use realize_lib::placeholder::{parse, Segment};
//!
//! let segments = parse("cp $src $out").unwrap();
//! assert_eq!(segments, vec![Segment::Literal("cp $src $out".to_string())]);
//! ```

use thiserror::Error;

use crate::derived::SingleDerivedPath;

const OPEN: &str = "$${";

/// A parsed placeholder reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${built:<path>}` - the store path of a derivation output
  Built(SingleDerivedPath),
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder type: {0}")]
  UnknownType(String),

  #[error("malformed placeholder: {0}")]
  Malformed(String),

  #[error("unresolved output '{0}'")]
  Unresolved(String),
}

/// Resolves placeholders to concrete values at build time.
pub trait Resolver {
  fn resolve_built(&self, path: &SingleDerivedPath) -> Result<String, PlaceholderError>;
}

/// Render the placeholder standing for `path`.
pub fn render_built(path: &SingleDerivedPath) -> String {
  format!("$${{built:{path}}}")
}

/// If `input` is exactly one placeholder and nothing else, return the path
/// it stands for.
pub fn as_sole_placeholder(input: &str) -> Option<SingleDerivedPath> {
  match parse(input).ok()?.as_slice() {
    [Segment::Placeholder(Placeholder::Built(path))] => Some(path.clone()),
    _ => None,
  }
}

/// Every derived path referenced by placeholders in `input`.
pub fn references(input: &str) -> Result<Vec<SingleDerivedPath>, PlaceholderError> {
  Ok(
    parse(input)?
      .into_iter()
      .filter_map(|segment| match segment {
        Segment::Placeholder(Placeholder::Built(path)) => Some(path),
        Segment::Literal(_) => None,
      })
      .collect(),
  )
}

/// Split `input` into literal text and placeholders.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut offset = 0;

  while let Some(found) = input[offset..].find(OPEN) {
    let start = offset + found;
    let body = start + OPEN.len();

    if input[..start].ends_with('$') && start > offset {
      literal.push_str(&input[offset..start - 1]);
      literal.push_str(OPEN);
      offset = body;
      continue;
    }

    let close = input[body..].find('}').ok_or(PlaceholderError::Unclosed(start))?;
    literal.push_str(&input[offset..start]);
    if !literal.is_empty() {
      segments.push(Segment::Literal(std::mem::take(&mut literal)));
    }
    segments.push(Segment::Placeholder(parse_placeholder_content(&input[body..body + close])?));
    offset = body + close + 1;
  }

  literal.push_str(&input[offset..]);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

fn parse_placeholder_content(content: &str) -> Result<Placeholder, PlaceholderError> {
  let (kind, rest) = content
    .split_once(':')
    .ok_or_else(|| PlaceholderError::Malformed(format!("missing colon in '{content}'")))?;

  match kind {
    "built" => SingleDerivedPath::parse_base_name(rest)
      .map(Placeholder::Built)
      .map_err(|e| PlaceholderError::Malformed(e.to_string())),
    _ => Err(PlaceholderError::UnknownType(kind.to_string())),
  }
}

/// Replace every placeholder in `input` with what `resolver` returns for it.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  parse(input)?
    .into_iter()
    .map(|segment| match segment {
      Segment::Literal(text) => Ok(text),
      Segment::Placeholder(Placeholder::Built(path)) => resolver.resolve_built(&path),
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  const GEN: &str = "0123456789abcdef0123456789abcdef-gen.drv";

  fn gen_out() -> SingleDerivedPath {
    SingleDerivedPath::parse_base_name(&format!("{GEN}^out")).unwrap()
  }

  struct TestResolver {
    built: HashMap<SingleDerivedPath, String>,
  }

  impl Resolver for TestResolver {
    fn resolve_built(&self, path: &SingleDerivedPath) -> Result<String, PlaceholderError> {
      self
        .built
        .get(path)
        .cloned()
        .ok_or_else(|| PlaceholderError::Unresolved(path.to_string()))
    }
  }

  mod parsing {
    use super::*;

    #[test]
    fn shell_variables_pass_through() {
      assert_eq!(
        parse("echo $out $$HOME").unwrap(),
        vec![Segment::Literal("echo $out $$HOME".to_string())]
      );
    }

    #[test]
    fn built_placeholder_in_text() {
      let input = format!("cp {} $out", render_built(&gen_out()));
      assert_eq!(
        parse(&input).unwrap(),
        vec![
          Segment::Literal("cp ".to_string()),
          Segment::Placeholder(Placeholder::Built(gen_out())),
          Segment::Literal(" $out".to_string()),
        ]
      );
    }

    #[test]
    fn escape_produces_literal() {
      assert_eq!(
        parse("$$${built:x}").unwrap(),
        vec![Segment::Literal("$${built:x}".to_string())]
      );
    }

    #[test]
    fn errors() {
      assert_eq!(parse("$${built:x"), Err(PlaceholderError::Unclosed(0)));
      assert!(matches!(parse("$${action:0}"), Err(PlaceholderError::UnknownType(_))));
      assert!(matches!(parse("$${built:nope}"), Err(PlaceholderError::Malformed(_))));
      assert!(matches!(parse("$${out}"), Err(PlaceholderError::Malformed(_))));
    }
  }

  mod helpers {
    use super::*;

    #[test]
    fn sole_placeholder_detection() {
      assert_eq!(as_sole_placeholder(&render_built(&gen_out())), Some(gen_out()));
      assert_eq!(as_sole_placeholder(&format!("{}/bin", render_built(&gen_out()))), None);
      assert_eq!(as_sole_placeholder("plain"), None);
    }

    #[test]
    fn collects_references() {
      let input = format!("{} and {}", render_built(&gen_out()), render_built(&gen_out()));
      assert_eq!(references(&input).unwrap(), vec![gen_out(), gen_out()]);
    }
  }

  mod substitution {
    use super::*;

    #[test]
    fn substitutes_resolved_paths() {
      let resolver = TestResolver {
        built: HashMap::from([(gen_out(), "/store/xyz-inner.drv".to_string())]),
      };
      let input = format!("load {}", render_built(&gen_out()));
      assert_eq!(substitute(&input, &resolver).unwrap(), "load /store/xyz-inner.drv");
    }

    #[test]
    fn unresolved_is_an_error() {
      let resolver = TestResolver { built: HashMap::new() };
      assert!(matches!(
        substitute(&render_built(&gen_out()), &resolver),
        Err(PlaceholderError::Unresolved(_))
      ));
    }
  }
}
