//! Which outputs of a derivation a reference asks for.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type OutputName = String;

static OUTPUT_NAME: LazyLock<Regex> = LazyLock::new(|| {
  Regex::new(r"^[a-zA-Z0-9+\-._?=]+$").expect("output name pattern is valid")
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OutputsSpecError {
  #[error("'{0}' is not a valid outputs specifier")]
  Invalid(String),
}

/// A concrete selection of outputs.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum OutputsSpec {
  All,
  Names(BTreeSet<OutputName>),
}

impl OutputsSpec {
  /// Parse `*` or a comma separated, non-empty list of output names.
  pub fn parse(s: &str) -> Result<Self, OutputsSpecError> {
    if s == "*" {
      return Ok(Self::All);
    }
    let names: BTreeSet<OutputName> = s.split(',').map(str::to_string).collect();
    if names.iter().any(|name| !OUTPUT_NAME.is_match(name)) {
      return Err(OutputsSpecError::Invalid(s.to_string()));
    }
    Ok(Self::Names(names))
  }

  pub fn names<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<OutputName>,
  {
    Self::Names(names.into_iter().map(Into::into).collect())
  }

  pub fn contains(&self, output: &str) -> bool {
    match self {
      Self::All => true,
      Self::Names(names) => names.contains(output),
    }
  }

  pub fn union(&self, other: &Self) -> Self {
    match (self, other) {
      (Self::Names(a), Self::Names(b)) => Self::Names(a.union(b).cloned().collect()),
      _ => Self::All,
    }
  }

  pub fn is_subset_of(&self, other: &Self) -> bool {
    match (self, other) {
      (_, Self::All) => true,
      (Self::All, Self::Names(_)) => false,
      (Self::Names(a), Self::Names(b)) => a.is_subset(b),
    }
  }
}

impl fmt::Display for OutputsSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::All => write!(f, "*"),
      Self::Names(names) => {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        write!(f, "{}", names.join(","))
      }
    }
  }
}

/// An outputs selection attached to a user-supplied reference. `Default`
/// defers to whatever the referenced derivation declares.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ExtendedOutputsSpec {
  #[default]
  Default,
  Explicit(OutputsSpec),
}

impl ExtendedOutputsSpec {
  /// Split a trailing `^outputs` suffix off `s`.
  ///
  /// The suffix starts at the last `^`, so `a^b^out` keeps `a^b` as the
  /// prefix. No `^` at all yields `Default`.
  pub fn parse(s: &str) -> Result<(&str, Self), OutputsSpecError> {
    match s.rfind('^') {
      None => Ok((s, Self::Default)),
      Some(idx) => {
        let spec = OutputsSpec::parse(&s[idx + 1..])?;
        Ok((&s[..idx], Self::Explicit(spec)))
      }
    }
  }

  pub fn is_default(&self) -> bool {
    matches!(self, Self::Default)
  }
}

impl fmt::Display for ExtendedOutputsSpec {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Default => Ok(()),
      Self::Explicit(spec) => write!(f, "^{spec}"),
    }
  }
}
