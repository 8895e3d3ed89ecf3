//! Near-match suggestions for misspelled attribute names.

use std::fmt;

/// A candidate name and its edit distance from what was asked for.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Suggestion {
  pub distance: usize,
  pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Suggestions {
  pub suggestions: Vec<Suggestion>,
}

impl Suggestions {
  /// Rank `candidates` by distance to `query`, closest first.
  pub fn best_matches<I, S>(candidates: I, query: &str) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let mut suggestions: Vec<Suggestion> = candidates
      .into_iter()
      .map(|c| Suggestion {
        distance: levenshtein(query, c.as_ref()),
        name: c.as_ref().to_string(),
      })
      .collect();
    suggestions.sort();
    Self { suggestions }
  }

  /// Keep at most `limit` suggestions no further than `max_distance`.
  pub fn trim(mut self, limit: usize, max_distance: usize) -> Self {
    self.suggestions.retain(|s| s.distance <= max_distance);
    self.suggestions.truncate(limit);
    self
  }

  pub fn is_empty(&self) -> bool {
    self.suggestions.is_empty()
  }

  pub fn extend(&mut self, other: Suggestions) {
    self.suggestions.extend(other.suggestions);
    self.suggestions.sort();
    self.suggestions.dedup_by(|a, b| a.name == b.name);
  }
}

impl fmt::Display for Suggestions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let names: Vec<String> = self.suggestions.iter().map(|s| format!("'{}'", s.name)).collect();
    match names.as_slice() {
      [] => Ok(()),
      [only] => write!(f, "Did you mean {only}?"),
      [init @ .., last] => write!(f, "Did you mean one of {} or {last}?", init.join(", ")),
    }
  }
}

/// Either a value or the suggestions explaining why there is none.
#[derive(Debug, Clone)]
pub enum OrSuggestions<T> {
  Value(T),
  Suggestions(Suggestions),
}

impl<T> OrSuggestions<T> {
  pub fn ok(self) -> Option<T> {
    match self {
      OrSuggestions::Value(value) => Some(value),
      OrSuggestions::Suggestions(_) => None,
    }
  }

  pub fn suggestions(&self) -> Option<&Suggestions> {
    match self {
      OrSuggestions::Value(_) => None,
      OrSuggestions::Suggestions(s) => Some(s),
    }
  }
}

fn levenshtein(a: &str, b: &str) -> usize {
  let b: Vec<char> = b.chars().collect();
  let mut prev: Vec<usize> = (0..=b.len()).collect();
  for (i, ca) in a.chars().enumerate() {
    let mut cur = vec![i + 1; b.len() + 1];
    for (j, cb) in b.iter().enumerate() {
      let cost = usize::from(ca != *cb);
      cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
    }
    prev = cur;
  }
  prev[b.len()]
}
