//! CLI output formatting.
//!
//! Store paths and JSON go to stdout so they can be piped; status messages
//! go to stderr.

use std::fmt::Display;
use std::time::Duration;

use anyhow::Context;
use owo_colors::{OwoColorize, Stream, Style};

const SUCCESS: &str = "✓";
const WARNING: &str = "⚠";
const INFO: &str = "•";
const ARROW: &str = "→";

/// Render `text` with `style` when stderr is a color terminal.
fn styled<T: Display>(text: T, style: Style) -> String {
  text.if_supports_color(Stream::Stderr, |t| t.style(style)).to_string()
}

/// Elapsed time as `850ms`, `2.40s` or `3m 12s`.
pub fn format_duration(duration: Duration) -> String {
  match duration.as_secs() {
    0 => format!("{}ms", duration.as_millis()),
    secs @ 1..60 => format!("{secs}.{:02}s", duration.subsec_millis() / 10),
    secs => format!("{}m {}s", secs / 60, secs % 60),
  }
}

pub fn print_success(message: &str) {
  eprintln!("{} {message}", styled(SUCCESS, Style::new().green()));
}

pub fn print_warning(message: &str) {
  let yellow = Style::new().yellow();
  eprintln!("{} {}", styled(WARNING, yellow), styled(message, yellow));
}

pub fn print_info(message: &str) {
  eprintln!("{} {message}", styled(INFO, Style::new().blue()));
}

/// One indented entry of a list printed after [`print_info`].
pub fn print_item(item: &str) {
  eprintln!("  {}", styled(item, Style::new().dimmed()));
}

/// `link → target`, for created out-links.
pub fn print_link(link: &str, target: &str) {
  eprintln!(
    "  {link} {} {}",
    styled(ARROW, Style::new().dimmed()),
    styled(target, Style::new().cyan())
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize output as JSON")?;
  println!("{json}");
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn durations_pick_a_unit() {
    assert_eq!(format_duration(Duration::from_millis(850)), "850ms");
    assert_eq!(format_duration(Duration::from_millis(2400)), "2.40s");
    assert_eq!(format_duration(Duration::from_secs(192)), "3m 12s");
  }
}
