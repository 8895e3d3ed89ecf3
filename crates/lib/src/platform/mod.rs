//! Host system identification and per-user directories.

pub mod paths;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// CPU architecture part of a system double.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
  X86_64,
  Aarch64,
  I686,
}

impl Arch {
  pub fn current() -> Option<Self> {
    std::env::consts::ARCH.parse().ok()
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Self::X86_64 => "x86_64",
      Self::Aarch64 => "aarch64",
      Self::I686 => "i686",
    }
  }
}

impl FromStr for Arch {
  type Err = SystemParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "x86_64" => Ok(Self::X86_64),
      "aarch64" => Ok(Self::Aarch64),
      "i686" | "x86" => Ok(Self::I686),
      other => Err(SystemParseError::UnknownArch(other.to_string())),
    }
  }
}

/// Kernel part of a system double.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Os {
  Linux,
  Darwin,
  Windows,
}

impl Os {
  pub fn current() -> Option<Self> {
    std::env::consts::OS.parse().ok()
  }

  /// Identifier used in system doubles (`darwin` rather than `macos`).
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Linux => "linux",
      Self::Darwin => "darwin",
      Self::Windows => "windows",
    }
  }
}

impl FromStr for Os {
  type Err = SystemParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "linux" => Ok(Self::Linux),
      "darwin" | "macos" => Ok(Self::Darwin),
      "windows" => Ok(Self::Windows),
      other => Err(SystemParseError::UnknownOs(other.to_string())),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SystemParseError {
  #[error("unknown architecture '{0}'")]
  UnknownArch(String),
  #[error("unknown operating system '{0}'")]
  UnknownOs(String),
  #[error("'{0}' is not a system of the form '<arch>-<os>'")]
  Malformed(String),
}

/// A system double such as `x86_64-linux`, used to select per-system flake
/// attributes like `packages.<system>.default`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct System {
  pub arch: Arch,
  pub os: Os,
}

impl System {
  pub fn new(arch: Arch, os: Os) -> Self {
    Self { arch, os }
  }

  /// Returns `None` if the host is not a supported build platform.
  pub fn current() -> Option<Self> {
    Some(Self {
      arch: Arch::current()?,
      os: Os::current()?,
    })
  }

  pub fn double(&self) -> String {
    format!("{}-{}", self.arch.as_str(), self.os.as_str())
  }
}

impl fmt::Display for System {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.double())
  }
}

impl FromStr for System {
  type Err = SystemParseError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    let (arch, os) = s
      .split_once('-')
      .ok_or_else(|| SystemParseError::Malformed(s.to_string()))?;
    Ok(Self {
      arch: arch.parse()?,
      os: os.parse()?,
    })
  }
}

/// The host's system double, falling back to the raw Rust target names for
/// hosts outside the known set.
pub fn current_system() -> String {
  System::current()
    .map(|s| s.double())
    .unwrap_or_else(|| format!("{}-{}", std::env::consts::ARCH, std::env::consts::OS))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn double_format() {
    assert_eq!(System::new(Arch::Aarch64, Os::Darwin).double(), "aarch64-darwin");
    assert_eq!(System::new(Arch::X86_64, Os::Linux).to_string(), "x86_64-linux");
  }

  #[test]
  fn parses_doubles() {
    let sys: System = "x86_64-linux".parse().unwrap();
    assert_eq!(sys, System::new(Arch::X86_64, Os::Linux));

    let sys: System = "aarch64-macos".parse().unwrap();
    assert_eq!(sys.os, Os::Darwin);
  }

  #[test]
  fn rejects_malformed_doubles() {
    assert_eq!(
      "linux".parse::<System>(),
      Err(SystemParseError::Malformed("linux".to_string()))
    );
    assert!(matches!(
      "sparc-linux".parse::<System>(),
      Err(SystemParseError::UnknownArch(_))
    ));
  }

  #[test]
  fn current_system_is_a_double() {
    assert!(current_system().contains('-'));
  }
}
