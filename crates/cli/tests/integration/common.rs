//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// A flake with two packages; `hello` depends on `greeting` and has a
/// `doc` output.
pub const HELLO_FLAKE: &str = r#"
return {
  description = "hello",
  outputs = function(inputs)
    local greeting = derivation {
      name = "greeting",
      builder = "echo hello > $out",
    }
    local hello = derivation {
      name = "hello",
      outputs = { "out", "doc" },
      builder = "read line < " .. greeting .. "; echo \"$line world\" > $out; echo docs > $doc",
    }
    local packages = {}
    for _, system in ipairs({ "x86_64-linux", "aarch64-linux", "x86_64-darwin", "aarch64-darwin" }) do
      packages[system] = { default = hello, hello = hello, greeting = greeting }
    end
    return {
      packages = packages,
      nixosConfigurations = {
        machine = { config = { system = { build = { toplevel = greeting } } } },
      },
    }
  end,
}
"#;

/// Isolated test environment.
///
/// Each test gets its own temporary directory with isolated store, config
/// and cache paths. Commands run in `work/`.
pub struct TestEnv {
  pub temp: TempDir,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("work")).unwrap();
    Self { temp }
  }

  /// A test environment whose working directory holds [`HELLO_FLAKE`].
  pub fn with_hello_flake() -> Self {
    let env = Self::new();
    env.write_file("work/flake.lua", HELLO_FLAKE);
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  fn dir(&self, name: &str) -> PathBuf {
    let p = self.temp.path().join(name);
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  pub fn work_path(&self) -> PathBuf {
    self.dir("work")
  }

  /// Store root (isolated per test).
  pub fn store_path(&self) -> PathBuf {
    self.dir("store")
  }

  pub fn cache_path(&self) -> PathBuf {
    self.dir("cache")
  }

  /// Get a pre-configured Command for the realize binary.
  ///
  /// Sets environment variables for isolated testing:
  /// - `REALIZE_STORE_DIR`: Isolated store
  /// - `XDG_CONFIG_HOME`: Isolated registry
  /// - `XDG_CACHE_HOME`: Isolated eval cache and fetched sources
  /// - `XDG_DATA_HOME`: Isolated data path
  pub fn realize_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("realize");
    cmd.current_dir(self.work_path());
    cmd.env("REALIZE_STORE_DIR", self.store_path());
    cmd.env("XDG_CONFIG_HOME", self.dir("config"));
    cmd.env("XDG_CACHE_HOME", self.cache_path());
    cmd.env("XDG_DATA_HOME", self.dir("data"));
    cmd.env("HOME", self.dir("home"));
    cmd.env_remove("REALIZE_ALLOW_EVAL");
    cmd.env_remove("RUST_LOG");
    cmd.args(["--verbose"]);
    cmd
  }

  /// Run `realize` with `args` and return its stdout.
  pub fn stdout(&self, args: &[&str]) -> String {
    let output = self.realize_cmd().args(args).assert().success().get_output().stdout.clone();
    String::from_utf8(output).unwrap()
  }
}
