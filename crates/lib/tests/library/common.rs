use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use realize_lib::eval::{EvalSettings, EvalState};
use realize_lib::flake::{FlakeLocker, Registries, Registry};
use realize_lib::store::LocalStore;
use tempfile::TempDir;

/// A store, a cache directory and a directory for flakes, all temporary.
pub struct TestEnv {
  _temp: TempDir,
  pub root: PathBuf,
  pub store: Rc<LocalStore>,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let root = dunce::canonicalize(temp.path()).unwrap();
    let store = Rc::new(LocalStore::open(root.join("store")).unwrap().with_max_jobs(2));
    Self { _temp: temp, root, store }
  }

  pub fn cache_dir(&self) -> PathBuf {
    self.root.join("cache")
  }

  pub fn settings(&self) -> EvalSettings {
    EvalSettings {
      system: "x86_64-linux".to_string(),
      cache_dir: self.cache_dir(),
      ..EvalSettings::default()
    }
  }

  pub fn state(&self) -> EvalState {
    self.state_with(self.settings())
  }

  pub fn state_with(&self, settings: EvalSettings) -> EvalState {
    let locker = FlakeLocker::new(Registries::new(Registry::default()), self.cache_dir());
    EvalState::new(self.store.clone(), Rc::new(locker), settings).unwrap()
  }

  /// Write `<root>/<name>/flake.lua`.
  pub fn write_flake(&self, name: &str, body: &str) -> PathBuf {
    let dir = self.root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("flake.lua"), body).unwrap();
    dir
  }

  pub fn flakes_dir(&self) -> &Path {
    &self.root
  }
}

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
      meta = { priority = 5 },
    }
    return {
      packages = {
        ["x86_64-linux"] = { default = hello, hello = hello, greeting = greeting },
      },
    }
  end,
}
"#;
