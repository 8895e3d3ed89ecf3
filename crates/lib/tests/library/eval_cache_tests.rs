use realize_lib::consts::EVAL_CACHE_DIR;
use realize_lib::eval::{EvalMode, EvalSettings};
use realize_lib::flake::LockFlags;
use realize_lib::installable::InstallableParser;

use super::common::{HELLO_FLAKE, TestEnv};

fn lock_flags() -> LockFlags {
  LockFlags {
    write_lock_file: false,
    ..LockFlags::default()
  }
}

#[test]
fn cached_attributes_resolve_without_evaluation() {
  let env = TestEnv::new();
  env.write_flake("hello", HELLO_FLAKE);

  let first = {
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .with_lock_flags(lock_flags())
      .parse(&["./hello#hello"])
      .unwrap();
    installables[0].to_derived_paths(&state, EvalMode::default()).unwrap()
  };

  let state = env.state_with(EvalSettings {
    allow_eval: false,
    ..env.settings()
  });
  let installables = InstallableParser::new(&state, env.flakes_dir())
    .with_lock_flags(lock_flags())
    .parse(&["./hello#hello", "./hello#greeting"])
    .unwrap();
  let second = installables[0].to_derived_paths(&state, EvalMode::default()).unwrap();
  assert_eq!(first, second);

  assert!(installables[1].to_derived_paths(&state, EvalMode::default()).is_err());
}

#[test]
fn disabling_the_cache_always_evaluates() {
  let env = TestEnv::new();
  env.write_flake("hello", HELLO_FLAKE);
  let settings = EvalSettings {
    use_eval_cache: false,
    allow_eval: false,
    ..env.settings()
  };

  for _ in 0..2 {
    let state = env.state_with(settings.clone());
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .with_lock_flags(lock_flags())
      .parse(&["./hello#greeting"])
      .unwrap();
    let paths = installables[0].to_derived_paths(&state, EvalMode::default()).unwrap();
    assert_eq!(paths.len(), 1);
  }
  assert!(!env.cache_dir().join(EVAL_CACHE_DIR).exists());
}
