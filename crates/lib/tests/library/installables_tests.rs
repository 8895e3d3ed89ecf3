use std::fs;

use realize_lib::derived::BuiltPath;
use realize_lib::installable::{
  InstallableError, InstallableParser, OperateOn, Realise, SourceExprArgs, build, to_derivations, to_store_path,
};
use realize_lib::store::{BuildMode, Store, StoreError};

use super::common::{HELLO_FLAKE, TestEnv};

fn read_output(env: &TestEnv, path: &realize_lib::store::StorePath) -> String {
  fs::read_to_string(env.store.store_dir().to_path(path)).unwrap()
}

mod flakes {
  use super::*;

  #[test]
  fn builds_a_flake_package_and_its_inputs() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#hello"])
      .unwrap();

    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    assert_eq!(results.len(), 1);
    let BuiltPath::Built { outputs, .. } = &results[0].path else {
      panic!("expected a built path, got {:?}", results[0].path);
    };
    assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["out"]);
    assert_eq!(read_output(&env, &outputs["out"]), "hello world\n");
    assert_eq!(results[0].info.priority, Some(5));
  }

  #[test]
  fn default_package_and_all_outputs() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello^*"])
      .unwrap();

    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    let BuiltPath::Built { outputs, .. } = &results[0].path else {
      panic!("expected a built path");
    };
    assert_eq!(outputs.keys().collect::<Vec<_>>(), vec!["doc", "out"]);
    assert_eq!(read_output(&env, &outputs["doc"]), "docs\n");
  }

  #[test]
  fn the_same_package_twice_is_built_once() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#hello", "./hello#default"])
      .unwrap();

    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].path, results[1].path);
  }

  #[test]
  fn derivation_mode_builds_nothing() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#greeting"])
      .unwrap();

    let results = build(&state, env.store.as_ref(), Realise::Derivation, &installables, BuildMode::Normal).unwrap();
    let out = results[0].path.out_paths().into_iter().next().unwrap();
    assert!(!env.store.is_valid_path(&out));
    assert!(results[0].result.is_none());
  }

  #[test]
  fn failing_builders_are_reported() {
    let env = TestEnv::new();
    env.write_flake(
      "broken",
      r#"
return {
  outputs = function()
    return { packages = { ["x86_64-linux"] = { default = derivation { name = "broken", builder = "exit 3" } } } }
  end,
}
"#,
    );
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./broken"])
      .unwrap();

    let err = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap_err();
    assert!(matches!(err, InstallableError::Store(StoreError::BuildFailed { .. })), "{err}");
  }

  #[test]
  fn missing_attributes_suggest_alternatives() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#helo"])
      .unwrap();

    let err = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap_err();
    let message = err.to_string();
    assert!(message.contains("does not provide attribute"), "{message}");
    assert!(message.contains("hello"), "{message}");
  }
}

mod store_paths {
  use super::*;

  #[test]
  fn built_outputs_can_be_named_directly() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let flake = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#greeting"])
      .unwrap();
    let out = to_store_path(&state, env.store.as_ref(), Realise::Outputs, OperateOn::Output, &flake[0]).unwrap();

    let literal = env.store.store_dir().print_path(&out);
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&[literal.as_str()])
      .unwrap();
    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    assert_eq!(results[0].path, BuiltPath::Opaque(out.clone()));

    let drvs = to_derivations(&state, env.store.as_ref(), &installables, true).unwrap();
    assert_eq!(drvs.into_iter().next().unwrap().name(), "greeting.drv");
  }

  #[test]
  fn derivation_literals_build_their_outputs() {
    let env = TestEnv::new();
    env.write_flake("hello", HELLO_FLAKE);
    let state = env.state();
    let flake = InstallableParser::new(&state, env.flakes_dir())
      .parse(&["./hello#greeting"])
      .unwrap();
    let drv = to_store_path(&state, env.store.as_ref(), Realise::Nothing, OperateOn::Derivation, &flake[0]).unwrap();

    let literal = format!("{}^out", env.store.store_dir().print_path(&drv));
    let installables = InstallableParser::new(&state, env.flakes_dir())
      .parse(&[literal.as_str()])
      .unwrap();
    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    let out = results[0].path.out_paths().into_iter().next().unwrap();
    assert_eq!(read_output(&env, &out), "hello\n");
  }
}

mod files {
  use super::*;

  #[test]
  fn attributes_of_a_file() {
    let env = TestEnv::new();
    let file = env.root.join("packages.lua");
    fs::write(
      &file,
      r#"
return function(args)
  return {
    tools = {
      recurseForDerivations = true,
      a = derivation { name = "tool-a", builder = "echo " .. args.greeting .. " > $out" },
      b = derivation { name = "tool-b", builder = "echo b > $out" },
    },
  }
end
"#,
    )
    .unwrap();
    let state = env.state();
    let mut auto_args = realize_lib::eval::AutoArgs::new();
    auto_args.insert(
      "greeting".to_string(),
      realize_lib::eval::AutoArg::String("hi".to_string()),
    );
    let installables = InstallableParser::new(&state, &env.root)
      .with_source(SourceExprArgs {
        file: Some(file),
        auto_args,
        ..SourceExprArgs::default()
      })
      .parse(&["tools.a", "tools"])
      .unwrap();

    let results = build(&state, env.store.as_ref(), Realise::Outputs, &installables, BuildMode::Normal).unwrap();
    assert_eq!(results.len(), 3);
    let out = results[0].path.out_paths().into_iter().next().unwrap();
    assert_eq!(read_output(&env, &out), "hi\n");
  }
}
