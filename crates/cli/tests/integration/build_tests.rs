use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn build_links_the_default_package() {
  let env = TestEnv::with_hello_flake();

  env
    .realize_cmd()
    .arg("build")
    .assert()
    .success()
    .stderr(predicate::str::contains("Built 1 path(s)"));

  let result = env.work_path().join("result");
  assert_eq!(std::fs::read_to_string(&result).unwrap(), "hello world\n");
  assert!(std::fs::read_link(&result).unwrap().starts_with(env.store_path()));
}

#[test]
fn all_outputs_get_links() {
  let env = TestEnv::with_hello_flake();

  env.realize_cmd().args(["build", ".#hello^*"]).assert().success();

  assert_eq!(std::fs::read_to_string(env.work_path().join("result-doc")).unwrap(), "docs\n");
  assert!(env.work_path().join("result").exists());
}

#[test]
fn several_installables_are_numbered() {
  let env = TestEnv::with_hello_flake();

  env
    .realize_cmd()
    .args(["build", ".#hello", ".#greeting", "--out-link", "out"])
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(env.work_path().join("out")).unwrap(), "hello world\n");
  assert_eq!(std::fs::read_to_string(env.work_path().join("out-1")).unwrap(), "hello\n");
}

#[test]
fn no_link_prints_out_paths() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["build", ".#greeting", "--no-link", "--print-out-paths"]);

  let path = stdout.trim();
  assert!(path.ends_with("-greeting"), "{path}");
  assert!(!env.work_path().join("result").exists());
}

#[test]
fn json_lists_outputs() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["build", ".#hello^out,doc", "--json", "--no-link"]);

  let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
  let outputs = &json[0]["outputs"];
  assert!(outputs["out"].as_str().unwrap().ends_with("-hello"));
  assert!(outputs["doc"].as_str().unwrap().ends_with("-hello-doc"));
  assert!(json[0]["drvPath"].as_str().unwrap().ends_with("-hello.drv"));
}

#[test]
fn dry_run_builds_nothing() {
  let env = TestEnv::with_hello_flake();

  env
    .realize_cmd()
    .args(["build", ".#hello", "--dry-run"])
    .assert()
    .success()
    .stderr(predicate::str::contains("these 2 derivation(s) would be built"));

  assert!(!env.work_path().join("result").exists());
}

#[test]
fn expressions_and_arguments() {
  let env = TestEnv::new();

  env
    .realize_cmd()
    .args([
      "build",
      "--expr",
      "function(args) return { pkg = derivation { name = 'pkg', builder = 'echo ' .. args.word .. ' > $out' } } end",
      "--argstr",
      "word",
      "bonjour",
      "pkg",
    ])
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(env.work_path().join("result")).unwrap(), "bonjour\n");
}

#[test]
fn override_attrs_changes_the_derivation() {
  let env = TestEnv::new();
  env.write_file(
    "work/default.lua",
    r#"return { tool = builtins.mkDerivation { name = "tool", builder = "echo plain > $out" } }"#,
  );

  env
    .realize_cmd()
    .args([
      "build",
      "--file",
      "default.lua",
      "--override-attrs",
      "{ builder = 'echo patched > $out' }",
      "tool",
    ])
    .assert()
    .success();

  assert_eq!(std::fs::read_to_string(env.work_path().join("result")).unwrap(), "patched\n");
}

#[test]
fn exclusive_sources_are_rejected() {
  let env = TestEnv::new();

  env
    .realize_cmd()
    .args(["build", "--file", "a.lua", "--expr", "{}", "x"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("are exclusive"));
}

#[test]
fn failing_builds_fail_the_command() {
  let env = TestEnv::new();
  env.write_file("work/default.lua", r#"return { bad = derivation { name = "bad", builder = "exit 1" } }"#);

  env
    .realize_cmd()
    .args(["build", "--file", "default.lua", "bad"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("Build failed"));
}

#[test]
fn missing_attributes_are_suggested() {
  let env = TestEnv::with_hello_flake();

  env
    .realize_cmd()
    .args(["build", ".#helo"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("does not provide attribute"))
    .stderr(predicate::str::contains("hello"));
}
