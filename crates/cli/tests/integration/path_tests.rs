use predicates::prelude::*;

use super::common::TestEnv;

#[test]
fn path_prints_the_single_output() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["path", ".#greeting"]);

  let path = stdout.trim();
  assert!(path.ends_with("-greeting"), "{path}");
  assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
}

#[test]
fn path_with_an_activation_attribute() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["path", ".#nixosConfigurations.machine.config.system.build", "--attr", "toplevel"]);

  assert!(stdout.trim().ends_with("-greeting"));
}

#[test]
fn path_rejects_several_outputs() {
  let env = TestEnv::with_hello_flake();

  env
    .realize_cmd()
    .args(["path", ".#hello^*"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("requires that the argument produces a single store path"));
}

#[test]
fn path_of_the_derivation() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["path", ".#greeting", "--derivation"]);

  assert!(stdout.trim().ends_with("-greeting.drv"));
}

#[test]
fn drv_path_follows_derivers() {
  let env = TestEnv::with_hello_flake();
  let out = env.stdout(&["path", ".#greeting"]);

  let stdout = env.stdout(&["drv-path", ".#hello", out.trim()]);

  let lines: Vec<&str> = stdout.lines().collect();
  assert_eq!(lines.len(), 2);
  assert!(lines.iter().any(|l| l.ends_with("-greeting.drv")));
  assert!(lines.iter().any(|l| l.ends_with("-hello.drv")));
}

#[test]
fn result_links_are_installables() {
  let env = TestEnv::with_hello_flake();
  env.realize_cmd().args(["build", ".#greeting"]).assert().success();

  let stdout = env.stdout(&["path", "./result"]);

  assert!(stdout.trim().ends_with("-greeting"));
}

#[test]
fn completion_lists_packages() {
  let env = TestEnv::with_hello_flake();

  let stdout = env.stdout(&["complete", ".#gr"]);

  assert_eq!(stdout.trim(), ".#greeting");
}
