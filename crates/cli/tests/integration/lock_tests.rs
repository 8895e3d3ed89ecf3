use predicates::prelude::*;

use super::common::TestEnv;

const TOP_FLAKE: &str = r#"
return {
  inputs = { dep = "path:../dep" },
  outputs = function(inputs)
    return { value = inputs.dep.value }
  end,
}
"#;

const DEP_FLAKE: &str = r#"
return {
  outputs = function()
    return { value = "dep" }
  end,
}
"#;

fn env_with_input() -> TestEnv {
  let env = TestEnv::new();
  env.write_file("work/flake.lua", TOP_FLAKE);
  env.write_file("dep/flake.lua", DEP_FLAKE);
  env
}

#[test]
fn lock_writes_the_lock_file() {
  let env = env_with_input();

  env
    .realize_cmd()
    .arg("lock")
    .assert()
    .success()
    .stderr(predicate::str::contains("Locked"))
    .stderr(predicate::str::contains("dep"));

  let lock = std::fs::read_to_string(env.work_path().join("flake.lock")).unwrap();
  assert!(lock.contains("narHash"), "{lock}");
}

#[test]
fn no_write_lock_file_leaves_disk_alone() {
  let env = env_with_input();

  env.realize_cmd().args(["lock", "--no-write-lock-file"]).assert().success();

  assert!(!env.work_path().join("flake.lock").exists());
}

#[test]
fn json_prints_the_lock() {
  let env = env_with_input();

  let stdout = env.stdout(&["lock", "--json"]);

  let json: serde_json::Value = serde_json::from_str(&stdout).unwrap();
  assert!(json["nodes"]["dep"].is_object(), "{json}");
}

#[test]
fn missing_flakes_are_errors() {
  let env = TestEnv::new();

  env.realize_cmd().args(["lock", "./nowhere"]).assert().failure();
}
