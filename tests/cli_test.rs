//! Integration tests for the romtools binary
//!
//! Device-facing commands run with `sh` as the shell so nothing asks for
//! root; property reads then fail and are absorbed as defaults.

mod common;

use common::TestEnv;
use std::process::{Command, Output};

use romtools::infra::dirs::{ENV_CACHE_DIR, ENV_CONFIG_DIR, ENV_DATA_DIR};

const HOST_CONFIG: &str = "[device]\nshell = \"sh\"\ncommand_timeout_secs = 10\n";

/// Helper to run romtools with every directory inside the test environment
fn run_romtools(env: &TestEnv, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_romtools"))
        .env(ENV_CONFIG_DIR, env.path().join("config"))
        .env(ENV_DATA_DIR, env.path().join("data"))
        .env(ENV_CACHE_DIR, env.path().join("cache"))
        .env_remove("ROMTOOLS_CONFIG")
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("Failed to execute romtools")
}

fn host_env() -> TestEnv {
    let env = TestEnv::new();
    env.create_file("config/config.toml", HOST_CONFIG.as_bytes());
    env
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_help_lists_commands() {
    let env = TestEnv::new();
    let output = run_romtools(&env, &["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["probe", "preflight", "unlock", "retention", "backup", "flash", "download", "install-recovery"] {
        assert!(text.contains(command), "help is missing {command}");
    }
}

#[test]
fn test_unlock_is_always_refused() {
    let env = host_env();
    let output = run_romtools(&env, &["unlock"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("Refused"), "stderr: {err}");
    assert!(err.contains("requires human-guided escalation workflow"));
}

#[test]
fn test_unlock_refusal_in_json() {
    let env = host_env();
    let output = run_romtools(&env, &["--json", "unlock"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    let line = err.lines().rev().find(|l| l.starts_with('{')).unwrap();
    let report: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(report["class"], "policy");
}

#[test]
fn test_preflight_flash_fails_on_unreadable_device() {
    let env = host_env();
    let output = run_romtools(&env, &["--json", "preflight", "flash"]);
    assert!(!output.status.success());
    let result: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(result["passed"], false);
    assert_eq!(result["operation"], "flash");
}

#[test]
fn test_config_show_uses_env_directories() {
    let env = TestEnv::new();
    let output = run_romtools(&env, &["--json", "config", "show"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));

    let config: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(config["shell"], "su");
    assert_eq!(config["min_flash_battery"], 50);
    let backups = config["backups_dir"].as_str().unwrap();
    assert!(backups.starts_with(env.path().join("data").to_str().unwrap()));
    let retention = config["retention_dir"].as_str().unwrap();
    assert!(retention.ends_with("genesis_retention"));
}

#[test]
fn test_config_init_writes_once() {
    let env = TestEnv::new();
    let first = run_romtools(&env, &["config", "init"]);
    assert!(first.status.success(), "stderr: {}", stderr(&first));
    let written = std::fs::read_to_string(env.path().join("config/config.toml")).unwrap();
    assert!(written.contains("require_retention_before_flash = true"));

    let second = run_romtools(&env, &["config", "init"]);
    assert!(!second.status.success());
    assert!(stderr(&second).contains("--force"));

    let forced = run_romtools(&env, &["config", "init", "--force"]);
    assert!(forced.status.success());
}

#[test]
fn test_invalid_config_is_reported() {
    let env = TestEnv::new();
    env.create_file("config/config.toml", b"[device\nshell =");
    let output = run_romtools(&env, &["config", "show"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("config.toml"));
}

#[test]
fn test_flash_requires_confirmation() {
    let env = host_env();
    let rom = env.rom("rom.zip", b"rom");
    let output = run_romtools(
        &env,
        &["flash", rom.path.to_str().unwrap(), "--checksum", &rom.checksum],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--yes"));
}

#[test]
fn test_install_recovery_requires_confirmation() {
    let env = host_env();
    let image = env.rom("twrp.img", b"twrp");
    let output = run_romtools(
        &env,
        &["install-recovery", image.path.to_str().unwrap(), "--checksum", &image.checksum],
    );
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--yes"));
}

#[test]
fn test_verify_checks_local_file() {
    let env = host_env();
    let rom = env.rom("rom.zip", b"lineage");
    let path = rom.path.to_str().unwrap();

    let good = run_romtools(&env, &["verify", path, "--checksum", &rom.checksum.to_uppercase()]);
    assert!(good.status.success(), "stderr: {}", stderr(&good));

    let bad = run_romtools(&env, &["verify", path, "--checksum", &"0".repeat(64)]);
    assert!(!bad.status.success());
    assert!(stderr(&bad).contains("Checksum mismatch"));
}

#[test]
fn test_backup_list_empty() {
    let env = host_env();
    let output = run_romtools(&env, &["--json", "backup", "list"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let list: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(list, serde_json::json!([]));
}
