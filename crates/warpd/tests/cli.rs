//! End-to-end tests of the warpd command line against a temporary data
//! directory.

use std::path::Path;
use std::process::{Command, Output};

const SPEC: &str = r#"
[[instance]]
name = "default"

[[instance.step]]
region = "us-east-1"
"#;

fn warpd(data_dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_warpd"))
        .arg("--data-dir")
        .arg(data_dir)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("warpd should start")
}

fn succeed(data_dir: &Path, args: &[&str]) -> String {
    let output = warpd(data_dir, args);
    assert!(
        output.status.success(),
        "warpd {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

fn fail(data_dir: &Path, args: &[&str]) -> String {
    let output = warpd(data_dir, args);
    assert!(!output.status.success(), "warpd {args:?} should have failed");
    String::from_utf8_lossy(&output.stderr).into_owned()
}

fn json(stdout: &str) -> serde_json::Value {
    serde_json::from_str(stdout).unwrap()
}

#[test]
fn validate_lists_jobs_and_rejects_bad_specs() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("deployment.toml");
    std::fs::write(&good, SPEC).unwrap();
    let stdout = succeed(dir.path(), &["validate", good.to_str().unwrap()]);
    assert!(stdout.contains("default: system-test, staging-test, production-us-east-1"));

    let bad = dir.path().join("bad.toml");
    std::fs::write(&bad, "[[instance]]\nname = \"default\"\n[[instance.step]]\nregion = \"a\"\ndelay = \"1h\"\n").unwrap();
    let stderr = fail(dir.path(), &["validate", bad.to_str().unwrap()]);
    assert!(stderr.contains("exactly one of"));
}

#[test]
fn submitted_revision_is_rolled_out_by_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let spec = dir.path().join("deployment.toml");
    std::fs::write(&spec, SPEC).unwrap();
    let spec = spec.to_str().unwrap();

    let stderr = fail(&data, &["run", "--once"]);
    assert!(stderr.contains("release-version"));

    succeed(&data, &["release-version", "1.0.0", "--confidence", "high"]);
    fail(&data, &["submit", "tenant.app", "--build", "1"]);
    succeed(&data, &["submit", "tenant.app", "--build", "1", "--spec", spec]);

    let evaluation = json(&succeed(&data, &["evaluate", "tenant.app"]));
    assert_eq!(evaluation["actions"]["to_trigger"].as_array().unwrap().len(), 2);

    let report = json(&succeed(&data, &["run", "--once"]));
    assert_eq!(report["triggered"], 2);

    for job in ["system-test", "staging-test"] {
        succeed(
            &data,
            &["report", "tenant.app", "--job", job, "--run", "1", "--outcome", "success"],
        );
    }
    let report = json(&succeed(&data, &["run", "--once"]));
    assert_eq!(report["triggered"], 1);

    // Build numbers only go up.
    fail(&data, &["submit", "tenant.app", "--build", "1"]);
}

#[test]
fn operator_commands_check_their_input() {
    let dir = tempfile::tempdir().unwrap();
    let spec = dir.path().join("deployment.toml");
    std::fs::write(&spec, SPEC).unwrap();
    let data = dir.path().join("data");

    succeed(&data, &["release-version", "1.0.0"]);
    succeed(&data, &["submit", "tenant.app", "--build", "1", "--spec", spec.to_str().unwrap()]);

    succeed(
        &data,
        &["pause", "tenant.app", "--job", "production-us-east-1", "--duration", "2h"],
    );
    succeed(&data, &["resume", "tenant.app", "--job", "production-us-east-1"]);
    fail(
        &data,
        &["pause", "tenant.app", "--job", "production-us-east-1", "--duration", "4d"],
    );
    fail(&data, &["pause", "tenant.app", "--job", "production-eu-west-1", "--duration", "1h"]);
    fail(&data, &["report", "tenant.app", "--job", "system-test", "--run", "1", "--outcome", "success"]);
    succeed(&data, &["cancel", "tenant.app", "--scope", "revision"]);
    fail(&data, &["cancel", "tenant.app", "--scope", "everything"]);
}
