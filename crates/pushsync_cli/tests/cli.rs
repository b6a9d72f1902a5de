//! End-to-end runs of the `pushsync` binary over one state directory.

use serde_json::Value;
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

fn pushsync(dir: &Path, args: &[&str]) -> (bool, String) {
    let output = Command::new(env!("CARGO_BIN_EXE_pushsync"))
        .arg("--path")
        .arg(dir)
        .args(args)
        .output()
        .expect("Failed to run pushsync");
    (
        output.status.success(),
        String::from_utf8_lossy(&output.stdout).into_owned(),
    )
}

#[test]
fn state_carries_across_invocations() {
    let dir = TempDir::new().unwrap();

    let (ok, out) = pushsync(dir.path(), &["register", "token-1"]);
    assert!(ok, "{out}");
    assert!(out.contains("registration reg-1"), "{out}");

    let (ok, out) = pushsync(dir.path(), &["set", "user", "firstName", "Ana"]);
    assert!(ok, "{out}");
    let (_, shown) = pushsync(dir.path(), &["show"]);
    assert!(shown.contains("\"Ana\" (dirty)"), "{shown}");

    let (ok, out) = pushsync(dir.path(), &["sync"]);
    assert!(ok, "{out}");

    let (_, json) = pushsync(dir.path(), &["show", "--format", "json"]);
    let local: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(local["registration_id"], "reg-1");
    assert!(local["user"]["dirty"].as_object().unwrap().is_empty());

    let (_, json) = pushsync(dir.path(), &["api-state"]);
    let api: Value = serde_json::from_str(&json).unwrap();
    assert_eq!(api["users"]["reg-1"]["firstName"], "Ana");
}

#[test]
fn messages_round_trip_through_the_fake_inbox() {
    let dir = TempDir::new().unwrap();
    pushsync(dir.path(), &["register", "token"]);

    let (ok, _) = pushsync(dir.path(), &["deliver", "m1", "hello"]);
    assert!(ok);
    let (ok, out) = pushsync(dir.path(), &["fetch"]);
    assert!(ok);
    assert!(out.contains("new messages: m1"), "{out}");

    // The inbox is kept on disk, so the next run reports nothing new.
    let (ok, out) = pushsync(dir.path(), &["fetch"]);
    assert!(ok);
    assert!(out.contains("no new messages"), "{out}");
    assert!(dir.path().join("messages.json").exists());
}

#[test]
fn bad_input_exits_non_zero() {
    let dir = TempDir::new().unwrap();
    let (ok, _) = pushsync(dir.path(), &["set", "user", "noSuchKey", "1"]);
    assert!(!ok);

    let (ok, out) = pushsync(dir.path(), &["sync"]);
    assert!(ok);
    assert!(out.contains("not registered"), "{out}");
}
