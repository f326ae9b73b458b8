use assert_cmd::Command;
use predicates::prelude::*;

fn collector(dir: &tempfile::TempDir) -> Command {
    let mut cmd = Command::cargo_bin("collector").unwrap();
    cmd.env("PELO_CONFIG_DIR", dir.path().join("config"))
        .env("PELO_DATA_DIR", dir.path().join("data"))
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("collector").unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("scrape").and(predicate::str::contains("status")));
}

#[test]
fn status_before_any_run_writes_default_config() {
    let dir = tempfile::tempdir().unwrap();
    collector(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"scheduler\": null"));
    assert!(dir.path().join("config").join("config.toml").exists());

    collector(&dir)
        .args(["status", "--text"])
        .assert()
        .success()
        .stdout(predicate::str::contains("no status recorded yet"));
}

#[test]
fn unknown_record_type_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    collector(&dir)
        .args(["scrape", "races", "tour-de-france"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("races"));
}

#[test]
fn unreachable_site_fails_the_scrape() {
    let dir = tempfile::tempdir().unwrap();
    collector(&dir)
        .env("PELO_MIN_REQUEST_DELAY_MS", "0")
        .args([
            "scrape",
            "race-result",
            "tour-de-france/2024",
            "--base-url",
            "http://127.0.0.1:9",
            "--retries",
            "0",
            "--no-robots",
            "--timeout-secs",
            "2",
            "--dry-run",
        ])
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[cfg(unix)]
#[test]
fn sigterm_stops_the_scheduler_cleanly() {
    use std::process::{Command as Std, Stdio};
    use std::thread::sleep;
    use std::time::{Duration, Instant};

    let dir = tempfile::tempdir().unwrap();
    let mut child = Std::new(assert_cmd::cargo::cargo_bin("collector"))
        .env("PELO_CONFIG_DIR", dir.path().join("config"))
        .env("PELO_DATA_DIR", dir.path().join("data"))
        .env("PELO_BACKEND_ENABLED", "false")
        .args(["start", "--snapshot-secs", "1"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    let running = |dir: &tempfile::TempDir| {
        let out = collector(dir).arg("status").output().unwrap();
        String::from_utf8_lossy(&out.stdout).contains("\"running\": true")
    };
    let deadline = Instant::now() + Duration::from_secs(20);
    while !running(&dir) {
        assert!(Instant::now() < deadline, "no running snapshot written");
        sleep(Duration::from_millis(100));
    }

    let killed = Std::new("kill").args(["-TERM", &child.id().to_string()]).status().unwrap();
    assert!(killed.success());
    let deadline = Instant::now() + Duration::from_secs(20);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() > deadline {
            child.kill().unwrap();
            panic!("collector ignored SIGTERM");
        }
        sleep(Duration::from_millis(100));
    };
    assert!(status.success(), "{status:?}");

    collector(&dir)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"running\": false"));
}
