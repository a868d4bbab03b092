use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::{json, Value};
use std::path::Path;
use std::process::Command;
use tempfile::TempDir;

const CACHE: &str = r#"{
    "dailyActivity": [
        {"date": "2026-03-01", "sessionCount": 3},
        {"date": "2026-03-02", "sessionCount": 1}
    ],
    "dailyModelTokens": [
        {"date": "2026-03-01", "tokensByModel": {"claude-sonnet-4-5": 1200}},
        {"date": "2026-03-02", "tokensByModel": {"claude-sonnet-4-5": 300}}
    ],
    "modelUsage": {
        "claude-sonnet-4-5": {"inputTokens": 1000000, "outputTokens": 0}
    }
}"#;

struct Env {
    dir: TempDir,
}

impl Env {
    fn new(with_cache: bool) -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("claude")).unwrap();
        if with_cache {
            std::fs::write(dir.path().join("claude").join("stats-cache.json"), CACHE).unwrap();
        }
        Self { dir }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tokmon"));
        cmd.arg("--config")
            .arg(self.path().join("config.toml"))
            .env("TOKEN_MONITOR_CLAUDE_DIR", self.path().join("claude"))
            .env("TOKEN_MONITOR_DATABASE", self.path().join("monitor.db"))
            .env("NO_COLOR", "1")
            .env_remove("RUST_LOG");
        cmd
    }

    fn run_json(&self, args: &[&str]) -> Value {
        let output = self.cmd().args(args).assert().success().get_output().stdout.clone();
        serde_json::from_slice(&output).expect("valid json output")
    }
}

#[test]
fn help_lists_commands() {
    let env = Env::new(false);
    env.cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("snapshot"));
}

#[test]
fn stats_json_reads_cache() {
    let env = Env::new(true);
    let v = env.run_json(&["stats", "--json"]);
    assert_eq!(v["total_sessions"], json!(4));
    assert_eq!(v["total_tokens"], json!(1000000));
    assert_eq!(v["models"][0]["model"], "claude-sonnet-4-5");
    assert_eq!(v["daily_activities"].as_array().unwrap().len(), 2);
}

#[test]
fn stats_without_cache_fails() {
    let env = Env::new(false);
    env.cmd()
        .arg("stats")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Stats cache is not available"));
}

#[test]
fn stats_text_output() {
    let env = Env::new(true);
    env.cmd()
        .arg("stats")
        .assert()
        .success()
        .stdout(predicate::str::contains("claude-sonnet-4-5"))
        .stdout(predicate::str::contains("$3.00"));
}

#[test]
fn cost_json_matches_pricing() {
    let env = Env::new(true);
    let v = env.run_json(&["cost", "--json"]);
    assert_eq!(v["summary"]["total_cost_usd"], json!(3.0));
    assert_eq!(v["daily"]["2026-03-01"], json!(0.0));
}

#[test]
fn cost_rejects_bad_date() {
    let env = Env::new(true);
    env.cmd()
        .args(["cost", "--start", "2026-02-30"])
        .assert()
        .failure();
}

#[test]
fn trends_prints_each_day() {
    let env = Env::new(true);
    env.cmd()
        .args(["trends", "--period", "1"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2026-03-01"))
        .stdout(predicate::str::contains("-75.0%"));
}

#[test]
fn snapshot_then_history() {
    let env = Env::new(true);
    env.cmd()
        .arg("snapshot")
        .assert()
        .success()
        .stdout(predicate::str::contains("Saved snapshot 1"));

    env.cmd()
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("#1"))
        .stdout(predicate::str::contains("1,000,000"));

    env.cmd()
        .args(["cleanup", "--days", "30"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Deleted 0 snapshot(s)"));
}

#[test]
fn history_empty_database() {
    let env = Env::new(false);
    env.cmd()
        .arg("history")
        .assert()
        .success()
        .stdout(predicate::str::contains("No snapshots stored."));
}

#[test]
fn history_limit_out_of_range_fails() {
    let env = Env::new(false);
    for limit in ["0", "1001"] {
        env.cmd()
            .args(["history", "--limit", limit])
            .assert()
            .failure()
            .stderr(predicate::str::contains("--limit"));
    }
}

#[test]
fn config_shows_effective_values() {
    let env = Env::new(false);
    env.cmd()
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"))
        .stdout(predicate::str::contains("\"heartbeat_secs\": 30"));
}

#[test]
fn invalid_port_override_fails() {
    let env = Env::new(false);
    env.cmd()
        .arg("stats")
        .env("TOKEN_MONITOR_PORT", "http")
        .assert()
        .failure()
        .stderr(predicate::str::contains("TOKEN_MONITOR_PORT"));
}
