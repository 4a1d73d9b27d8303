use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use corpus_sync::ledger::{Ledger, SqliteLedger};
use tempfile::TempDir;

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    config_path: PathBuf,
}

impl TestEnv {
    fn files(&self) -> PathBuf {
        self.root.join("files")
    }

    fn ledger_path(&self) -> PathBuf {
        self.root.join("data/ledger.sqlite")
    }

    fn lock_key(&self) -> String {
        format!(
            "filesystem:{}|local:{}",
            self.files().display(),
            self.ledger_path().display()
        )
    }
}

fn setup_test_env() -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("alpha.md"),
        "# Alpha Document\n\nThis is the alpha bid about bridge maintenance.\n\nIt covers inspection schedules and budgets.",
    )
    .unwrap();
    fs::write(
        files_dir.join("beta.md"),
        "# Beta Document\n\nA proposal for network upgrades across three sites.\n\nIncludes vendor comparisons.",
    )
    .unwrap();
    fs::write(
        files_dir.join("gamma.txt"),
        "Gamma plain text file.\n\nNotes about staffing and the delivery timeline.",
    )
    .unwrap();

    let config_content = format!(
        r#"[ledger]
path = "{ledger}"

[sync]
workers = 2

[chunking]
chunk_size = 120
chunk_overlap = 20

[embedding]
provider = "hashed"
dims = 64

[store]
kind = "filesystem"

[store.filesystem]
root = "{files}"
include_globs = ["**/*.md", "**/*.txt"]

[index]
kind = "local"
"#,
        ledger = root.join("data/ledger.sqlite").display(),
        files = files_dir.display(),
    );

    let config_path = config_dir.join("csync.toml");
    fs::write(&config_path, config_content).unwrap();

    TestEnv {
        _tmp: tmp,
        root,
        config_path,
    }
}

fn run_csync(config_path: &Path, args: &[&str]) -> (String, String, Option<i32>) {
    let binary = env!("CARGO_BIN_EXE_csync");
    let output = Command::new(binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .env_remove("SECURE")
        .env_remove("RUST_LOG")
        .env_remove("SHAREPOINT_SITE_NAME")
        .env_remove("SHAREPOINT_HOST")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run csync binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.code())
}

fn sync_json(env: &TestEnv, extra: &[&str]) -> serde_json::Value {
    let mut args = vec!["sync", "--json", "--progress", "off"];
    args.extend_from_slice(extra);
    let (stdout, stderr, code) = run_csync(&env.config_path, &args);
    assert_eq!(code, Some(0), "sync failed: stdout={}, stderr={}", stdout, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("bad JSON ({}): {}", e, stdout))
}

#[test]
fn test_init_creates_ledger() {
    let env = setup_test_env();

    let (stdout, stderr, code) = run_csync(&env.config_path, &["init"]);
    assert_eq!(code, Some(0), "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(env.ledger_path().exists());
}

#[test]
fn test_init_idempotent() {
    let env = setup_test_env();

    let (_, _, first) = run_csync(&env.config_path, &["init"]);
    assert_eq!(first, Some(0), "First init failed");

    let (_, _, second) = run_csync(&env.config_path, &["init"]);
    assert_eq!(second, Some(0), "Second init failed (not idempotent)");
}

#[test]
fn test_sync_then_rerun_is_a_no_op() {
    let env = setup_test_env();

    let first = sync_json(&env, &[]);
    assert_eq!(first["listed"], 3);
    assert_eq!(first["ingested"], 3);
    assert_eq!(first["failed"], 0);
    assert!(first["chunks_upserted"].as_u64().unwrap() >= 3);

    let second = sync_json(&env, &[]);
    assert_eq!(second["ingested"], 0);
    assert_eq!(second["skipped"], 3);
    assert_eq!(second["deleted"], 0);
    assert_eq!(second["chunks_upserted"], 0);
}

#[test]
fn test_sync_picks_up_changes_and_deletions() {
    let env = setup_test_env();
    sync_json(&env, &[]);

    fs::write(
        env.files().join("alpha.md"),
        "# Alpha Document\n\nRevised scope: the bid now includes resurfacing.",
    )
    .unwrap();
    fs::remove_file(env.files().join("gamma.txt")).unwrap();
    fs::write(env.files().join("delta.md"), "A new document about procurement.").unwrap();

    let stats = sync_json(&env, &[]);
    assert_eq!(stats["listed"], 3);
    assert_eq!(stats["ingested"], 2);
    assert_eq!(stats["skipped"], 1);
    assert_eq!(stats["deleted"], 1);
    assert_eq!(stats["failed"], 0);
}

#[test]
fn test_sync_dry_run_writes_nothing() {
    let env = setup_test_env();

    let plan = sync_json(&env, &["--dry-run"]);
    assert_eq!(plan["dry_run"], true);
    assert_eq!(plan["listed"], 3);

    // Nothing was recorded, so a real pass still ingests everything.
    let stats = sync_json(&env, &[]);
    assert_eq!(stats["ingested"], 3);
}

#[test]
fn test_sync_with_limit_defers_the_rest() {
    let env = setup_test_env();

    let first = sync_json(&env, &["--limit", "1"]);
    assert_eq!(first["ingested"], 1);
    assert_eq!(first["deferred"], 2);

    let second = sync_json(&env, &[]);
    assert_eq!(second["ingested"], 2);
    assert_eq!(second["skipped"], 1);
}

#[test]
fn test_human_summary() {
    let env = setup_test_env();

    let (stdout, stderr, code) = run_csync(&env.config_path, &["sync", "--progress", "off"]);
    assert_eq!(code, Some(0), "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Sync complete"));
    assert!(stdout.contains("ingested"));
}

#[test]
fn test_status_reports_counts() {
    let env = setup_test_env();
    sync_json(&env, &[]);

    let (stdout, stderr, code) = run_csync(&env.config_path, &["status", "--json"]);
    assert_eq!(code, Some(0), "status failed: stdout={}, stderr={}", stdout, stderr);
    let summary: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(summary["total"], 3);
    assert_eq!(summary["ingested"], 3);
    assert_eq!(summary["failed"], 0);
    assert_eq!(summary["locks"].as_array().unwrap().len(), 0);

    let (stdout, _, code) = run_csync(&env.config_path, &["status"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("Ledger Status"));
}

#[tokio::test]
async fn test_lock_contention_exits_2_and_unlock_clears_it() {
    let env = setup_test_env();
    run_csync(&env.config_path, &["init"]);

    {
        let ledger = SqliteLedger::open(&env.ledger_path()).await.unwrap();
        ledger
            .try_acquire_lock(&env.lock_key(), "other-host:1:abc", Duration::from_secs(600))
            .await
            .unwrap();
        ledger.close().await;
    }

    let (stdout, stderr, code) = run_csync(&env.config_path, &["sync", "--progress", "off"]);
    assert_eq!(code, Some(2), "expected contention: stdout={}, stderr={}", stdout, stderr);
    assert!(stderr.contains("other-host:1:abc"));

    let (stdout, _, code) = run_csync(&env.config_path, &["unlock"]);
    assert_eq!(code, Some(0));
    assert!(stdout.contains("Released lock"));

    let stats = sync_json(&env, &[]);
    assert_eq!(stats["ingested"], 3);
}

#[test]
fn test_failure_threshold_sets_exit_code() {
    let env = setup_test_env();
    // No text to index, so this document fails.
    fs::write(env.files().join("empty.md"), "   \n").unwrap();

    let (stdout, stderr, code) = run_csync(
        &env.config_path,
        &["sync", "--json", "--progress", "off", "--max-failures", "0"],
    );
    assert_eq!(code, Some(1), "expected threshold breach: stdout={}, stderr={}", stdout, stderr);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["failed"], 1);
    assert_eq!(stats["ingested"], 3);

    // Without a threshold partial failure is still a successful pass, and the
    // failed document is retried.
    let stats = sync_json(&env, &[]);
    assert_eq!(stats["failed"], 1);
    assert_eq!(stats["skipped"], 3);
}

#[test]
fn test_missing_root_is_fatal() {
    let env = setup_test_env();
    fs::remove_dir_all(env.files()).unwrap();

    let (_, stderr, code) = run_csync(&env.config_path, &["sync", "--progress", "off"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("cannot list documents"));
}

#[test]
fn test_invalid_config_fails_fast() {
    let env = setup_test_env();
    fs::write(
        &env.config_path,
        "[store]\nkind = \"sharepoint\"\n\n[index]\nkind = \"local\"\n",
    )
    .unwrap();

    let (_, stderr, code) = run_csync(&env.config_path, &["sync"]);
    assert_eq!(code, Some(1));
    assert!(stderr.contains("missing required setting"));
}
