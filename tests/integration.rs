use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn mirror_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_mirror"))
}

fn write_deals(dir: &Path, records: Value) {
    let fixture = json!({
        "descriptor": {
            "source_table_id": "tbl_deals",
            "display_name": "Deals",
            "fields": [
                { "slug": "name",    "label": "Name",     "kind": "text" },
                { "slug": "status",  "label": "Status",   "kind": "singleSelect",
                  "choice_values": ["Active", "Closed"] },
                { "slug": "due",     "label": "Due Date", "kind": "date" },
                { "slug": "revenue", "label": "Revenue",  "kind": "currency" },
                { "slug": "tags",    "label": "Tags",     "kind": "multipleSelect" }
            ]
        },
        "records": records,
    });
    fs::write(dir.join("tbl_deals.json"), fixture.to_string()).unwrap();
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let fixtures = root.join("fixtures");
    fs::create_dir_all(&fixtures).unwrap();

    write_deals(
        &fixtures,
        json!([
            { "id": "r1", "fields": { "name": "Acme Corp", "status": "Active",
              "due": "2024-06-25", "revenue": 100, "tags": ["a"] } },
            { "id": "r2", "fields": { "name": "Beta LLC", "status": "Active",
              "due": "2024-06-10", "revenue": 75, "tags": ["a", "b"] } },
            { "id": "r3", "fields": { "name": "Gamma", "status": "Closed",
              "due": "2024-06-01", "revenue": 500, "tags": ["b"] } }
        ]),
    );
    fs::write(
        fixtures.join("tbl_notes.json"),
        json!({
            "descriptor": {
                "display_name": "Notes",
                "fields": [{ "slug": "body", "label": "Body", "kind": "textarea" }]
            },
            "records": []
        })
        .to_string(),
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/mirror.sqlite"

[cache]
records_ttl_secs = 900

[sync]
page_size = 2

[stats]
flush_every_ops = 50

[source]
dir = "{root}/fixtures"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("mirror.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_mirror(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = mirror_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run mirror binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn query_ids(config_path: &Path, extra: &[&str]) -> (Vec<String>, i64) {
    let mut args = vec!["query", "tbl_deals"];
    args.extend_from_slice(extra);
    let (stdout, stderr, success) = run_mirror(config_path, &args);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);

    let result: Value = serde_json::from_str(&stdout).unwrap();
    let ids = result["rows"]
        .as_array()
        .unwrap()
        .iter()
        .map(|row| row["id"].as_str().unwrap().to_string())
        .collect();
    (ids, result["total_count"].as_i64().unwrap())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mirror(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/mirror.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_mirror(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_mirror(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_tables_lists_fixtures() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mirror(&config_path, &["tables"]);
    assert!(success, "tables failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("tbl_deals"));
    assert!(stdout.contains("Deals"));
    assert!(stdout.contains("tbl_notes"));
    assert!(stdout.contains("not mirrored"));

    run_mirror(&config_path, &["sync", "tbl_deals"]);
    let (stdout, _, _) = run_mirror(&config_path, &["tables"]);
    assert!(stdout.contains("src_deals_tbl_deals"));
}

#[test]
fn test_sync_reports_records_and_pages() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_mirror(&config_path, &["sync", "tbl_deals"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("3 records in 2 page(s)"), "stdout={}", stdout);
}

#[test]
fn test_sync_unknown_table_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_mirror(&config_path, &["sync", "tbl_missing"]);
    assert!(!success);
    assert!(stderr.contains("tbl_missing"), "stderr={}", stderr);
}

#[test]
fn test_query_with_filter_and_sort() {
    let (_tmp, config_path) = setup_test_env();

    let filter = r#"{"operator":"and","clauses":[
        {"field":"status","comparator":"is","value":"Active"},
        {"field":"revenue","comparator":"is_greater_than","value":50}
    ]}"#;
    let (ids, total) = query_ids(
        &config_path,
        &["--filter", filter, "--sort", "revenue:desc"],
    );
    assert_eq!(ids, vec!["r1", "r2"]);
    assert_eq!(total, 2);

    let (ids, total) = query_ids(
        &config_path,
        &["--sort", "due", "--limit", "1", "--offset", "1"],
    );
    assert_eq!(ids, vec!["r2"]);
    assert_eq!(total, 3);

    let tags = r#"{"clauses":[{"field":"tags","comparator":"has_any_of","value":["b"]}]}"#;
    let (ids, _) = query_ids(&config_path, &["--filter", tags, "--sort", "name"]);
    assert_eq!(ids, vec!["r2", "r3"]);
}

#[test]
fn test_query_rejects_bad_input() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_mirror(&config_path, &["query", "tbl_deals", "--filter", "{"]);
    assert!(!success);
    assert!(stderr.contains("--filter"), "stderr={}", stderr);

    let unknown = r#"{"clauses":[{"field":"nope","comparator":"is","value":1}]}"#;
    let (_, stderr, success) =
        run_mirror(&config_path, &["query", "tbl_deals", "--filter", unknown]);
    assert!(!success);
    assert!(stderr.contains("unknown field 'nope'"), "stderr={}", stderr);

    let (_, stderr, success) =
        run_mirror(&config_path, &["query", "tbl_deals", "--sort", "revenue:sideways"]);
    assert!(!success);
    assert!(stderr.contains("--sort"), "stderr={}", stderr);
}

#[test]
fn test_invalidate_then_query_sees_remote_change() {
    let (tmp, config_path) = setup_test_env();

    let (ids, _) = query_ids(&config_path, &[]);
    assert_eq!(ids.len(), 3);

    write_deals(
        &tmp.path().join("fixtures"),
        json!([
            { "id": "r1", "fields": { "name": "Acme Corp", "status": "Closed" } },
            { "id": "r9", "fields": { "name": "New Deal", "status": "Active" } }
        ]),
    );

    // Still fresh: served from the mirror
    let closed = r#"{"clauses":[{"field":"status","comparator":"is","value":"Closed"}]}"#;
    let (ids, _) = query_ids(&config_path, &["--filter", closed]);
    assert_eq!(ids, vec!["r3"]);

    let (stdout, stderr, success) =
        run_mirror(&config_path, &["invalidate", "records", "tbl_deals"]);
    assert!(success, "invalidate failed: stderr={}", stderr);
    assert!(stdout.contains("Invalidated 1 freshness entry"), "stdout={}", stdout);

    let (ids, _) = query_ids(&config_path, &["--filter", closed, "--sort", "id"]);
    assert_eq!(ids, vec!["r1"]);

    // r2 and r3 are gone from the remote, so they are gone locally too
    let (ids, total) = query_ids(&config_path, &["--sort", "id"]);
    assert_eq!(ids, vec!["r1", "r9"]);
    assert_eq!(total, 2);
}

#[test]
fn test_freshness_and_refresh() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_mirror(&config_path, &["freshness", "records:tbl_deals"]);
    assert!(success);
    assert!(stdout.contains("Fresh:        false"));
    assert!(stdout.contains("never"));

    let (stdout, stderr, success) = run_mirror(&config_path, &["refresh", "records", "tbl_deals"]);
    assert!(success, "refresh failed: stderr={}", stderr);
    assert!(stdout.contains("Refreshed tbl_deals: 3 records"));

    let (stdout, _, _) = run_mirror(&config_path, &["freshness", "records", "tbl_deals"]);
    assert!(stdout.contains("Fresh:        true"));
    assert!(stdout.contains("just now"));

    let (_, _, success) = run_mirror(&config_path, &["invalidate", "tables"]);
    assert!(success);
    let (stdout, _, _) = run_mirror(&config_path, &["freshness", "records", "tbl_deals"]);
    assert!(stdout.contains("Fresh:        false"));
}

#[test]
fn test_unknown_scope_fails() {
    let (_tmp, config_path) = setup_test_env();

    let (_, stderr, success) = run_mirror(&config_path, &["invalidate", "widgets"]);
    assert!(!success);
    assert!(stderr.contains("unknown scope"), "stderr={}", stderr);
}

#[test]
fn test_stats_counts_hits_and_misses() {
    let (_tmp, config_path) = setup_test_env();

    query_ids(&config_path, &[]);
    query_ids(&config_path, &[]);
    query_ids(&config_path, &[]);

    let (stdout, stderr, success) = run_mirror(&config_path, &["stats"]);
    assert!(success, "stats failed: stderr={}", stderr);
    assert!(stdout.contains("Tables:      1"));

    let line = stdout
        .lines()
        .find(|l| l.trim_start().starts_with("tbl_deals"))
        .unwrap_or_else(|| panic!("no stats row: {}", stdout));
    let cols: Vec<&str> = line.split_whitespace().collect();
    assert_eq!(cols[1], "2", "hits: {}", line);
    assert_eq!(cols[2], "1", "misses: {}", line);
    assert_eq!(cols[4], "3", "records: {}", line);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_mirror(&tmp.path().join("nope.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
