use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::Value;
use tempfile::TempDir;

fn osag_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_osag"))
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let drop_dir = root.join("drop");
    fs::create_dir_all(&drop_dir).unwrap();
    fs::write(
        drop_dir.join("batch-1.json"),
        r#"[
            {"title": "Phishing wave targets banks", "author": "cert", "link": "https://example.org/phish",
             "content": "<p>Credential harvesting pages</p>"},
            {"title": "Patch Tuesday", "author": "vendor", "link": "https://example.org/patch"}
        ]"#,
    )
    .unwrap();
    fs::write(
        drop_dir.join("batch-2.json"),
        r#"{"title": "Phishing wave targets banks", "author": "cert", "link": "https://example.org/phish"}"#,
    )
    .unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/osag.sqlite"

[ingest]
page_size = 10

[[groups]]
id = "default"
name = "Default"
default = true
sources = ["drop"]

[[sources]]
id = "drop"
name = "Drop folder"
type = "json"
parameters = {{ path = "{root}/drop" }}

[[sources]]
id = "desk"
name = "Analyst desk"
type = "manual"
"#,
        root = root.display()
    );
    let config_path = root.join("osag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_osag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = osag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run osag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn run_json(config_path: &Path, args: &[&str]) -> Value {
    let (stdout, stderr, success) = run_osag(config_path, args);
    assert!(success, "osag {:?} failed: {}", args, stderr);
    serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("invalid JSON from {:?}: {}\n{}", args, e, stdout))
}

fn aggregate_ids(listing: &Value) -> Vec<i64> {
    listing["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|a| a["id"].as_i64().unwrap())
        .collect()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config) = setup_test_env();
    let first = run_json(&config, &["init"]);
    assert_eq!(first["sources"], 2);
    let second = run_json(&config, &["init"]);
    assert_eq!(second["groups"], 1);

    let sources = run_json(&config, &["sources"]);
    let ids: Vec<&str> = sources
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["desk", "drop"]);
}

#[test]
fn test_collect_dedups_and_lists() {
    let (_tmp, config) = setup_test_env();
    let reports = run_json(&config, &["collect", "drop"]);
    assert_eq!(reports[0]["fetched"], 3);
    assert_eq!(reports[0]["stored_new"], true);

    let listing = run_json(&config, &["list", "default", "--sort", "date-asc"]);
    assert_eq!(listing["total_count"], 2);

    let again = run_json(&config, &["collect", "all"]);
    let drop = again
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["source_id"] == "drop")
        .unwrap();
    assert_eq!(drop["stored_new"], false);

    let stats = run_json(&config, &["stats"]);
    assert_eq!(stats["news_item_data"], 2);
    assert_eq!(stats["aggregates"], 2);

    let search = run_json(&config, &["list", "default", "--search", "credential"]);
    assert_eq!(search["total_count"], 1);
}

#[test]
fn test_vote_group_and_report_guard() {
    let (_tmp, config) = setup_test_env();
    run_json(&config, &["collect", "drop"]);
    let listing = run_json(&config, &["list", "default", "--sort", "date-asc"]);
    let ids = aggregate_ids(&listing);
    assert_eq!(ids.len(), 2);

    let (_, stderr, success) = run_osag(&config, &["vote", "1", "like"]);
    assert!(!success);
    assert!(stderr.contains("--user"));

    let item_id = listing["items"][0]["news_items"][0]["id"].as_i64().unwrap();
    let voted = run_json(&config, &["--user", "4", "vote", &item_id.to_string(), "like"]);
    assert_eq!(voted["status"], "success");

    let targets: Vec<String> = ids.iter().map(|id| format!("a:{}", id)).collect();
    let mut args = vec!["action", "GROUP"];
    args.extend(targets.iter().map(String::as_str));
    let grouped = run_json(&config, &args);
    assert_eq!(grouped["status"], "success");

    let listing = run_json(&config, &["list", "default"]);
    assert_eq!(listing["total_count"], 1);
    let aggregate = &listing["items"][0];
    assert_eq!(aggregate["news_items"].as_array().unwrap().len(), 2);
    assert_eq!(aggregate["likes"], 1);
    let aggregate_id = aggregate["id"].as_i64().unwrap().to_string();

    let shown = run_json(&config, &["--user", "4", "show", &aggregate_id]);
    assert_eq!(shown["me_like"], true);

    run_json(&config, &["report", "assign", "77", &aggregate_id]);
    let blocked = run_json(&config, &["action", "DELETE", &format!("a:{}", aggregate_id)]);
    assert_eq!(blocked["status"], "aggregate_in_use");

    run_json(&config, &["report", "remove", "77", &aggregate_id]);
    let deleted = run_json(&config, &["action", "DELETE", &format!("a:{}", aggregate_id)]);
    assert_eq!(deleted["status"], "success");
    assert_eq!(run_json(&config, &["list", "default"])["total_count"], 0);
}

#[test]
fn test_manual_ingest_and_edit() {
    let (tmp, config) = setup_test_env();
    let file = tmp.path().join("note.json");
    fs::write(
        &file,
        r#"{"title": "Field note", "review": "<i>seen twice</i>", "content": "observed"}"#,
    )
    .unwrap();

    let ingested = run_json(
        &config,
        &["ingest", file.to_str().unwrap(), "--source", "desk", "--manual"],
    );
    assert_eq!(ingested["osint_source_ids"][0], "desk");

    let listing = run_json(&config, &["list", "default"]);
    let aggregate_id = listing["items"][0]["id"].as_i64().unwrap().to_string();
    assert_eq!(listing["items"][0]["description"], "seen twice");

    run_json(
        &config,
        &["edit", &aggregate_id, "--title", "Renamed", "--comments", "follow up"],
    );
    run_json(&config, &["mark", &aggregate_id, "--aggregate", "--important"]);
    let shown = run_json(&config, &["show", &aggregate_id]);
    assert_eq!(shown["title"], "Renamed");
    assert_eq!(shown["comments"], "follow up");
    assert_eq!(shown["important"], true);

    let important = run_json(&config, &["list", "default", "--important"]);
    assert_eq!(important["total_count"], 1);

    let (_, _, success) = run_osag(
        &config,
        &["ingest", file.to_str().unwrap(), "--source", "nobody"],
    );
    assert!(!success);
}

#[test]
fn test_remote_export_and_import() {
    let (tmp, config) = setup_test_env();
    run_json(&config, &["collect", "drop"]);

    let exported = run_json(
        &config,
        &["remote", "export", "--since", "2000-01-01T00:00:00Z", "--source", "drop"],
    );
    let records = exported["records"].as_array().unwrap();
    assert_eq!(records.len(), 2);

    let mut incoming = records[0].clone();
    incoming["data"]["id"] = Value::from("peer-1");
    incoming["data"]["hash"] = Value::from("peer-hash-1");
    incoming["relevance"] = Value::from(1);
    let file = tmp.path().join("peer.json");
    fs::write(&file, serde_json::to_string(&vec![incoming]).unwrap()).unwrap();

    let imported = run_json(
        &config,
        &[
            "remote",
            "import",
            file.to_str().unwrap(),
            "--node-id",
            "9",
            "--node-name",
            "partner",
            "--group",
            "default",
        ],
    );
    assert_eq!(imported["created"], 1);
    assert_eq!(run_json(&config, &["stats"])["news_item_data"], 3);
}

#[test]
fn test_invalid_target_is_rejected() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, success) = run_osag(&config, &["action", "GROUP", "x:1"]);
    assert!(!success);
    assert!(stderr.contains("invalid target"));
}
