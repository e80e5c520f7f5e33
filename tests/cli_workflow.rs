// SPDX-License-Identifier: MIT OR Apache-2.0

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

const DEPLOY_TEXT: &str = "Rolling deploys drain each kubernetes node before upgrading it.";
const BILLING_TEXT: &str = "Invoices are generated nightly from the billing ledger export.";
const ONCALL_TEXT: &str = "The on-call rotation hands over every Monday at noon.";

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).expect("create parent");
    }
    fs::write(path, contents).expect("write file");
}

fn write_offline_config(root: &Path) {
    write_file(
        &root.join(".evidexrc.toml"),
        r#"
[embedding]
provider = "hash"
dimension = 16

[reduction]
enabled = false

[chunking]
min_chars = 10
"#,
    );
}

fn doc_line(id: &str, space: &str, kind: &str, title: &str, text: &str) -> String {
    serde_json::json!({
        "id": id,
        "space": space,
        "type": kind,
        "title": title,
        "text": text,
    })
    .to_string()
}

fn write_corpus(root: &Path) {
    let lines = [
        doc_line("DOC-1", "ENG", "page", "Deploy guide", DEPLOY_TEXT),
        doc_line("DOC-2", "FIN", "page", "Billing", BILLING_TEXT),
        doc_line("DOC-3", "ENG", "ticket", "On-call", ONCALL_TEXT),
    ];
    write_file(&root.join("docs/corpus.jsonl"), &(lines.join("\n") + "\n"));
}

fn setup() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    write_offline_config(dir.path());
    write_corpus(dir.path());
    dir
}

fn run_json(root: &Path, args: &[&str]) -> Value {
    let mut cmd = cargo_bin_cmd!("evidex");
    let assert = cmd
        .current_dir(root)
        .env_remove("EVIDEX_EMBED_DIM")
        .env_remove("EVIDEX_MODEL")
        .args(["--format", "json"])
        .args(args)
        .assert()
        .success();
    serde_json::from_slice(&assert.get_output().stdout).expect("json output")
}

fn hit_ids(outcome: &Value) -> Vec<String> {
    outcome["hits"]
        .as_array()
        .expect("hits array")
        .iter()
        .map(|hit| hit["id"].as_str().expect("id").to_string())
        .collect()
}

#[test]
fn ingest_reports_counts_and_creates_index() {
    let dir = setup();
    let report = run_json(dir.path(), &["ingest", "docs", "-q"]);

    assert_eq!(report["documents"], 3);
    assert_eq!(report["inserted"], 3);
    assert_eq!(report["skipped_invalid"], 0);
    assert!(dir.path().join(".evidex/vectors/vectors.bin").exists());
    assert!(dir.path().join(".evidex/vectors/meta.jsonl").exists());
    assert!(dir.path().join(".evidex/lexical/meta.json").exists());
}

#[test]
fn semantic_search_ranks_exact_text_first() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);

    let outcome = run_json(dir.path(), &["search", BILLING_TEXT, "--mode", "semantic"]);
    assert_eq!(outcome["mode"], "semantic");
    let ids = hit_ids(&outcome);
    assert_eq!(ids[0], "DOC-2");
    let top = outcome["hits"][0]["score"].as_f64().expect("score");
    assert!((top - 1.0).abs() < 1e-3, "score was {top}");
}

#[test]
fn keyword_search_matches_terms() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);

    let outcome = run_json(dir.path(), &["search", "kubernetes", "--mode", "keyword"]);
    assert_eq!(hit_ids(&outcome), vec!["DOC-1"]);
}

#[test]
fn hybrid_search_respects_space_filter() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);

    let outcome = run_json(dir.path(), &["search", "rotation", "--space", "ENG", "-k", "5"]);
    assert_eq!(outcome["mode"], "hybrid");
    assert_eq!(outcome["fallback"], false);
    let ids = hit_ids(&outcome);
    assert!(ids.contains(&"DOC-3".to_string()));
    assert!(!ids.contains(&"DOC-2".to_string()));
}

#[test]
fn reingest_replaces_earlier_chunks() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);
    let report = run_json(dir.path(), &["ingest", "docs", "-q"]);
    assert_eq!(report["replaced"], 3);

    let stats = run_json(dir.path(), &["stats"]);
    assert_eq!(stats["store"]["rows"], 3);
    assert_eq!(stats["store"]["dim"], 16);
    assert_eq!(stats["store"]["spaces"]["ENG"], 2);
    assert_eq!(stats["lexical_documents"], 3);
}

#[test]
fn append_keeps_earlier_chunks() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);
    run_json(dir.path(), &["ingest", "docs", "-q", "--append"]);

    let stats = run_json(dir.path(), &["stats"]);
    assert_eq!(stats["store"]["rows"], 6);
}

#[test]
fn search_uses_dimension_of_existing_index() {
    let dir = setup();
    let mut cmd = cargo_bin_cmd!("evidex");
    cmd.current_dir(dir.path())
        .env("EVIDEX_EMBED_DIM", "32")
        .args(["ingest", "docs", "-q"])
        .assert()
        .success();

    let outcome = run_json(dir.path(), &["search", DEPLOY_TEXT, "--mode", "semantic"]);
    assert_eq!(hit_ids(&outcome)[0], "DOC-1");
    let top = outcome["hits"][0]["score"].as_f64().expect("score");
    assert!((top - 1.0).abs() < 1e-3, "score was {top}");

    let stats = run_json(dir.path(), &["stats"]);
    assert_eq!(stats["store"]["dim"], 32);
}

#[test]
fn malformed_lines_are_skipped() {
    let dir = TempDir::new().expect("tempdir");
    write_offline_config(dir.path());
    let content = format!(
        "{}\nnot json at all\n\n{}\n",
        doc_line("A", "ENG", "page", "A", DEPLOY_TEXT),
        doc_line("B", "ENG", "page", "B", "tiny"),
    );
    write_file(&dir.path().join("input.jsonl"), &content);

    let report = run_json(dir.path(), &["ingest", "input.jsonl", "-q"]);
    assert_eq!(report["skipped_invalid"], 1);
    assert_eq!(report["skipped_short"], 1);
    assert_eq!(report["inserted"], 1);
}

#[test]
fn search_without_index_fails() {
    let dir = TempDir::new().expect("tempdir");
    write_offline_config(dir.path());

    let mut cmd = cargo_bin_cmd!("evidex");
    cmd.current_dir(dir.path())
        .args(["search", "anything"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("No index found"));
}

#[test]
fn embed_prints_normalized_vector() {
    let dir = TempDir::new().expect("tempdir");
    write_offline_config(dir.path());

    let output = run_json(dir.path(), &["embed", "hello world"]);
    assert_eq!(output["model"], "offline-hash");
    assert_eq!(output["dimension"], 16);
    let norm: f64 = output["embedding"]
        .as_array()
        .expect("embedding")
        .iter()
        .map(|v| v.as_f64().expect("float").powi(2))
        .sum::<f64>()
        .sqrt();
    assert!((norm - 1.0).abs() < 1e-3);
}

#[test]
fn text_search_output_lists_titles() {
    let dir = setup();
    run_json(dir.path(), &["ingest", "docs", "-q"]);

    let mut cmd = cargo_bin_cmd!("evidex");
    cmd.current_dir(dir.path())
        .env("NO_COLOR", "1")
        .args(["search", "kubernetes", "--mode", "keyword"])
        .assert()
        .success()
        .stdout(predicate::str::contains("DOC-1"))
        .stdout(predicate::str::contains("Deploy guide"))
        .stdout(predicate::str::contains("ENG/page"));
}

#[test]
fn completions_generate_for_bash() {
    let mut cmd = cargo_bin_cmd!("evidex");
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("evidex"));
}
