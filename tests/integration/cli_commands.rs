#![allow(missing_docs)]

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

fn write_csv(dir: &Path, name: &str, rows: usize) -> PathBuf {
    let path = dir.join(name);
    let mut body = String::from("key,value\n");
    // reverse order so the loader has to sort
    for i in (0..rows).rev() {
        body.push_str(&format!("k{i:05},v{i}\n"));
    }
    fs::write(&path, body).expect("write csv");
    path
}

fn json_stdout(args: &[&str], paths: &[&Path]) -> Value {
    let mut cmd = cargo_bin_cmd!("ft");
    cmd.args(["--format", "json"]).args(args);
    for path in paths {
        cmd.arg(path);
    }
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).expect("valid json")
}

#[test]
fn load_then_verify_and_dump() {
    let dir = TempDir::new().expect("tempdir");
    let csv = write_csv(dir.path(), "rows.csv", 300);
    let tree = dir.path().join("rows.ft");
    let temp = dir.path().display().to_string();

    let report = json_stdout(
        &[
            "load",
            "--has-header",
            "--temp-dir",
            &temp,
            "--node-size",
            "2048",
            "--basement-size",
            "512",
            "--fanout",
            "4",
        ],
        &[&csv, &tree],
    );
    assert_eq!(report["rows_put"], 300);
    assert_eq!(report["indexes"][0]["rows"], 300);
    assert!(report["indexes"][0]["height"].as_u64().unwrap() >= 1);

    let verify = json_stdout(&["verify", "--level", "full"], &[&tree]);
    assert!(verify["success"].as_bool().unwrap());
    assert_eq!(verify["counts"]["entries"], 300);

    let dump = json_stdout(&["dump", "--scan", "--limit", "3"], &[&tree]);
    assert_eq!(dump["header"]["node_size"], 2048);
    let rows = dump["rows"].as_array().unwrap();
    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0]["key"], "k00000");
    assert_eq!(rows[2]["value"], "v2");
    assert!(dump["nodes"].as_array().unwrap().len() > 1);

    let hex = json_stdout(&["dump", "--scan", "--limit", "1", "--hex"], &[&tree]);
    assert_eq!(hex["rows"][0]["key"], "6b3030303030");
}

#[test]
fn load_reads_options_from_toml() {
    let dir = TempDir::new().expect("tempdir");
    let csv = write_csv(dir.path(), "rows.csv", 50);
    let tree = dir.path().join("toml.ft");
    let config = dir.path().join("loader.toml");
    fs::write(
        &config,
        format!(
            "memory_budget = 65536\ntemp_dir = {:?}\n\n[tree]\nnode_size = 1024\nfanout = 3\n",
            dir.path().display().to_string()
        ),
    )
    .expect("write config");

    let report = json_stdout(
        &["load", "--has-header", "--config", config.to_str().unwrap()],
        &[&csv, &tree],
    );
    assert_eq!(report["rows_put"], 50);

    let dump = json_stdout(&["dump"], &[&tree]);
    assert_eq!(dump["header"]["node_size"], 1024);
    assert_eq!(dump["header"]["fanout"], 3);
}

#[test]
fn duplicate_rows_fail_without_output() {
    let dir = TempDir::new().expect("tempdir");
    let csv = dir.path().join("dup.csv");
    fs::write(&csv, "a,1\nb,2\na,3\n").expect("write csv");
    let tree = dir.path().join("dup.ft");

    cargo_bin_cmd!("ft")
        .arg("load")
        .arg("--temp-dir")
        .arg(dir.path())
        .arg(&csv)
        .arg(&tree)
        .assert()
        .code(1);
    assert!(!tree.exists());
    let leftovers = fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("tokuld"))
        .count();
    assert_eq!(leftovers, 0);
}

#[test]
fn malformed_record_aborts_the_load() {
    let dir = TempDir::new().expect("tempdir");
    let csv = dir.path().join("bad.csv");
    fs::write(&csv, "a,1\nb,2,extra\n").expect("write csv");
    let tree = dir.path().join("bad.ft");

    cargo_bin_cmd!("ft")
        .arg("--quiet")
        .arg("load")
        .arg(&csv)
        .arg(&tree)
        .assert()
        .failure();
    assert!(!tree.exists());
}

#[test]
fn verify_rejects_a_file_that_is_not_a_tree() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("garbage.ft");
    fs::write(&path, vec![0x5Au8; 8192]).expect("write garbage");

    let output = cargo_bin_cmd!("ft")
        .args(["--format", "json", "verify"])
        .arg(&path)
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["success"], false);
    assert!(!json["findings"].as_array().unwrap().is_empty());
}
