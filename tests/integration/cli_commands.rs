#![allow(missing_docs)]

#[path = "../common/mod.rs"]
mod common;

use std::fs;
use std::path::PathBuf;

use assert_cmd::cargo::cargo_bin_cmd;
use common::ex;
use serde_json::Value;
use sombra_algebra::query::{
    algebra::{TermPattern, TriplePattern},
    dataset::InMemoryDataset,
    expr::Expr,
    term::Term,
    Op,
};
use tempfile::TempDir;

struct Fixture {
    dir: TempDir,
    algebra: PathBuf,
    data: PathBuf,
}

fn setup() -> Fixture {
    let dir = TempDir::new().expect("tempdir");
    let op = Op::filter(
        vec![Expr::gt(Expr::var("n"), Expr::int(18))],
        Op::join(
            Op::bgp(vec![TriplePattern::new(
                TermPattern::var("a"),
                ex("knows"),
                TermPattern::var("b"),
            )]),
            Op::bgp(vec![TriplePattern::new(
                TermPattern::var("b"),
                ex("age"),
                TermPattern::var("n"),
            )]),
        ),
    );
    let data = InMemoryDataset::new()
        .with_triple(ex("alice"), ex("knows"), ex("bob"))
        .with_triple(ex("bob"), ex("knows"), ex("carol"))
        .with_triple(ex("bob"), ex("age"), Term::int(12))
        .with_triple(ex("carol"), ex("age"), Term::int(40));

    let algebra = dir.path().join("query.json");
    fs::write(&algebra, serde_json::to_string_pretty(&op).expect("encode op")).expect("write op");
    let data_path = dir.path().join("data.json");
    fs::write(&data_path, serde_json::to_string(&data).expect("encode data")).expect("write data");
    Fixture {
        dir,
        algebra,
        data: data_path,
    }
}

fn empty_config(fixture: &Fixture) -> PathBuf {
    let path = fixture.dir.path().join("algebra.toml");
    fs::write(&path, "").expect("write config");
    path
}

#[test]
fn run_emits_json_rows() {
    let fixture = setup();
    let config = empty_config(&fixture);
    let output = cargo_bin_cmd!("sombra-algebra")
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("run")
        .arg(&fixture.algebra)
        .arg("--data")
        .arg(&fixture.data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["count"], 1);
    let rows = json["rows"].as_array().expect("rows array");
    assert_eq!(rows.len(), 1);
    assert!(rows[0]["a"].is_object());
}

#[test]
fn run_materialized_matches_text_output() {
    let fixture = setup();
    let config = empty_config(&fixture);
    let streamed = cargo_bin_cmd!("sombra-algebra")
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&fixture.algebra)
        .arg("--data")
        .arg(&fixture.data)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let materialized = cargo_bin_cmd!("sombra-algebra")
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&fixture.algebra)
        .arg("--data")
        .arg(&fixture.data)
        .arg("--materialize")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(streamed.clone()).expect("utf8");
    assert!(text.contains("(1 rows)"), "{text}");
    assert_eq!(streamed, materialized);
}

#[test]
fn explain_reports_strategy() {
    let fixture = setup();
    let config = fixture.dir.path().join("materialize.toml");
    fs::write(&config, "streamed_joins = false\n").expect("write config");
    let output = cargo_bin_cmd!("sombra-algebra")
        .args(["--format", "json", "--config"])
        .arg(&config)
        .arg("explain")
        .arg(&fixture.algebra)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let json: Value = serde_json::from_slice(&output).expect("valid json");
    assert_eq!(json["root"]["op"], "filter");
    let join = &json["root"]["inputs"][0];
    assert_eq!(join["op"], "join");
    assert!(join["props"]
        .as_array()
        .expect("props")
        .iter()
        .any(|p| p["key"] == "strategy" && p["value"] == "materialized"));
    assert!(json["plan_hash"].is_u64());
}

#[test]
fn config_prints_effective_settings() {
    let fixture = setup();
    let config = fixture.dir.path().join("window.toml");
    fs::write(&config, "reduced_window = 16\n").expect("write config");
    let output = cargo_bin_cmd!("sombra-algebra")
        .arg("--config")
        .arg(&config)
        .arg("config")
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let text = String::from_utf8(output).expect("utf8");
    assert!(text.contains("reduced_window = 16"), "{text}");
    assert!(text.contains("streamed_joins = true"), "{text}");
}

#[test]
fn malformed_algebra_fails() {
    let fixture = setup();
    let config = empty_config(&fixture);
    let bad = fixture.dir.path().join("bad.json");
    fs::write(&bad, "{\"nonsense\": 1}").expect("write bad");
    cargo_bin_cmd!("sombra-algebra")
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&bad)
        .assert()
        .failure();
}
