#![allow(clippy::single_match_else, clippy::uninlined_format_args)]

mod support;

use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use serde_json::{json, Value};
use support::{project, run, stdout_json, ROOT_POLICY};

fn repo_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .unwrap_or_else(|err| panic!("failed to canonicalize repo root: {err}"))
}

fn schema_dir() -> PathBuf {
    repo_root().join("contracts/hooks/v1/schemas")
}

fn fixture(name: &str) -> Value {
    read_json(&repo_root().join("contracts/hooks/v1/fixtures").join(name))
}

fn read_json(path: &Path) -> Value {
    let body = fs::read_to_string(path)
        .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()));
    serde_json::from_str(&body)
        .unwrap_or_else(|err| panic!("failed to parse {}: {err}", path.display()))
}

fn compile(schema_name: &str) -> JSONSchema {
    let path = schema_dir().join(schema_name);
    let schema = read_json(&path);
    JSONSchema::compile(&schema)
        .unwrap_or_else(|err| panic!("failed to compile {}: {err}", path.display()))
}

fn assert_schema(schema_name: &str, value: &Value) {
    let compiled = compile(schema_name);
    if let Some(errors) = compiled
        .validate(value)
        .err()
        .map(|iter| iter.map(|err| err.to_string()).collect::<Vec<_>>())
    {
        panic!(
            "schema validation failed for {}:\n{}\nvalue={}",
            schema_name,
            errors.join("\n"),
            value
        );
    }
}

#[test]
fn payload_fixtures_match_the_stdin_contract() {
    assert_schema("hook-payload.schema.json", &fixture("native-pre-edit.sample.json"));
    assert_schema("hook-payload.schema.json", &fixture("claude-pre-tool-use.sample.json"));

    let compiled = compile("hook-payload.schema.json");
    assert!(!compiled.is_valid(&json!({"tool_input": {"operation": "rename"}})));
    assert!(!compiled.is_valid(&json!({"tool_input": {"diff_lines": -3}})));
}

#[test]
fn dispatcher_replies_match_the_summary_contract() {
    let dir = project(Some(ROOT_POLICY));
    let allowed = stdout_json(&run(
        dir.path(),
        &["hook", "preEdit"],
        Some(&fixture("native-pre-edit.sample.json").to_string()),
        &[],
    ));
    assert_schema("dispatch-summary.schema.json", &allowed);

    let blocked = stdout_json(&run(
        dir.path(),
        &["runtime", "command", "git", "push", "--force", "origin", "main"],
        None,
        &[],
    ));
    assert_schema("dispatch-summary.schema.json", &blocked);
    assert_eq!(blocked["blocked"], true);

    let pre_task = stdout_json(&run(
        dir.path(),
        &["runtime", "task", "--task-id", "t1", "--description", "Implement auth"],
        None,
        &[],
    ));
    assert_schema("dispatch-summary.schema.json", &pre_task);

    let mut missing = allowed.clone();
    if let Some(object) = missing.as_object_mut() {
        object.remove("blocked");
    }
    assert!(!compile("dispatch-summary.schema.json").is_valid(&missing));
}

#[test]
fn persisted_proof_chain_matches_the_export_contract() {
    let dir = project(Some(ROOT_POLICY));
    for args in [
        vec!["runtime", "command", "git", "status"],
        vec!["runtime", "command", "git", "push", "--force", "origin", "main"],
        vec!["runtime", "task", "--task-id", "t1", "--phase", "post"],
    ] {
        let _ = run(dir.path(), &args, None, &[]);
    }
    let exported = stdout_json(&run(dir.path(), &["runtime", "export-proof"], None, &[]));
    assert_eq!(exported["envelopes"].as_array().map_or(0, Vec::len), 3);
    assert_eq!(exported["envelopes"][0]["prevContentHash"], "GENESIS");
    assert_schema("proof-export.schema.json", &exported);
}

#[test]
fn autopilot_report_matches_its_contract() {
    let dir = project(Some(ROOT_POLICY));
    let report = stdout_json(&run(dir.path(), &["autopilot", "--once"], None, &[]));
    assert_eq!(report["decision"], "no-promotable-local-rules");
    assert_schema("autopilot-report.schema.json", &report);

    let stored = read_json(
        &dir.path()
            .join(".claude-flow/guidance/autopilot-report.json"),
    );
    assert_schema("autopilot-report.schema.json", &stored);
}
