#![allow(dead_code, clippy::missing_panics_doc)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};

use serde_json::Value;
use tempfile::TempDir;

pub const TEST_KEY: &str = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";

pub const ROOT_POLICY: &str = "\
# Security
- [no-secrets] Never commit secrets or credentials (critical) @security #security
- [no-force-push] Never force push to shared branches (high) @git

# Testing
- [run-tests] Always run the test suite before finishing a task (medium) #test
- Prefer small focused commits
";

pub const STATE_DIR: &str = ".claude-flow/guidance";

// Variables the binary reads; cleared so the caller's shell cannot leak in.
const GUIDANCE_VARS: &[&str] = &[
    "GUIDANCE_EVENT_WIRING_ENABLED",
    "GUIDANCE_EVENT_SYNC_TIMEOUT_MS",
    "GUIDANCE_EVENT_FAIL_CLOSED",
    "GUIDANCE_PROOF_KEY",
    "GUIDANCE_ENVIRONMENT",
    "GUIDANCE_HOME",
    "GUIDANCE_PROJECT_DIR",
    "GUIDANCE_ROOT_POLICY",
    "GUIDANCE_LOCAL_POLICY",
    "GUIDANCE_GATE_MAX_DIFF_LINES",
    "GUIDANCE_ALLOWED_TOOLS",
    "GUIDANCE_AUTOPILOT_ENABLED",
    "GUIDANCE_AUTOPILOT_MIN_DELTA",
    "GUIDANCE_AUTOPILOT_AB",
    "GUIDANCE_AUTOPILOT_MIN_AB_GAIN",
    "GUIDANCE_AUTOPILOT_MAX_PROMOTIONS",
    "GUIDANCE_AUTOPILOT_INTERVAL_MS",
    "GUIDANCE_LOG",
    "GUIDANCE_LOG_FORMAT",
];

pub fn guidance_binary_path() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_guidance"))
}

pub fn project(root_policy: Option<&str>) -> TempDir {
    let dir = match tempfile::tempdir() {
        Ok(dir) => dir,
        Err(err) => panic!("failed to create temp project: {err}"),
    };
    if let Some(text) = root_policy {
        write(&dir.path().join("CLAUDE.md"), text);
    }
    dir
}

pub fn write(path: &Path, text: &str) {
    if let Some(parent) = path.parent() {
        if let Err(err) = fs::create_dir_all(parent) {
            panic!("failed to create {}: {err}", parent.display());
        }
    }
    if let Err(err) = fs::write(path, text) {
        panic!("failed to write {}: {err}", path.display());
    }
}

pub fn read(path: &Path) -> String {
    match fs::read_to_string(path) {
        Ok(text) => text,
        Err(err) => panic!("failed to read {}: {err}", path.display()),
    }
}

pub fn read_json(path: &Path) -> Value {
    match serde_json::from_str(&read(path)) {
        Ok(value) => value,
        Err(err) => panic!("failed to parse {}: {err}", path.display()),
    }
}

pub fn state_file(project: &Path, name: &str) -> PathBuf {
    project.join(STATE_DIR).join(name)
}

/// `guidance` in `project` with a clean guidance environment plus `env`.
fn command(project: &Path, args: &[&str], env: &[(&str, &str)]) -> Command {
    let mut command = Command::new(guidance_binary_path());
    command.current_dir(project).args(args);
    for name in GUIDANCE_VARS {
        command.env_remove(name);
    }
    command
        .env("GUIDANCE_PROJECT_DIR", project)
        .env("GUIDANCE_PROOF_KEY", TEST_KEY);
    for (name, value) in env {
        command.env(name, value);
    }
    command
}

/// Start `guidance` without waiting; stdout and stderr are piped.
pub fn spawn(project: &Path, args: &[&str], env: &[(&str, &str)]) -> Child {
    let mut command = command(project, args, env);
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    match command.spawn() {
        Ok(child) => child,
        Err(err) => panic!("failed to start guidance {:?}: {err}", args),
    }
}

/// Run `guidance` in `project` with a clean guidance environment plus `env`.
pub fn run(project: &Path, args: &[&str], stdin: Option<&str>, env: &[(&str, &str)]) -> Output {
    let mut command = command(project, args, env);
    command
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => panic!("failed to run guidance {:?}: {err}", args),
    };
    if let (Some(text), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(err) = pipe.write_all(text.as_bytes()) {
            panic!("failed to write stdin: {err}");
        }
    }
    match child.wait_with_output() {
        Ok(output) => output,
        Err(err) => panic!("failed to wait for guidance {:?}: {err}", args),
    }
}

pub fn stdout_json(output: &Output) -> Value {
    match serde_json::from_slice::<Value>(&output.stdout) {
        Ok(value) => value,
        Err(err) => panic!(
            "failed to parse stdout as JSON: {err}\nstdout={}\nstderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        ),
    }
}

pub fn exit_code(output: &Output) -> i32 {
    match output.status.code() {
        Some(code) => code,
        None => panic!("guidance terminated by a signal: {:?}", output.status),
    }
}
