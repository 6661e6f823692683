//! Host bridges: translate host hook vocabularies into [`EventKind`]s, normalise
//! payloads and shape the reply the host expects. No policy logic lives here.

use guidance_domain::{EditOperation, EventKind, EventPayload, GuidanceError, ToolInput};
use serde_json::{json, Map, Value};

use crate::DispatchReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    Claude,
    Codex,
    Native,
}

impl Host {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::Codex => "codex",
            Self::Native => "native",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "claude" => Some(Self::Claude),
            "codex" => Some(Self::Codex),
            "native" | "guidance" => Some(Self::Native),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Fixed(EventKind),
    PreTool,
    PostTool,
}

const CLAUDE_ROUTES: &[(&str, Route)] = &[
    ("PreToolUse", Route::PreTool),
    ("PostToolUse", Route::PostTool),
    ("UserPromptSubmit", Route::Fixed(EventKind::PreTask)),
    ("SubagentStop", Route::Fixed(EventKind::PostTask)),
    ("SessionStart", Route::Fixed(EventKind::SessionStart)),
    ("SessionEnd", Route::Fixed(EventKind::SessionEnd)),
    ("Stop", Route::Fixed(EventKind::SessionEnd)),
];

const CODEX_ROUTES: &[(&str, Route)] = &[
    ("session_configured", Route::Fixed(EventKind::SessionStart)),
    ("task_started", Route::Fixed(EventKind::PreTask)),
    ("exec_command_begin", Route::Fixed(EventKind::PreCommand)),
    ("patch_apply_begin", Route::Fixed(EventKind::PreEdit)),
    ("patch_apply_end", Route::Fixed(EventKind::PostEdit)),
    ("mcp_tool_call_begin", Route::Fixed(EventKind::PreToolUse)),
    ("task_complete", Route::Fixed(EventKind::PostTask)),
    ("shutdown_complete", Route::Fixed(EventKind::SessionEnd)),
];

const EDIT_TOOLS: &[&str] = &["Edit", "Write", "MultiEdit", "NotebookEdit"];

const COMMAND_KEYS: &[&str] = &["command", "cmd"];
const FILE_KEYS: &[&str] = &["file_path", "filePath", "path", "notebook_path"];
const CONTENT_KEYS: &[&str] = &["content", "new_string", "newString", "new_source"];
const DESCRIPTION_KEYS: &[&str] = &[
    "description",
    "taskDescription",
    "task_description",
    "prompt",
    "message",
];
const DIFF_KEYS: &[&str] = &["diff_lines", "diffLines"];
const TOOL_KEYS: &[&str] = &["tool_name", "toolName", "tool"];
const TASK_KEYS: &[&str] = &[
    "task_id",
    "taskId",
    "tool_use_id",
    "turn_id",
    "submission_id",
];
const SESSION_KEYS: &[&str] = &["session_id", "sessionId", "conversation_id"];
const AGENT_KEYS: &[&str] = &["agent_id", "agentId"];

/// A host event mapped onto the internal taxonomy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgedEvent {
    pub host: Host,
    pub host_event: String,
    pub kind: EventKind,
    pub payload: EventPayload,
}

/// Host event names [`translate`] accepts for `host`. Native callers use
/// [`EventKind`] names directly, so the list is empty for [`Host::Native`].
#[must_use]
pub fn host_events(host: Host) -> Vec<&'static str> {
    let table = match host {
        Host::Claude => CLAUDE_ROUTES,
        Host::Codex => CODEX_ROUTES,
        Host::Native => return Vec::new(),
    };
    table.iter().map(|(name, _)| *name).collect()
}

/// Translate one host event. `Ok(None)` means the host event carries nothing
/// the runtime guards (for example a post-hook for a read-only tool).
///
/// # Errors
/// Returns [`GuidanceError::Validation`] for an event name the host table does
/// not know.
pub fn translate(
    host: Host,
    host_event: &str,
    raw: &Value,
) -> Result<Option<BridgedEvent>, GuidanceError> {
    let payload = normalize_payload(raw);
    let kind = match host {
        Host::Native => Some(EventKind::parse(host_event).ok_or_else(|| {
            GuidanceError::Validation(format!("unknown event '{host_event}'"))
        })?),
        Host::Claude => resolve(CLAUDE_ROUTES, host, host_event, &payload)?,
        Host::Codex => resolve(CODEX_ROUTES, host, host_event, &payload)?,
    };
    Ok(kind.map(|kind| BridgedEvent {
        host,
        host_event: host_event.to_string(),
        kind,
        payload,
    }))
}

fn resolve(
    table: &[(&str, Route)],
    host: Host,
    host_event: &str,
    payload: &EventPayload,
) -> Result<Option<EventKind>, GuidanceError> {
    let route = table
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(host_event))
        .map(|(_, route)| *route)
        .ok_or_else(|| {
            GuidanceError::Validation(format!(
                "unknown {} event '{host_event}'",
                host.as_str()
            ))
        })?;
    let tool = payload.tool_input.tool_name.as_deref().unwrap_or_default();
    let is_edit = EDIT_TOOLS.iter().any(|name| name.eq_ignore_ascii_case(tool));
    let is_task = tool.eq_ignore_ascii_case("task");
    Ok(match route {
        Route::Fixed(kind) => Some(kind),
        Route::PreTool if tool.eq_ignore_ascii_case("bash") => Some(EventKind::PreCommand),
        Route::PreTool if is_edit => Some(EventKind::PreEdit),
        Route::PreTool if is_task => Some(EventKind::PreTask),
        Route::PreTool => Some(EventKind::PreToolUse),
        Route::PostTool if is_edit => Some(EventKind::PostEdit),
        Route::PostTool if is_task => Some(EventKind::PostTask),
        Route::PostTool => None,
    })
}

/// Normalise any host payload into the stdin contract: alias field names,
/// join argv-style commands, coerce numbers and derive `diff_lines` when absent.
#[must_use]
pub fn normalize_payload(raw: &Value) -> EventPayload {
    let input = ["tool_input", "toolInput"]
        .iter()
        .find_map(|key| raw.get(*key).filter(|value| value.is_object()))
        .unwrap_or(raw);
    let scopes = [input, raw];

    let mut tool_input = ToolInput {
        command: find(&scopes, COMMAND_KEYS).and_then(command_text),
        file_path: find_string(&scopes, FILE_KEYS),
        content: find_string(&scopes, CONTENT_KEYS).or_else(|| multi_edit_content(input)),
        operation: find_string(&scopes, &["operation"]).and_then(|value| parse_operation(&value)),
        diff_lines: find(&scopes, DIFF_KEYS).and_then(coerce_u64),
        description: find_string(&scopes, DESCRIPTION_KEYS),
        status: find_string(&scopes, &["status"]),
        tool_name: find_string(&[raw, input], TOOL_KEYS),
    };
    if let Some(changes) = find(&scopes, &["changes"]).and_then(Value::as_object) {
        absorb_patch_changes(&mut tool_input, changes);
    }
    if tool_input.diff_lines.is_none() {
        tool_input.diff_lines = derived_diff_lines(input, tool_input.content.as_deref());
    }

    EventPayload {
        tool_input,
        task_id: find(&scopes, TASK_KEYS).and_then(scalar_text),
        session_id: find_string(&scopes, SESSION_KEYS),
        agent_id: find_string(&scopes, AGENT_KEYS),
    }
}

fn find<'a>(scopes: &[&'a Value], keys: &[&str]) -> Option<&'a Value> {
    scopes.iter().find_map(|scope| {
        keys.iter()
            .find_map(|key| scope.get(*key).filter(|value| !value.is_null()))
    })
}

fn find_string(scopes: &[&Value], keys: &[&str]) -> Option<String> {
    find(scopes, keys).and_then(scalar_text)
}

fn scalar_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.trim().to_string(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

// `["bash", "-lc", "git status"]` is the shell wrapper hosts use for one command.
fn command_text(value: &Value) -> Option<String> {
    match value {
        Value::Array(parts) => {
            let parts: Vec<String> = parts.iter().filter_map(scalar_text).collect();
            match parts.as_slice() {
                [shell, flag, script] if is_shell(shell) && (flag == "-c" || flag == "-lc") => {
                    Some(script.clone())
                }
                [] => None,
                _ => Some(parts.join(" ")),
            }
        }
        other => scalar_text(other),
    }
}

fn is_shell(program: &str) -> bool {
    let name = program.rsplit('/').next().unwrap_or(program);
    matches!(name, "bash" | "sh" | "zsh")
}

fn coerce_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(number) => number.as_u64().or_else(|| {
            number
                .as_f64()
                .filter(|float| float.is_finite() && *float >= 0.0)
                .map(|float| float.round() as u64)
        }),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

fn parse_operation(value: &str) -> Option<EditOperation> {
    match value.trim().to_ascii_lowercase().as_str() {
        "modify" | "update" | "edit" => Some(EditOperation::Modify),
        "create" | "add" | "write" => Some(EditOperation::Create),
        "delete" | "remove" => Some(EditOperation::Delete),
        _ => None,
    }
}

fn multi_edit_content(input: &Value) -> Option<String> {
    let edits = input.get("edits")?.as_array()?;
    let joined: Vec<&str> = edits
        .iter()
        .filter_map(|edit| edit.get("new_string").and_then(Value::as_str))
        .collect();
    (!joined.is_empty()).then(|| joined.join("\n"))
}

// Patch events carry `{ path: { add | update | delete: {...} } }`.
fn absorb_patch_changes(tool_input: &mut ToolInput, changes: &Map<String, Value>) {
    let Some((path, change)) = changes.iter().next() else {
        return;
    };
    if tool_input.file_path.is_none() {
        tool_input.file_path = Some(path.clone());
    }
    let mut texts = Vec::new();
    for change in changes.values() {
        for (operation, detail) in change.as_object().into_iter().flatten() {
            if tool_input.operation.is_none() {
                tool_input.operation = parse_operation(operation);
            }
            for key in ["content", "unified_diff"] {
                if let Some(text) = detail.get(key).and_then(Value::as_str) {
                    texts.push(text.to_string());
                }
            }
        }
    }
    if tool_input.operation.is_none() {
        tool_input.operation = change
            .as_str()
            .and_then(parse_operation);
    }
    if tool_input.content.is_none() && !texts.is_empty() {
        tool_input.content = Some(texts.join("\n"));
    }
}

fn derived_diff_lines(input: &Value, content: Option<&str>) -> Option<u64> {
    let old_lines = input
        .get("old_string")
        .and_then(Value::as_str)
        .map_or(0, |text| text.lines().count());
    let new_lines = content.map_or(0, |text| text.lines().count());
    let lines = old_lines.max(new_lines);
    (lines > 0).then(|| u64::try_from(lines).unwrap_or(u64::MAX))
}

/// Shape the dispatch report the way `host` expects on stdout.
#[must_use]
pub fn format_reply(host: Host, host_event: &str, report: &DispatchReport) -> Value {
    match host {
        Host::Native => report.summary(),
        Host::Claude => claude_reply(host_event, report),
        Host::Codex => codex_reply(report),
    }
}

/// Reply for a host event that [`translate`] mapped to nothing.
#[must_use]
pub fn ignored_reply(host: Host, host_event: &str) -> Value {
    match host {
        Host::Claude => json!({}),
        Host::Codex => json!({ "decision": "allow" }),
        Host::Native => json!({
            "event": host_event,
            "success": true,
            "blocked": false,
            "skipped": true,
            "messages": [],
            "warnings": [],
        }),
    }
}

/// Reply for a hook invocation that failed before dispatch (bad stdin, unknown
/// event name, unusable configuration). `blocked` follows the caller's fail mode.
#[must_use]
pub fn error_reply(host: Host, host_event: &str, err: &GuidanceError, blocked: bool) -> Value {
    let message = format!("{}: {err}", err.kind());
    match host {
        Host::Claude if blocked => json!({ "decision": "block", "reason": message }),
        Host::Claude => json!({ "systemMessage": message }),
        Host::Codex => json!({
            "decision": if blocked { "deny" } else { "warn" },
            "summary": { "event": host_event, "success": false, "blocked": blocked },
            "reason": message,
        }),
        Host::Native => json!({
            "event": host_event,
            "success": false,
            "blocked": blocked,
            "skipped": !blocked,
            "messages": [message],
            "warnings": [],
        }),
    }
}

fn reason_text(report: &DispatchReport) -> String {
    if report.result.messages.is_empty() {
        "blocked by guidance policy".to_string()
    } else {
        report.result.messages.join("; ")
    }
}

fn claude_reply(host_event: &str, report: &DispatchReport) -> Value {
    let mut reply = Map::new();
    let blocked = report.result.aborted;
    match host_event {
        "PreToolUse" if blocked => {
            reply.insert(
                "hookSpecificOutput".to_string(),
                json!({
                    "hookEventName": host_event,
                    "permissionDecision": "deny",
                    "permissionDecisionReason": reason_text(report),
                }),
            );
        }
        "UserPromptSubmit" | "SessionStart" => {
            if let Some(policy_text) = &report.policy_text {
                reply.insert(
                    "hookSpecificOutput".to_string(),
                    json!({
                        "hookEventName": host_event,
                        "additionalContext": policy_text,
                    }),
                );
            }
            if blocked {
                reply.insert("decision".to_string(), json!("block"));
                reply.insert("reason".to_string(), json!(reason_text(report)));
            }
        }
        _ if blocked => {
            reply.insert("decision".to_string(), json!("block"));
            reply.insert("reason".to_string(), json!(reason_text(report)));
        }
        _ => {}
    }
    if !report.result.warnings.is_empty() {
        reply.insert(
            "systemMessage".to_string(),
            json!(report.result.warnings.join("; ")),
        );
    }
    Value::Object(reply)
}

fn codex_reply(report: &DispatchReport) -> Value {
    let decision = if report.result.aborted {
        "deny"
    } else if report.result.warnings.is_empty() {
        "allow"
    } else {
        "warn"
    };
    let mut reply = json!({
        "decision": decision,
        "summary": report.summary(),
    });
    if report.result.aborted {
        reply["reason"] = json!(reason_text(report));
    }
    reply
}
