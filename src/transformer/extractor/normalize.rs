//! Per-tool argument normalization.
//!
//! Runs on every accepted invocation before it becomes a tool_use block.

use super::super::json_repair::repair_json;
use super::super::unified::ToolRegistry;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::{Map, Value};
use std::borrow::Cow;

pub const TODO_WRITE: &str = "TodoWrite";

const PATH_KEYS: &[&str] = &[
    "file_path",
    "path",
    "file",
    "directory",
    "dir",
    "cwd",
    "root",
    "location",
];

const CANONICAL_STATUSES: &[&str] = &["pending", "in_progress", "completed"];

/// Control characters a Windows separator plus letter turns into when the
/// backslash is read as a JSON escape.
const MISREAD_ESCAPES: &[(char, &str)] = &[
    ('\t', "\\t"),
    ('\n', "\\n"),
    ('\r', "\\r"),
    ('\u{8}', "\\b"),
    ('\u{c}', "\\f"),
];

lazy_static! {
    static ref WINDOWS_DRIVE: Regex =
        Regex::new(r"^[A-Za-z]:[\\/\t\n\r\x08\x0c]").unwrap();
}

/// Normalize the arguments of one accepted invocation.
///
/// Returns `None` when the invocation cannot be salvaged (TodoWrite with an
/// unrepairable `todos` payload).
pub fn normalize_arguments(
    tool: &str,
    mut args: Map<String, Value>,
    registry: &ToolRegistry,
) -> Option<Map<String, Value>> {
    if tool.eq_ignore_ascii_case(TODO_WRITE) {
        if let Some(todos) = args.get("todos") {
            let normalized = normalize_todos(todos)?;
            args.insert("todos".to_string(), normalized);
        }
    }

    repair_path_escapes(&mut args);

    if let Some(Value::String(command)) = args.get_mut("command") {
        let mut repaired = repair_command_paths(command).into_owned();
        if registry.is_shell_tool(tool) {
            repaired = double_shell_backslashes(&repaired).into_owned();
        }
        *command = repaired;
    }

    Some(args)
}

// ============================================================================
// TodoWrite
// ============================================================================

/// Normalize a TodoWrite `todos` payload into a list of complete items.
///
/// Accepts an array, a single object, or a string holding (possibly broken)
/// JSON. Items without content are dropped.
pub fn normalize_todos(todos: &Value) -> Option<Value> {
    let items = match todos {
        Value::Array(items) => items.clone(),
        Value::Object(_) => vec![todos.clone()],
        Value::String(raw) => match repair_json(raw)? {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            _ => return None,
        },
        _ => return None,
    };

    let normalized: Vec<Value> = items
        .into_iter()
        .enumerate()
        .filter_map(|(index, item)| normalize_todo_item(index, item))
        .map(Value::Object)
        .collect();

    Some(Value::Array(normalized))
}

fn normalize_todo_item(index: usize, item: Value) -> Option<Map<String, Value>> {
    let fields = match item {
        Value::Object(fields) => fields,
        Value::String(content) => {
            let mut fields = Map::new();
            fields.insert("content".to_string(), Value::String(content));
            fields
        }
        _ => return None,
    };

    let mut content = None;
    let mut status = None;
    let mut active_form = None;
    let mut id = None;
    let mut extra = Map::new();

    for (key, value) in fields {
        match todo_field(&key) {
            Some(TodoField::Content) => {
                content.get_or_insert(value);
            }
            Some(TodoField::Status) => {
                status.get_or_insert(value);
            }
            Some(TodoField::ActiveForm) => {
                active_form.get_or_insert(value);
            }
            Some(TodoField::Id) => id = Some(value),
            None => {
                extra.insert(key, value);
            }
        }
    }

    let content = match content {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        _ => return None,
    };

    let status = match status {
        Some(Value::String(raw)) => fold_status(&raw),
        _ => "pending".to_string(),
    };

    let active_form = match active_form {
        Some(Value::String(text)) if !text.trim().is_empty() => text,
        _ => content.clone(),
    };

    let id = match id {
        Some(Value::String(id)) if id.chars().count() >= 3 => id,
        _ => format!("todo-{}", index + 1),
    };

    let mut out = Map::new();
    out.insert("content".to_string(), Value::String(content));
    out.insert("status".to_string(), Value::String(status));
    out.insert("activeForm".to_string(), Value::String(active_form));
    out.insert("id".to_string(), Value::String(id));
    out.extend(extra);
    Some(out)
}

enum TodoField {
    Content,
    Status,
    ActiveForm,
    Id,
}

fn todo_field(key: &str) -> Option<TodoField> {
    match key {
        "" | "content" | "task" | "title" | "text" => Some(TodoField::Content),
        "status" | "state" => Some(TodoField::Status),
        "activeForm" | "Form" | "active_form" | "activeform" | "ActiveForm" => {
            Some(TodoField::ActiveForm)
        }
        "id" => Some(TodoField::Id),
        _ => None,
    }
}

/// Fold status synonyms into the three canonical values.
fn fold_status(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    if CANONICAL_STATUSES.contains(&lowered.as_str()) {
        return lowered;
    }
    let folded = match lowered.as_str() {
        "" | "todo" | "to_do" | "to-do" | "not_started" | "not started" | "open" | "new" => {
            "pending"
        }
        "in-progress" | "in progress" | "inprogress" | "active" | "doing" | "started"
        | "running" => "in_progress",
        "done" | "complete" | "finished" | "closed" => "completed",
        _ => return raw.to_string(),
    };
    folded.to_string()
}

// ============================================================================
// Paths and Commands
// ============================================================================

/// Map misread JSON escapes in path-like arguments back to `\` + letter.
///
/// Applies to path-like keys at any depth and to any string shaped like a
/// Windows drive path.
pub fn repair_path_escapes(args: &mut Map<String, Value>) {
    for (key, value) in args.iter_mut() {
        repair_value(value, is_path_key(key));
    }
}

fn repair_value(value: &mut Value, path_context: bool) {
    match value {
        Value::String(text) => {
            if path_context || WINDOWS_DRIVE.is_match(text) {
                let restored = match restore_escapes(text) {
                    Cow::Owned(restored) => Some(restored),
                    Cow::Borrowed(_) => None,
                };
                if let Some(restored) = restored {
                    *text = restored;
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                repair_value(item, path_context);
            }
        }
        Value::Object(fields) => {
            for (key, nested) in fields.iter_mut() {
                repair_value(nested, is_path_key(key));
            }
        }
        _ => {}
    }
}

fn is_path_key(key: &str) -> bool {
    PATH_KEYS.iter().any(|known| known.eq_ignore_ascii_case(key))
}

fn misread_escape(ch: char) -> Option<&'static str> {
    MISREAD_ESCAPES
        .iter()
        .find(|(control, _)| *control == ch)
        .map(|(_, literal)| *literal)
}

fn restore_escapes(text: &str) -> Cow<'_, str> {
    if !text.chars().any(|ch| misread_escape(ch).is_some()) {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 4);
    for ch in text.chars() {
        match misread_escape(ch) {
            Some(literal) => out.push_str(literal),
            None => out.push(ch),
        }
    }
    Cow::Owned(out)
}

/// Repair Windows paths embedded in a command line.
///
/// Inside a drive-rooted token a control character followed by a word
/// character is a misread escape; elsewhere control characters are real.
pub fn repair_command_paths(command: &str) -> Cow<'_, str> {
    let chars: Vec<char> = command.chars().collect();
    let mut out = String::with_capacity(command.len() + 4);
    let mut changed = false;
    let mut i = 0;

    while i < chars.len() {
        if !starts_drive_path(&chars, i) {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        out.push(chars[i]);
        out.push(':');
        i += 2;
        while i < chars.len() && !ends_path_token(chars[i]) {
            match misread_escape(chars[i]) {
                Some(literal) => {
                    let continues = chars
                        .get(i + 1)
                        .map(|next| next.is_alphanumeric() || *next == '_')
                        .unwrap_or(false);
                    if !continues {
                        break;
                    }
                    out.push_str(literal);
                    changed = true;
                }
                None => out.push(chars[i]),
            }
            i += 1;
        }
    }

    if changed {
        Cow::Owned(out)
    } else {
        Cow::Borrowed(command)
    }
}

fn starts_drive_path(chars: &[char], i: usize) -> bool {
    let boundary = i == 0 || !chars[i - 1].is_alphanumeric();
    boundary
        && chars[i].is_ascii_alphabetic()
        && chars.get(i + 1) == Some(&':')
        && chars
            .get(i + 2)
            .map(|sep| *sep == '\\' || *sep == '/' || misread_escape(*sep).is_some())
            .unwrap_or(false)
}

fn ends_path_token(ch: char) -> bool {
    matches!(ch, ' ' | '"' | '\'' | '|' | '&' | ';' | '<' | '>' | '`')
}

/// Double every backslash in a shell command so it survives a re-parse.
///
/// Skipped when the command already contains a doubled backslash.
pub fn double_shell_backslashes(command: &str) -> Cow<'_, str> {
    if !command.contains('\\') || command.contains("\\\\") {
        return Cow::Borrowed(command);
    }
    Cow::Owned(command.replace('\\', "\\\\"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn args(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_todo_state_renamed_and_defaults_filled() {
        let todos = normalize_todos(&json!([{"content": "a", "state": "pending"}])).unwrap();
        assert_eq!(
            todos,
            json!([{"content": "a", "status": "pending", "activeForm": "a", "id": "todo-1"}])
        );
    }

    #[test]
    fn test_todo_form_and_empty_key() {
        let todos = normalize_todos(&json!([
            {"": "write docs", "status": "in-progress", "Form": "Writing docs", "id": "abc"}
        ]))
        .unwrap();
        assert_eq!(
            todos,
            json!([{
                "content": "write docs",
                "status": "in_progress",
                "activeForm": "Writing docs",
                "id": "abc"
            }])
        );
    }

    #[test]
    fn test_todo_from_broken_string() {
        let todos = normalize_todos(&json!(r#"[{": "a", "status": "done"}, {"content": "b""#))
            .unwrap();
        assert_eq!(todos[0]["content"], "a");
        assert_eq!(todos[0]["status"], "completed");
        assert_eq!(todos[1]["content"], "b");
        assert_eq!(todos[1]["status"], "pending");
        assert_eq!(todos[1]["id"], "todo-2");
    }

    #[test]
    fn test_todo_single_object_wrapped() {
        let todos = normalize_todos(&json!({"content": "a"})).unwrap();
        assert_eq!(todos.as_array().map(Vec::len), Some(1));
    }

    #[test]
    fn test_todo_items_without_content_dropped() {
        let todos = normalize_todos(&json!([{"status": "pending"}, {"content": "  "}, {"content": "x"}]))
            .unwrap();
        assert_eq!(todos.as_array().map(Vec::len), Some(1));
        assert_eq!(todos[0]["id"], "todo-3");
    }

    #[test]
    fn test_todo_short_or_numeric_id_replaced() {
        let todos = normalize_todos(&json!([{"content": "a", "id": 1}, {"content": "b", "id": "2"}]))
            .unwrap();
        assert_eq!(todos[0]["id"], "todo-1");
        assert_eq!(todos[1]["id"], "todo-2");
    }

    #[test]
    fn test_todo_unknown_status_passes_through() {
        let todos = normalize_todos(&json!([{"content": "a", "status": "blocked"}])).unwrap();
        assert_eq!(todos[0]["status"], "blocked");
    }

    #[test]
    fn test_todo_unrepairable() {
        assert_eq!(normalize_todos(&json!("no list here")), None);
        assert_eq!(normalize_todos(&json!(42)), None);
    }

    #[test]
    fn test_normalize_todo_write_unrepairable_drops_call() {
        let registry = ToolRegistry::new(["TodoWrite"]);
        assert!(normalize_arguments("TodoWrite", args(json!({"todos": "???"})), &registry).is_none());
    }

    #[test]
    fn test_path_escapes_restored() {
        let mut input = args(json!({
            "file_path": "C:\\Users\new\tfile.txt",
            "content": "line one\nline two",
        }));
        repair_path_escapes(&mut input);
        assert_eq!(input["file_path"], "C:\\Users\\new\\tfile.txt");
        assert_eq!(input["content"], "line one\nline two");
    }

    #[test]
    fn test_path_key_case_insensitive_and_nested() {
        let mut input = args(json!({"edits": [{"Path": "src\tmain.rs"}]}));
        repair_path_escapes(&mut input);
        assert_eq!(input["edits"][0]["Path"], "src\\tmain.rs");
    }

    #[test]
    fn test_windows_shaped_value_under_other_key() {
        let mut input = args(json!({"target": "D:\\data\rules.txt"}));
        repair_path_escapes(&mut input);
        assert_eq!(input["target"], "D:\\data\\rules.txt");
    }

    #[test]
    fn test_command_paths_repaired() {
        assert_eq!(
            repair_command_paths("type C:\\Users\\me\new.txt && echo ok"),
            "type C:\\Users\\me\\new.txt && echo ok"
        );
        assert_eq!(
            repair_command_paths("echo a\nb"),
            Cow::<str>::Borrowed("echo a\nb")
        );
    }

    #[test]
    fn test_command_real_newline_after_path_kept() {
        assert_eq!(
            repair_command_paths("dir C:\\temp\n"),
            Cow::<str>::Borrowed("dir C:\\temp\n")
        );
    }

    #[test]
    fn test_shell_backslash_doubling_idempotent() {
        let once = double_shell_backslashes("cd C:\\work").into_owned();
        assert_eq!(once, "cd C:\\\\work");
        assert_eq!(double_shell_backslashes(&once), once);
        assert_eq!(double_shell_backslashes("ls"), "ls");
    }

    #[test]
    fn test_shell_doubling_only_for_shell_tools() {
        let registry = ToolRegistry::new(["Bash", "Run"]).with_shell_tools(["Bash"]);
        let bash = normalize_arguments("Bash", args(json!({"command": "cd C:\\work"})), &registry)
            .unwrap();
        assert_eq!(bash["command"], "cd C:\\\\work");
        let run = normalize_arguments("Run", args(json!({"command": "cd C:\\work"})), &registry)
            .unwrap();
        assert_eq!(run["command"], "cd C:\\work");
    }
}
