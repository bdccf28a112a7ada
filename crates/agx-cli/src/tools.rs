//! Demonstration tool catalog for `agx run`: file read/write, search and
//! shell, all confined to one root directory.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agx_core::{
    FailureClass, Params, ParamType, ParameterSchema, Tool, ToolRegistry, ToolResult,
};
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::{json, Value};

const DEFAULT_MAX_RESULTS: usize = 50;
const DEFAULT_SHELL_TIMEOUT_SECS: u64 = 30;

/// Registry holding every demo tool rooted at `root`.
pub fn registry(root: &Path) -> anyhow::Result<ToolRegistry> {
    let root = Arc::new(root.to_path_buf());
    let mut registry = ToolRegistry::new();
    registry.register(FileRead { root: root.clone() })?;
    registry.register(FileWrite { root: root.clone() })?;
    registry.register(Search { root: root.clone() })?;
    registry.register(Shell { root })?;
    Ok(registry)
}

/// Resolve `path` under `root`, refusing anything that escapes it.
fn confine(root: &Path, path: &str) -> Result<PathBuf, ToolResult> {
    let candidate = Path::new(path);
    let relative = if candidate.is_absolute() {
        candidate.strip_prefix(root).map_err(|_| {
            ToolResult::err(format!("Access to {path} is not allowed"))
        })?
    } else {
        candidate
    };
    if relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(ToolResult::err(format!("Access to {path} is not allowed")));
    }
    Ok(root.join(relative))
}

fn str_param<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

/// Path handed down from an earlier step's output.
fn upstream_path(params: &Params) -> Option<String> {
    let input = params.get("input")?;
    if let Some(path) = input.get("path").and_then(Value::as_str) {
        return Some(path.to_string());
    }
    input
        .get("files")
        .and_then(Value::as_array)
        .and_then(|files| files.first())
        .or_else(|| {
            input
                .get("matches")
                .and_then(Value::as_array)
                .and_then(|m| m.first())
                .and_then(|m| m.get("path"))
        })
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn io_failure(path: &str, e: std::io::Error) -> ToolResult {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            ToolResult::err(format!("File not found: {path}")).with_failure_class(FailureClass::NotFound)
        }
        std::io::ErrorKind::PermissionDenied => ToolResult::err(format!("Permission denied: {path}")),
        _ => ToolResult::err(format!("{path}: {e}")),
    }
}

struct FileRead {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for FileRead {
    fn name(&self) -> &str {
        "file_read"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .optional("path", ParamType::String, "file to read, relative to the root")
            .optional("input", ParamType::Object, "upstream step output naming a file")
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let Some(path) = str_param(params, "path")
            .map(str::to_string)
            .or_else(|| upstream_path(params))
        else {
            return ToolResult::err("Path is required");
        };
        let full = match confine(&self.root, &path) {
            Ok(p) => p,
            Err(denied) => return denied,
        };
        match tokio::fs::read_to_string(&full).await {
            Ok(content) => ToolResult::ok(json!({
                "path": path,
                "size": content.len(),
                "content": content,
            })),
            Err(e) => io_failure(&path, e),
        }
    }
}

struct FileWrite {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for FileWrite {
    fn name(&self) -> &str {
        "file_write"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .optional("path", ParamType::String, "file to write, relative to the root")
            .optional("content", ParamType::String, "full new content")
            .optional("old_name", ParamType::String, "text to replace")
            .optional("new_name", ParamType::String, "replacement text")
            .optional("input", ParamType::Object, "upstream file_read output")
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let Some(path) = str_param(params, "path")
            .map(str::to_string)
            .or_else(|| upstream_path(params))
        else {
            return ToolResult::err("Path is required");
        };
        let full = match confine(&self.root, &path) {
            Ok(p) => p,
            Err(denied) => return denied,
        };

        let content = match (str_param(params, "old_name"), str_param(params, "new_name")) {
            (Some(old), Some(new)) => {
                let current = match params
                    .get("input")
                    .and_then(|i| i.get("content"))
                    .and_then(Value::as_str)
                {
                    Some(text) => text.to_string(),
                    None => match tokio::fs::read_to_string(&full).await {
                        Ok(text) => text,
                        Err(e) => return io_failure(&path, e),
                    },
                };
                current.replace(old, new)
            }
            _ => match str_param(params, "content") {
                Some(content) => content.to_string(),
                None => return ToolResult::err("Content is required"),
            },
        };

        if let Some(parent) = full.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                return io_failure(&path, e);
            }
        }
        match tokio::fs::write(&full, content.as_bytes()).await {
            Ok(()) => ToolResult::ok(json!({ "path": path, "size": content.len() })),
            Err(e) => io_failure(&path, e),
        }
    }
}

struct Search {
    root: Arc<PathBuf>,
}

fn glob_to_regex(glob: &str) -> String {
    let escaped: Vec<String> = glob.split('*').map(regex::escape).collect();
    format!("^{}$", escaped.join(".*"))
}

fn search_tree(
    root: &Path,
    pattern: &regex::Regex,
    file_pattern: &regex::Regex,
    max_results: usize,
) -> Value {
    let mut matches = Vec::new();
    let mut files = Vec::new();
    let mut searched = 0usize;
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut entries: Vec<_> = entries.flatten().map(|e| e.path()).collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                stack.push(path);
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !file_pattern.is_match(&name) {
                continue;
            }
            let display = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .display()
                .to_string();
            if pattern.is_match(&name) {
                files.push(display.clone());
            }
            searched += 1;
            let Ok(text) = std::fs::read_to_string(&path) else {
                continue;
            };
            for (i, line) in text.lines().enumerate() {
                if matches.len() >= max_results {
                    break;
                }
                if pattern.is_match(line) {
                    matches.push(json!({ "path": display, "line": i + 1, "text": line.trim() }));
                }
            }
        }
    }

    json!({ "matches": matches, "files": files, "files_searched": searched })
}

#[async_trait]
impl Tool for Search {
    fn name(&self) -> &str {
        "search"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required("pattern", ParamType::String, "regex matched against lines and file names")
            .optional("file_pattern", ParamType::String, "glob for file names")
            .optional("max_results", ParamType::Integer, "line match cap")
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let pattern = str_param(params, "pattern").unwrap_or_default();
        let pattern = match RegexBuilder::new(pattern).case_insensitive(true).build() {
            Ok(re) => re,
            Err(e) => return ToolResult::err(format!("Invalid regex: {e}")),
        };
        let file_pattern = match regex::Regex::new(&glob_to_regex(
            str_param(params, "file_pattern").unwrap_or("*"),
        )) {
            Ok(re) => re,
            Err(e) => return ToolResult::err(format!("Invalid file pattern: {e}")),
        };
        let max_results = params
            .get("max_results")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_MAX_RESULTS);

        let root = self.root.as_ref().clone();
        match tokio::task::spawn_blocking(move || {
            search_tree(&root, &pattern, &file_pattern, max_results)
        })
        .await
        {
            Ok(output) => ToolResult::ok(output),
            Err(e) => ToolResult::err(format!("search worker failed: {e}")),
        }
    }
}

struct Shell {
    root: Arc<PathBuf>,
}

#[async_trait]
impl Tool for Shell {
    fn name(&self) -> &str {
        "shell"
    }

    fn parameter_schema(&self) -> ParameterSchema {
        ParameterSchema::new()
            .required("command", ParamType::String, "command line for `sh -c`")
            .optional("timeout", ParamType::Integer, "seconds before the command is killed")
    }

    async fn invoke(&self, params: &Params) -> ToolResult {
        let command = str_param(params, "command").unwrap_or_default();
        let timeout = params
            .get("timeout")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_SHELL_TIMEOUT_SECS);

        let mut child = tokio::process::Command::new("sh");
        child
            .arg("-c")
            .arg(command)
            .current_dir(self.root.as_ref())
            .kill_on_drop(true);

        match tokio::time::timeout(Duration::from_secs(timeout), child.output()).await {
            Err(_) => ToolResult::err(format!("Command timed out after {timeout}s"))
                .with_failure_class(FailureClass::Transient),
            Ok(Err(e)) => ToolResult::err(format!("failed to spawn shell: {e}")),
            Ok(Ok(output)) => {
                let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
                let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
                let body = json!({
                    "stdout": stdout,
                    "stderr": stderr,
                    "exit_code": output.status.code(),
                });
                if output.status.success() {
                    ToolResult::ok(body)
                } else {
                    let mut failed = ToolResult::err(if stderr.trim().is_empty() {
                        format!("command exited with {}", output.status)
                    } else {
                        stderr
                    });
                    failed.output = body;
                    failed
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(v: Value) -> Params {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn test_confine_rejects_escape() {
        let root = Path::new("/srv/work");
        assert!(confine(root, "../etc/passwd").is_err());
        assert!(confine(root, "/etc/passwd").is_err());
        assert_eq!(confine(root, "a/b.txt").unwrap(), root.join("a/b.txt"));
        assert_eq!(confine(root, "/srv/work/x").unwrap(), root.join("x"));
    }

    #[test]
    fn test_glob_to_regex() {
        let re = regex::Regex::new(&glob_to_regex("*.py")).unwrap();
        assert!(re.is_match("main.py"));
        assert!(!re.is_match("main.pyc"));
    }

    #[tokio::test]
    async fn test_read_missing_file_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).unwrap();
        let result = reg
            .invoke("file_read", &params(json!({"path": "nope.txt"})))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.failure_class, Some(FailureClass::NotFound));
    }

    #[tokio::test]
    async fn test_rename_through_search_read_write() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.py"), "def getUserData():\n    pass\n").unwrap();
        let reg = registry(dir.path()).unwrap();

        let found = reg
            .invoke("search", &params(json!({"pattern": "getUserData"})))
            .await
            .unwrap();
        assert_eq!(found.output["matches"][0]["path"], "lib.py");

        let read = reg
            .invoke("file_read", &params(json!({"input": found.output})))
            .await
            .unwrap();
        assert!(read.success);

        let written = reg
            .invoke(
                "file_write",
                &params(json!({
                    "input": read.output,
                    "old_name": "getUserData",
                    "new_name": "fetchUserProfile",
                })),
            )
            .await
            .unwrap();
        assert!(written.success, "{:?}", written.error);
        let text = std::fs::read_to_string(dir.path().join("lib.py")).unwrap();
        assert!(text.contains("fetchUserProfile"));
    }

    #[tokio::test]
    async fn test_shell_reports_exit_status() {
        let dir = tempfile::tempdir().unwrap();
        let reg = registry(dir.path()).unwrap();
        let ok = reg
            .invoke("shell", &params(json!({"command": "echo hi"})))
            .await
            .unwrap();
        assert!(ok.success);
        assert_eq!(ok.output["stdout"], "hi\n");

        let bad = reg
            .invoke("shell", &params(json!({"command": "exit 3"})))
            .await
            .unwrap();
        assert!(!bad.success);
        assert_eq!(bad.output["exit_code"], 3);
    }
}
