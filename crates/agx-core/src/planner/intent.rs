//! Recognized task intents and their canonical step templates.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::Params;

use super::{FILE_READ_TOOL, FILE_WRITE_TOOL, RUN_CODE_TOOL, SEARCH_TOOL, SHELL_TOOL};

/// Closed set of task intents the planner knows how to template.
///
/// Variants are listed in classification precedence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskIntent {
    Refactor,
    RunTests,
    Install,
    Commit,
    RunCode,
    Search,
    Read,
    Write,
}

/// One step of an intent template, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct TemplateStep {
    pub tool: &'static str,
    pub params: Params,
    pub description: String,
    /// Depend on the previous template step.
    pub after_previous: bool,
    /// Pass the previous step's id as the `from_step` parameter.
    pub input_from_previous: bool,
}

impl TemplateStep {
    fn first(tool: &'static str, params: Params, description: impl Into<String>) -> Self {
        Self {
            tool,
            params,
            description: description.into(),
            after_previous: false,
            input_from_previous: false,
        }
    }

    fn then(tool: &'static str, params: Params, description: impl Into<String>) -> Self {
        Self {
            after_previous: true,
            ..Self::first(tool, params, description)
        }
    }

    fn fed(mut self) -> Self {
        self.input_from_previous = true;
        self
    }
}

impl TaskIntent {
    pub const ALL: [TaskIntent; 8] = [
        TaskIntent::Refactor,
        TaskIntent::RunTests,
        TaskIntent::Install,
        TaskIntent::Commit,
        TaskIntent::RunCode,
        TaskIntent::Search,
        TaskIntent::Read,
        TaskIntent::Write,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskIntent::Refactor => "refactor",
            TaskIntent::RunTests => "run_tests",
            TaskIntent::Install => "install",
            TaskIntent::Commit => "commit",
            TaskIntent::RunCode => "run_code",
            TaskIntent::Search => "search",
            TaskIntent::Read => "read",
            TaskIntent::Write => "write",
        }
    }

    /// Description keywords. Single words match any token that starts with
    /// them; phrases match as substrings of the normalized description.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            TaskIntent::Refactor => &["refactor", "rename"],
            TaskIntent::RunTests => &["test", "pytest"],
            TaskIntent::Install => &["install"],
            TaskIntent::Commit => &["git", "commit"],
            TaskIntent::RunCode => &["execute code", "run code", "python", "script"],
            TaskIntent::Search => &["search", "find", "grep"],
            TaskIntent::Read => &["read", "show", "view"],
            TaskIntent::Write => &["write", "create", "save"],
        }
    }

    /// Context keys that identify the intent when no keyword matched. All
    /// listed keys must be present.
    pub fn context_keys(self) -> &'static [&'static str] {
        match self {
            TaskIntent::Refactor => &["old_name", "new_name"],
            TaskIntent::RunTests => &[],
            TaskIntent::Install => &["package"],
            TaskIntent::Commit => &["message"],
            TaskIntent::RunCode => &["code"],
            TaskIntent::Search => &["pattern"],
            TaskIntent::Read => &["path"],
            TaskIntent::Write => &["path", "content"],
        }
    }

    /// Keyword match over the description first, then context keys.
    pub fn classify(task: &str, context: &Params) -> Option<TaskIntent> {
        let normalized = normalize(task);
        let tokens: Vec<&str> = normalized.split(' ').filter(|t| !t.is_empty()).collect();

        let by_keyword = Self::ALL.into_iter().find(|intent| {
            intent.keywords().iter().any(|kw| {
                if kw.contains(' ') {
                    normalized.contains(kw)
                } else {
                    tokens.iter().any(|t| t.starts_with(kw))
                }
            })
        });
        if by_keyword.is_some() {
            return by_keyword;
        }

        // The most specific fully-present key set wins; ties keep precedence order.
        let mut best: Option<(TaskIntent, usize)> = None;
        for intent in Self::ALL {
            let keys = intent.context_keys();
            if keys.is_empty() || !keys.iter().all(|k| context.contains_key(*k)) {
                continue;
            }
            if best.map_or(true, |(_, n)| keys.len() > n) {
                best = Some((intent, keys.len()));
            }
        }
        best.map(|(intent, _)| intent)
    }

    /// The canonical ordered template for this intent. Parameters come only
    /// from `context`.
    pub fn template(self, context: &Params) -> Vec<TemplateStep> {
        match self {
            TaskIntent::Refactor => {
                let old = text(context, "old_name");
                let new = text(context, "new_name");
                vec![
                    TemplateStep::first(
                        SEARCH_TOOL,
                        rename_keys(context, &[("old_name", "pattern")]),
                        format!("Find occurrences of: {old}"),
                    ),
                    TemplateStep::then(
                        FILE_READ_TOOL,
                        pick(context, &["path"]),
                        format!("Read files containing: {old}"),
                    )
                    .fed(),
                    TemplateStep::then(
                        FILE_WRITE_TOOL,
                        pick(context, &["path", "old_name", "new_name"]),
                        format!("Replace {old} with {new}"),
                    )
                    .fed(),
                ]
            }
            TaskIntent::RunTests => {
                let command = context
                    .get("command")
                    .cloned()
                    .unwrap_or_else(|| Value::from("pytest"));
                vec![TemplateStep::first(
                    SHELL_TOOL,
                    Params::from([("command".to_string(), command)]),
                    "Run tests",
                )]
            }
            TaskIntent::Install => {
                let package = text(context, "package");
                vec![TemplateStep::first(
                    SHELL_TOOL,
                    Params::from([(
                        "command".to_string(),
                        Value::from(format!("pip install {package}")),
                    )]),
                    format!("Install package: {package}"),
                )]
            }
            TaskIntent::Commit => {
                let message = context
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("Update")
                    .to_string();
                vec![
                    TemplateStep::first(
                        SHELL_TOOL,
                        Params::from([("command".to_string(), Value::from("git add -A"))]),
                        "Stage changes",
                    ),
                    TemplateStep::then(
                        SHELL_TOOL,
                        Params::from([(
                            "command".to_string(),
                            Value::from(format!("git commit -m {message:?}")),
                        )]),
                        "Create commit",
                    ),
                ]
            }
            TaskIntent::RunCode => vec![TemplateStep::first(
                RUN_CODE_TOOL,
                pick(context, &["code"]),
                "Execute code in sandbox",
            )],
            TaskIntent::Search => {
                let pattern = text(context, "pattern");
                vec![TemplateStep::first(
                    SEARCH_TOOL,
                    pick(context, &["pattern", "file_pattern", "root"]),
                    format!("Search for pattern: {pattern}"),
                )]
            }
            TaskIntent::Read => {
                let path = text(context, "path");
                vec![TemplateStep::first(
                    FILE_READ_TOOL,
                    pick(context, &["path"]),
                    format!("Read file: {path}"),
                )]
            }
            TaskIntent::Write => {
                let path = text(context, "path");
                vec![TemplateStep::first(
                    FILE_WRITE_TOOL,
                    pick(context, &["path", "content"]),
                    format!("Write to file: {path}"),
                )]
            }
        }
    }
}

impl std::fmt::Display for TaskIntent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

fn normalize(task: &str) -> String {
    task.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn text(context: &Params, key: &str) -> String {
    match context.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

fn pick(context: &Params, keys: &[&str]) -> Params {
    keys.iter()
        .filter_map(|k| context.get(*k).map(|v| (k.to_string(), v.clone())))
        .collect()
}

fn rename_keys(context: &Params, pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .filter_map(|(from, to)| context.get(*from).map(|v| (to.to_string(), v.clone())))
        .collect()
}
