//! Static denylist check over the code's imports and dotted references.
//!
//! This is a cheap pre-check, not a security boundary: aliasing,
//! `getattr`, `exec` and similar indirection are not followed. Containment
//! comes from the process limits and the scoped working directory.

use std::collections::BTreeSet;
use std::sync::OnceLock;

use regex::Regex;

/// A denied name that the code references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeniedReference {
    /// Name as referenced by the code (`urllib.request`).
    pub referenced: String,
    /// Denylist entry it matched (`urllib`).
    pub denied: String,
}

impl std::fmt::Display for DeniedReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.referenced == self.denied {
            write!(f, "Blocked import: {}", self.denied)
        } else {
            write!(f, "Blocked import: {} (denied: {})", self.referenced, self.denied)
        }
    }
}

struct Patterns {
    import: Regex,
    from_import: Regex,
    dynamic: Regex,
    dotted: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        import: Regex::new(r"^\s*import\s+(.+)$").expect("static regex"),
        from_import: Regex::new(r"^\s*from\s+([\w.]+)\s+import\s+(.+)$").expect("static regex"),
        dynamic: Regex::new(r#"(?:__import__|importlib\s*\.\s*import_module)\s*\(\s*['"]([\w.]+)['"]"#)
            .expect("static regex"),
        dotted: Regex::new(r"\b([A-Za-z_]\w*(?:\.[A-Za-z_]\w*)+)").expect("static regex"),
    })
}

fn strip_alias(item: &str) -> &str {
    item.split_whitespace().next().unwrap_or("")
}

/// Every module or dotted name the code declares or references.
pub fn referenced_names(code: &str) -> BTreeSet<String> {
    let p = patterns();
    let mut names = BTreeSet::new();

    for line in code.lines() {
        if line.trim_start().starts_with('#') {
            continue;
        }
        for stmt in line.split(';') {
            if let Some(caps) = p.from_import.captures(stmt) {
                let module = &caps[1];
                names.insert(module.to_string());
                for item in caps[2].trim_matches(|c: char| c == '(' || c == ')').split(',') {
                    let item = strip_alias(item.trim_matches(|c: char| c == '(' || c == ')'));
                    if !item.is_empty() && item != "*" {
                        names.insert(format!("{module}.{item}"));
                    }
                }
            } else if let Some(caps) = p.import.captures(stmt) {
                for item in caps[1].split(',') {
                    let item = strip_alias(item);
                    if !item.is_empty() {
                        names.insert(item.to_string());
                    }
                }
            }
        }
        for caps in p.dynamic.captures_iter(line) {
            names.insert(caps[1].to_string());
        }
        for caps in p.dotted.captures_iter(line) {
            names.insert(caps[1].to_string());
        }
    }
    names
}

fn covers(denied: &str, name: &str) -> bool {
    name == denied
        || name
            .strip_prefix(denied)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// First denied name the code references, if any.
pub fn find_denied(code: &str, denylist: &[String]) -> Option<DeniedReference> {
    if denylist.is_empty() {
        return None;
    }
    referenced_names(code).into_iter().find_map(|name| {
        denylist
            .iter()
            .find(|d| covers(d, &name))
            .map(|d| DeniedReference {
                referenced: name.clone(),
                denied: d.clone(),
            })
    })
}
