//! Include/exclude path filtering
//!
//! Glob syntax: `*` (within one path segment), `?`, `**` (any number of
//! segments), `[abc]` / `[!abc]`, `{a,b}` and `\` escapes. A pattern without
//! a `/` is matched against the file name only; otherwise it is matched
//! against the path relative to the scan base.

use crate::error::ConfigError;
use regex::Regex;
use std::path::{Component, Path};

/// OS metadata files and folders skipped by default
pub const OS_FILES: [&str; 5] = [
    ".DS_Store",
    "Thumbs.db",
    "desktop.ini",
    "$RECYCLE.BIN",
    "System Volume Information",
];

/// A compiled glob
#[derive(Debug, Clone)]
pub struct Glob {
    pattern: String,
    regex: Regex,
    name_only: bool,
}

impl Glob {
    /// Compile a glob pattern
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        let source = glob_to_regex(pattern)?;
        let regex = Regex::new(&source).map_err(|e| ConfigError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            pattern: pattern.to_string(),
            regex,
            name_only: !pattern.contains('/'),
        })
    }

    /// The pattern as given
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Match against a file name and a `/`-separated relative path
    pub fn is_match(&self, name: &str, relative: &str) -> bool {
        if self.name_only {
            self.regex.is_match(name)
        } else {
            self.regex.is_match(relative)
        }
    }
}

fn invalid(pattern: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    }
}

/// Translate a glob into an anchored regular expression
pub fn glob_to_regex(pattern: &str) -> Result<String, ConfigError> {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::with_capacity(pattern.len() * 2 + 2);
    out.push('^');

    let mut brace_depth = 0usize;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    i += 1;
                    if chars.get(i + 1) == Some(&'/') {
                        i += 1;
                        out.push_str("(?:.*/)?");
                    } else {
                        out.push_str(".*");
                    }
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            '[' => {
                let mut j = i + 1;
                let mut class = String::from("[");
                if matches!(chars.get(j), Some('!') | Some('^')) {
                    class.push('^');
                    j += 1;
                }
                // A leading ']' is literal
                if chars.get(j) == Some(&']') {
                    class.push_str("\\]");
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    match chars[j] {
                        '\\' | '[' | '&' | '~' | '^' => {
                            class.push('\\');
                            class.push(chars[j]);
                        }
                        other => class.push(other),
                    }
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(invalid(pattern, "unterminated character class"));
                }
                class.push(']');
                out.push_str(&class);
                i = j;
            }
            '{' => {
                brace_depth += 1;
                out.push_str("(?:");
            }
            ',' if brace_depth > 0 => out.push('|'),
            '}' if brace_depth > 0 => {
                brace_depth -= 1;
                out.push(')');
            }
            '\\' => {
                i += 1;
                match chars.get(i) {
                    Some(escaped) => out.push_str(&regex::escape(&escaped.to_string())),
                    None => return Err(invalid(pattern, "dangling escape")),
                }
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }

    if brace_depth > 0 {
        return Err(invalid(pattern, "unclosed '{'"));
    }
    out.push('$');
    Ok(out)
}

/// Include/exclude globs plus the built-in hidden and OS-file matchers
#[derive(Debug, Clone)]
pub struct PathFilter {
    includes: Vec<Glob>,
    excludes: Vec<Glob>,
    skip_hidden: bool,
    skip_os_files: bool,
}

impl Default for PathFilter {
    fn default() -> Self {
        Self {
            includes: Vec::new(),
            excludes: Vec::new(),
            skip_hidden: true,
            skip_os_files: true,
        }
    }
}

impl PathFilter {
    /// Compile include and exclude patterns
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            includes: includes.iter().map(|p| Glob::new(p)).collect::<Result<_, _>>()?,
            excludes: excludes.iter().map(|p| Glob::new(p)).collect::<Result<_, _>>()?,
            ..Self::default()
        })
    }

    /// Toggle the hidden-file matcher
    pub fn skip_hidden(mut self, skip: bool) -> Self {
        self.skip_hidden = skip;
        self
    }

    /// Toggle the OS metadata matcher
    pub fn skip_os_files(mut self, skip: bool) -> Self {
        self.skip_os_files = skip;
        self
    }

    fn builtin_excluded(&self, name: &str) -> bool {
        (self.skip_hidden && name.starts_with('.') && name != "." && name != "..")
            || (self.skip_os_files && OS_FILES.contains(&name))
    }

    /// Whether a path matches any exclude matcher. Used for directories,
    /// whose whole subtree is then skipped.
    pub fn is_excluded(&self, path: &Path, relative: &str) -> bool {
        let name = file_name(path);
        self.builtin_excluded(&name) || self.excludes.iter().any(|g| g.is_match(&name, relative))
    }

    /// Whether a file should be queued
    pub fn accepts(&self, path: &Path, relative: &str) -> bool {
        if self.is_excluded(path, relative) {
            return false;
        }
        if self.includes.is_empty() {
            return true;
        }
        let name = file_name(path);
        self.includes.iter().any(|g| g.is_match(&name, relative))
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// `path` relative to `base`, with `/` separators
pub fn relative_path(base: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(base).unwrap_or(path);
    let parts: Vec<String> = relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();
    parts.join("/")
}
