//! `.dockerignore`-style exclude patterns.
//!
//! Patterns are matched against slash-separated paths relative to the
//! copy root. A leading `!` re-includes paths matched by an earlier
//! pattern, and a pattern that matches a directory also matches
//! everything below it.

use std::path::Path;

use a3s_build_core::error::{BuildError, Result};
use regex::Regex;

use super::resolve::clean_path;

#[derive(Debug, Clone)]
struct Pattern {
    source: String,
    regex: Regex,
    depth: usize,
    exclusion: bool,
}

impl Pattern {
    fn parse(raw: &str) -> Result<Option<Self>> {
        let mut text = raw.trim();
        let exclusion = text.starts_with('!');
        if exclusion {
            text = text[1..].trim();
        }
        if text.is_empty() {
            return Ok(None);
        }
        let cleaned = clean_path(Path::new(text)).display().to_string();
        let cleaned = cleaned.trim_start_matches('/').to_string();
        if cleaned.is_empty() || cleaned == "." {
            return Ok(None);
        }
        let regex = Regex::new(&glob_to_regex(&cleaned)).map_err(|e| {
            BuildError::InvalidArgument(format!("invalid exclude pattern {:?}: {}", raw, e))
        })?;
        Ok(Some(Self {
            depth: cleaned.split('/').count(),
            source: cleaned,
            regex,
            exclusion,
        }))
    }
}

fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    let chars: Vec<char> = pattern.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '*' => {
                if chars.get(i + 1) == Some(&'*') {
                    i += 1;
                    if chars.get(i + 1) == Some(&'/') {
                        i += 1;
                        out.push_str("(.*/)?");
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
                if chars.get(j) == Some(&'!') || chars.get(j) == Some(&'^') {
                    class.push('^');
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    if chars[j] == '\\' {
                        class.push('\\');
                    }
                    class.push(chars[j]);
                    j += 1;
                }
                if j < chars.len() {
                    class.push(']');
                    out.push_str(&class);
                    i = j;
                } else {
                    out.push_str(r"\[");
                }
            }
            '\\' if i + 1 < chars.len() => {
                i += 1;
                out.push_str(&regex::escape(&chars[i].to_string()));
            }
            other => out.push_str(&regex::escape(&other.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

/// Compiled exclude list.
#[derive(Debug, Clone, Default)]
pub struct ExcludeMatcher {
    patterns: Vec<Pattern>,
}

impl ExcludeMatcher {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let mut compiled = Vec::new();
        for p in patterns {
            if let Some(pattern) = Pattern::parse(p.as_ref())? {
                compiled.push(pattern);
            }
        }
        Ok(Self { patterns: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether any pattern re-includes paths.
    pub fn has_exclusions(&self) -> bool {
        self.patterns.iter().any(|p| p.exclusion)
    }

    /// Whether `rel` (relative to the copy root) is excluded.
    pub fn matches(&self, rel: &Path) -> bool {
        let file = rel.to_string_lossy().replace('\\', "/");
        let file = file.trim_start_matches("./").trim_start_matches('/');
        if file.is_empty() || file == "." {
            return false;
        }
        let parent_dirs: Vec<&str> = match file.rfind('/') {
            Some(idx) => file[..idx].split('/').collect(),
            None => Vec::new(),
        };
        let mut matched = false;
        for pattern in &self.patterns {
            // an inclusion can't change an already-excluded path, and an
            // exclusion only matters once something matched
            if pattern.exclusion != matched {
                continue;
            }
            let mut hit = pattern.regex.is_match(file);
            if !hit && !parent_dirs.is_empty() && pattern.depth <= parent_dirs.len() {
                hit = pattern
                    .regex
                    .is_match(&parent_dirs[..pattern.depth].join("/"));
            }
            if hit {
                matched = !pattern.exclusion;
            }
        }
        matched
    }

    /// Whether a directory that is itself excluded may still contain
    /// re-included paths, so a walk must descend into it.
    pub fn may_reinclude_below(&self, dir_rel: &Path) -> bool {
        let dir = dir_rel.to_string_lossy();
        let dir = dir.trim_matches('/');
        self.patterns
            .iter()
            .filter(|p| p.exclusion)
            .any(|p| format!("{}/", p.source.trim_matches('/')).starts_with(dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(patterns: &[&str]) -> ExcludeMatcher {
        ExcludeMatcher::new(patterns).unwrap()
    }

    #[test]
    fn test_simple_and_wildcards() {
        let m = matcher(&["*.log", "build/", "docs/?.md"]);
        assert!(m.matches(Path::new("app.log")));
        assert!(!m.matches(Path::new("logs/app.txt")));
        assert!(m.matches(Path::new("build")));
        assert!(m.matches(Path::new("build/out/bin")));
        assert!(m.matches(Path::new("docs/a.md")));
        assert!(!m.matches(Path::new("docs/ab.md")));
    }

    #[test]
    fn test_double_star() {
        let m = matcher(&["**/*.tmp"]);
        assert!(m.matches(Path::new("x.tmp")));
        assert!(m.matches(Path::new("a/b/c.tmp")));
        assert!(!m.matches(Path::new("a/b/c.txt")));
    }

    #[test]
    fn test_negation() {
        let m = matcher(&["*.md", "!README.md"]);
        assert!(m.matches(Path::new("CHANGES.md")));
        assert!(!m.matches(Path::new("README.md")));
        assert!(m.has_exclusions());
    }

    #[test]
    fn test_reinclude_below_excluded_dir() {
        let m = matcher(&["vendor", "!vendor/keep"]);
        assert!(m.matches(Path::new("vendor/drop.go")));
        assert!(!m.matches(Path::new("vendor/keep")));
        assert!(m.may_reinclude_below(Path::new("vendor")));
        assert!(!m.may_reinclude_below(Path::new("other")));
    }

    #[test]
    fn test_leading_slash_and_empty_lines() {
        let m = matcher(&["", "  ", "/secret"]);
        assert!(m.matches(Path::new("secret")));
        assert!(!m.matches(Path::new(".")));
    }

    #[test]
    fn test_character_class() {
        let m = matcher(&["file[0-9].txt"]);
        assert!(m.matches(Path::new("file3.txt")));
        assert!(!m.matches(Path::new("fileX.txt")));
    }
}
