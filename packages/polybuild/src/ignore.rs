//! Gitignore-style ignore patterns with severity classes (Section 6).
//!
//! A handful of directory bases — VCS metadata, OS metadata, and known
//! language dependency trees — are always ignored at [`Severity::Critical`]
//! regardless of user configuration; they can only be un-ignored by an
//! explicit `!negation` in the workspace's ignore file. User-supplied
//! patterns default to [`Severity::High`] unless given an explicit
//! `low:`/`moderate:` prefix.
//!
//! Matching follows gitignore's last-match-wins rule: patterns are
//! evaluated in file order (built-ins first, then the ignore file's lines),
//! and the last pattern that matches a path determines its fate.

use camino::Utf8Path;
use color_eyre::{Result, eyre::Context};
use globset::{Glob, GlobMatcher};

/// How strongly a matched pattern excludes a path.
///
/// `Critical` additionally means "never descend into this directory at
/// all" during a workspace walk, not just "skip this file".
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub enum Severity {
    Low,
    Moderate,
    High,
    Critical,
}

/// Directory bases that are always ignored unless explicitly negated.
const BUILTIN_CRITICAL_GLOBS: &[&str] = &[
    "**/.git/**",
    "**/.hg/**",
    "**/.svn/**",
    "**/.DS_Store",
    "**/node_modules/**",
    "**/target/**",
    "**/.venv/**",
    "**/venv/**",
    "**/__pycache__/**",
    "**/vendor/**",
    "**/.builder-cache/**",
];

struct Pattern {
    matcher: GlobMatcher,
    severity: Severity,
    negate: bool,
}

/// A compiled set of ignore patterns for one workspace.
pub struct IgnoreSet {
    patterns: Vec<Pattern>,
}

impl IgnoreSet {
    /// The built-in critical patterns alone, with no user patterns layered
    /// on top.
    pub fn with_builtins() -> Result<Self> {
        let mut set = Self {
            patterns: Vec::new(),
        };
        for glob in BUILTIN_CRITICAL_GLOBS {
            set.push_pattern(glob, Severity::Critical, false)?;
        }
        Ok(set)
    }

    /// Parse a gitignore-style ignore file and append its patterns after
    /// the built-ins.
    ///
    /// Syntax per line: `#` comments and blank lines are skipped; a leading
    /// `!` negates; an optional `low:`/`moderate:` prefix after the `!`
    /// lowers the severity from the `High` default (`critical:` is
    /// rejected — only built-ins may claim that tier).
    pub fn parse(text: &str) -> Result<Self> {
        let mut set = Self::with_builtins()?;
        set.extend(text)?;
        Ok(set)
    }

    pub fn extend(&mut self, text: &str) -> Result<()> {
        for (lineno, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (negate, rest) = match line.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, line),
            };

            let (severity, pattern) = if let Some(rest) = rest.strip_prefix("low:") {
                (Severity::Low, rest)
            } else if let Some(rest) = rest.strip_prefix("moderate:") {
                (Severity::Moderate, rest)
            } else if let Some(rest) = rest.strip_prefix("critical:") {
                color_eyre::eyre::bail!(
                    "ignore file line {}: `critical:` is reserved for built-in patterns",
                    lineno + 1
                );
            } else {
                (Severity::High, rest)
            };

            self.push_pattern(pattern, severity, negate)
                .with_context(|| format!("ignore file line {}", lineno + 1))?;
        }
        Ok(())
    }

    fn push_pattern(&mut self, pattern: &str, severity: Severity, negate: bool) -> Result<()> {
        let glob = Glob::new(pattern).with_context(|| format!("compile glob {pattern:?}"))?;
        self.patterns.push(Pattern {
            matcher: glob.compile_matcher(),
            severity,
            negate,
        });
        Ok(())
    }

    /// Evaluate a path: the last matching pattern wins. `None` means not
    /// ignored.
    pub fn evaluate(&self, path: &Utf8Path) -> Option<Severity> {
        let mut decision = None;
        for pattern in &self.patterns {
            if pattern.matcher.is_match(path) {
                decision = if pattern.negate {
                    None
                } else {
                    Some(pattern.severity)
                };
            }
        }
        decision
    }

    pub fn is_ignored(&self, path: &Utf8Path) -> bool {
        self.evaluate(path).is_some()
    }

    /// Whether a directory should not even be entered during a workspace
    /// walk.
    pub fn prunes_directory(&self, path: &Utf8Path) -> bool {
        self.evaluate(path) == Some(Severity::Critical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_git_directory_is_critical() {
        let set = IgnoreSet::with_builtins().unwrap();
        let path = Utf8Path::new("repo/.git/HEAD");
        assert_eq!(set.evaluate(path), Some(Severity::Critical));
        assert!(set.prunes_directory(path));
    }

    #[test]
    fn user_pattern_defaults_to_high() {
        let set = IgnoreSet::parse("*.log\n").unwrap();
        assert_eq!(
            set.evaluate(Utf8Path::new("build/out.log")),
            Some(Severity::High)
        );
    }

    #[test]
    fn negation_overrides_a_builtin() {
        let set = IgnoreSet::parse("!**/vendor/keep-me/**\n").unwrap();
        assert_eq!(
            set.evaluate(Utf8Path::new("pkg/vendor/keep-me/lib.rs")),
            None
        );
        assert_eq!(
            set.evaluate(Utf8Path::new("pkg/vendor/other/lib.rs")),
            Some(Severity::Critical)
        );
    }

    #[test]
    fn explicit_severity_prefix_is_honored() {
        let set = IgnoreSet::parse("moderate:*.tmp\nlow:*.bak\n").unwrap();
        assert_eq!(
            set.evaluate(Utf8Path::new("a.tmp")),
            Some(Severity::Moderate)
        );
        assert_eq!(set.evaluate(Utf8Path::new("a.bak")), Some(Severity::Low));
    }

    #[test]
    fn critical_prefix_is_rejected_from_user_input() {
        assert!(IgnoreSet::parse("critical:*.rs\n").is_err());
    }
}
