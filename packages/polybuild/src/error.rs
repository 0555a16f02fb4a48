//! Structured error taxonomy (Section 7).
//!
//! A single [`Error`] struct covers every kind of failure the core produces.
//! It implements [`std::error::Error`] so it composes with
//! `color_eyre::eyre::eyre!`/`.context(...)` the way the teacher wraps IO and
//! network errors; callers that want rich terminal reporting wrap it in
//! [`color_eyre::Report`].

use std::{fmt, path::PathBuf};

use derive_more::Display;
use serde::{Deserialize, Serialize};

/// The taxonomy of error kinds the core can produce.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// A target id was declared more than once in a workspace.
    DuplicateTarget,
    /// An edge or query referenced a target id the graph doesn't know.
    UnknownTarget,
    /// Adding an edge, or a dynamic extension, would create a cycle.
    CycleDetected,
    /// The on-disk cache is corrupt beyond self-healing (bad header, CRC
    /// mismatch on every record, etc).
    CacheCorruption,
    /// A workspace, target, or ignore file failed to parse.
    ConfigParse,
    /// A filesystem operation failed (read/write/rename/permissions).
    Io,
    /// A handler invocation failed or timed out.
    HandlerFailure,
    /// A peer (worker or coordinator) request failed, timed out, or
    /// returned an unexpected response.
    PeerCommunication,
    /// A graph query expression failed to parse or evaluate.
    QueryError,
}

/// Suggested remediation attached to an [`Error`], rendered by the CLI's
/// error reporter (out of scope here, but this is the structured type it
/// consumes).
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Serialize, Deserialize)]
pub enum Suggestion {
    #[display("run `{_0}`")]
    RunCommand(String),
    #[display("see docs: {_0}")]
    SeeDocs(String),
    #[display("check file: {_0}")]
    CheckFile(String),
    #[display("change configuration: {_0}")]
    ChangeConfig(String),
}

/// A single structured error.
///
/// Equality is implemented by `(kind, message, path)` only, per spec, so
/// batch diagnostics can dedup errors that differ only in line/column or
/// accumulated context.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub path: Option<PathBuf>,
    pub line: Option<u32>,
    pub column: Option<u32>,
    pub contexts: Vec<String>,
    pub suggestions: Vec<Suggestion>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            line: None,
            column: None,
            contexts: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_location(mut self, line: u32, column: u32) -> Self {
        self.line = Some(line);
        self.column = Some(column);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.contexts.push(context.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: Suggestion) -> Self {
        self.suggestions.push(suggestion);
        self
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.message == other.message && self.path == other.path
    }
}

impl Eq for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(path) = &self.path {
            write!(f, " ({}", path.display())?;
            if let (Some(line), Some(col)) = (self.line, self.column) {
                write!(f, ":{line}:{col}")?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_ignores_line_and_column() {
        let a = Error::new(ErrorKind::CycleDetected, "cycle").with_location(1, 1);
        let b = Error::new(ErrorKind::CycleDetected, "cycle").with_location(99, 99);
        assert_eq!(a, b);
    }

    #[test]
    fn equality_considers_path() {
        let a = Error::new(ErrorKind::Io, "boom").with_path("/a");
        let b = Error::new(ErrorKind::Io, "boom").with_path("/b");
        assert_ne!(a, b);
    }

    #[test]
    fn display_includes_location() {
        let err = Error::new(ErrorKind::ConfigParse, "bad toml")
            .with_path("/ws/target.toml")
            .with_location(3, 5);
        let rendered = err.to_string();
        assert!(rendered.contains("bad toml"));
        assert!(rendered.contains("3:5"));
    }
}
