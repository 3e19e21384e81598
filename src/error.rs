//! Error types for template compilation.
//!
//! [`CompileError`] covers the fatal failures: malformed input markup,
//! bad directive grammar, and I/O. Data-availability problems (missing
//! scope entries, rejected expressions) are absorbed during a lenient
//! compile and only become [`CompileError`]s in strict mode.

use std::sync::Arc;
use thiserror::Error;

/// An error that aborts a compile.
///
/// Carries a structured [`CompileErrorKind`], a human-readable message,
/// and an optional underlying error cause.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub message: String,
    /// The underlying error that caused this one, if any.
    ///
    /// Wrapped in `Arc` so that `CompileError` remains `Clone`.
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Attach an underlying error cause, preserving the full chain for
    /// logging and debugging.
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    // Convenience constructors for common error types

    pub fn parse(message: impl Into<String>) -> Self {
        Self::new(CompileErrorKind::Parse, message)
    }

    pub fn parse_at(message: impl Into<String>, position: u64) -> Self {
        Self::new(
            CompileErrorKind::Parse,
            format!("{} (at byte {position})", message.into()),
        )
    }

    pub fn directive_format(raw: &str) -> Self {
        Self::new(
            CompileErrorKind::DirectiveFormat,
            format!(
                "repeater directive {raw:?} does not match \
                 'varName in scopePath' or 'varName in [value1, value2, ...]'"
            ),
        )
    }

    pub fn not_iterable(path: &str, got: &str) -> Self {
        Self::new(
            CompileErrorKind::NotIterable,
            format!("repeater source '{path}' is {got}, expected an array"),
        )
    }

    pub fn unresolved(path: &str, reason: &str) -> Self {
        Self::new(
            CompileErrorKind::UnresolvedPath,
            format!("cannot resolve '{path}': {reason}"),
        )
    }

    pub fn expression(source_text: &str, detail: impl std::fmt::Display) -> Self {
        Self::new(
            CompileErrorKind::Expression,
            format!("error evaluating '{{{{{source_text}}}}}': {detail}"),
        )
    }

    pub fn unknown_filter(name: &str) -> Self {
        Self::new(
            CompileErrorKind::UnknownFilter,
            format!("no filter registered under '{name}'"),
        )
    }

    pub fn io(context: &str, source: std::io::Error) -> Self {
        Self::new(CompileErrorKind::Io, format!("{context}: {source}")).with_source(source)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompileErrorKind {
    /// Malformed input markup. Always fatal; no partial output.
    Parse,
    /// A repeater directive that does not match the `var in source` grammar.
    DirectiveFormat,
    /// A repeater source that resolved to a non-sequence (strict mode only).
    NotIterable,
    /// A scope path that could not be resolved (strict mode only).
    UnresolvedPath,
    /// The expression evaluator rejected a substituted expression
    /// (strict mode only).
    Expression,
    /// A filter name with no registry entry (strict mode only).
    UnknownFilter,
    /// Reading input or writing output failed.
    Io,
}
