//! Diagnostic reporting infrastructure.
//!
//! This module provides error reporting with source locations,
//! suggestions, and pretty-printed output.
//!
//! # Error Codes
//!
//! Tarn compiler error codes are organized by category:
//!
//! - **E0400-E0499**: Effect/handler errors raised by the effects analysis
//!   and the EIR builder
//! - **CG0001-CG0099**: Backend errors raised while materializing a module
//! - **ICE0000**: Internal compiler errors (invariant violations)

use crate::span::Span;
use ariadne::{Color, Config, Label, Report, ReportKind, Source};

/// Compiler error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // ============================================================
    // Effect errors (E0400-E0499)
    // ============================================================
    /// A function performs an effect its declared row does not list.
    UndeclaredEffect = 400,
    /// A perform does not match any operation signature in scope.
    NoMatchingOperation = 401,
    /// A tail continuation is invoked outside tail position.
    TailResumeNotInTailPosition = 402,
    /// A handler does not provide a clause for every operation.
    MissingHandlerClause = 404,
    /// An exported function has generic parameters.
    GenericExport = 406,

    // ============================================================
    // Backend errors (CG0001-CG0099)
    // ============================================================
    /// A payload type cannot cross the host boundary.
    UnsupportedHostType = 1,

    // ============================================================
    // Internal compiler errors
    // ============================================================
    /// Internal invariant violation.
    Internal = 0,
}

impl ErrorCode {
    /// Get the formatted error code string (e.g., "E0401" or "CG0001").
    pub fn as_str(&self) -> String {
        match self {
            ErrorCode::UnsupportedHostType => format!("CG{:04}", *self as u16),
            ErrorCode::Internal => "ICE0000".to_string(),
            _ => format!("E{:04}", *self as u16),
        }
    }

    /// Get a human-readable description of the error.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorCode::UndeclaredEffect => "effect not declared in function signature",
            ErrorCode::NoMatchingOperation => "no matching effect operation signature in scope",
            ErrorCode::TailResumeNotInTailPosition => "tail continuation invoked outside tail position",
            ErrorCode::MissingHandlerClause => "handler is missing an operation clause",
            ErrorCode::GenericExport => "exported functions cannot be generic",
            ErrorCode::UnsupportedHostType => "unsupported type at the host boundary",
            ErrorCode::Internal => "internal compiler error",
        }
    }

    /// Get a help message suggesting how to fix the error.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            ErrorCode::UndeclaredEffect => {
                Some("add the effect to the function's effect row, or handle it inside the body")
            }
            ErrorCode::TailResumeNotInTailPosition => {
                Some("a `tail` operation's continuation must be the last thing its clause does")
            }
            ErrorCode::UnsupportedHostType => {
                Some("only `()`, `i32` and `u32` cross the host boundary; declare a serializer for richer types")
            }
            _ => None,
        }
    }
}

/// The kind of diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticKind {
    /// An error that prevents compilation.
    Error,
    /// A warning that doesn't prevent compilation.
    Warning,
    /// An informational note.
    Note,
}

impl DiagnosticKind {
    fn to_report_kind(self) -> ReportKind<'static> {
        match self {
            DiagnosticKind::Error => ReportKind::Error,
            DiagnosticKind::Warning => ReportKind::Warning,
            DiagnosticKind::Note => ReportKind::Advice,
        }
    }

    fn color(self) -> Color {
        match self {
            DiagnosticKind::Error => Color::Red,
            DiagnosticKind::Warning => Color::Yellow,
            DiagnosticKind::Note => Color::Cyan,
        }
    }
}

/// A compiler diagnostic.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    /// The kind of diagnostic.
    pub kind: DiagnosticKind,
    /// The error code (e.g., "E0401").
    pub code: Option<String>,
    /// The main error message.
    pub message: String,
    /// The primary span where the error occurred.
    pub span: Span,
    /// Additional labels pointing to relevant code.
    pub labels: Vec<DiagnosticLabel>,
    /// Suggestions for fixing the error.
    pub suggestions: Vec<String>,
}

impl Diagnostic {
    /// Create a new error diagnostic.
    pub fn error(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Error,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create a new warning diagnostic.
    pub fn warning(message: impl Into<String>, span: Span) -> Self {
        Self {
            kind: DiagnosticKind::Warning,
            code: None,
            message: message.into(),
            span,
            labels: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    /// Create an internal compiler error.
    ///
    /// ICEs mark invariant violations inside the compiler, never user errors.
    pub fn ice(message: impl Into<String>, span: Span) -> Self {
        Self::error(format!("internal compiler error: {}", message.into()), span)
            .with_error_code(ErrorCode::Internal)
    }

    /// Set the error code from a string.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Set the error code from an ErrorCode enum.
    /// Automatically adds the help message if available.
    pub fn with_error_code(mut self, code: ErrorCode) -> Self {
        self.code = Some(code.as_str());
        if let Some(help) = code.help() {
            self.suggestions.push(help.to_string());
        }
        self
    }

    /// Create an error diagnostic from an ErrorCode with automatic message and help.
    pub fn from_error_code(code: ErrorCode, span: Span) -> Self {
        Self::error(code.description(), span).with_error_code(code)
    }

    /// Whether this diagnostic aborts compilation.
    pub fn is_error(&self) -> bool {
        self.kind == DiagnosticKind::Error
    }

    /// Whether this diagnostic carries the given error code.
    pub fn has_code(&self, code: ErrorCode) -> bool {
        self.code.as_deref() == Some(code.as_str().as_str())
    }

    /// Add a note to help explain the error.
    pub fn with_note(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::secondary(span, message));
        self
    }

    /// Add a primary label with a custom message.
    pub fn with_primary_label(mut self, span: Span, message: impl Into<String>) -> Self {
        self.labels.push(DiagnosticLabel::primary(span, message));
        self
    }

    /// Add a suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestions.push(suggestion.into());
        self
    }
}

impl std::fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "[{}] {}", code, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}

/// A secondary label in a diagnostic.
#[derive(Debug, Clone)]
pub struct DiagnosticLabel {
    /// The span this label points to.
    pub span: Span,
    /// The label message.
    pub message: String,
    /// Whether this is the primary label.
    pub primary: bool,
}

impl DiagnosticLabel {
    pub fn primary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: true,
        }
    }

    pub fn secondary(span: Span, message: impl Into<String>) -> Self {
        Self {
            span,
            message: message.into(),
            primary: false,
        }
    }
}

/// Diagnostic emitter that renders diagnostics against their source text.
pub struct DiagnosticEmitter<'a> {
    filename: &'a str,
    source: &'a str,
}

impl<'a> DiagnosticEmitter<'a> {
    pub fn new(filename: &'a str, source: &'a str) -> Self {
        Self { filename, source }
    }

    fn report(
        &self,
        diagnostic: &Diagnostic,
        color: bool,
    ) -> Report<'a, (&'a str, std::ops::Range<usize>)> {
        let mut builder = Report::build(
            diagnostic.kind.to_report_kind(),
            self.filename,
            diagnostic.span.start,
        )
        .with_config(Config::default().with_color(color));

        builder = builder.with_message(diagnostic.to_string());

        builder = builder.with_label(
            Label::new((self.filename, diagnostic.span.start..diagnostic.span.end))
                .with_color(diagnostic.kind.color())
                .with_message(&diagnostic.message),
        );

        for label in &diagnostic.labels {
            let color = if label.primary {
                diagnostic.kind.color()
            } else {
                Color::Blue
            };
            builder = builder.with_label(
                Label::new((self.filename, label.span.start..label.span.end))
                    .with_color(color)
                    .with_message(&label.message),
            );
        }

        if !diagnostic.suggestions.is_empty() {
            builder = builder.with_help(diagnostic.suggestions.join("\n"));
        }

        builder.finish()
    }

    /// Emit a diagnostic to stderr.
    pub fn emit(&self, diagnostic: &Diagnostic) -> std::io::Result<()> {
        self.report(diagnostic, true)
            .eprint((self.filename, Source::from(self.source)))
    }

    /// Render a diagnostic into a string without colors.
    pub fn render(&self, diagnostic: &Diagnostic) -> std::io::Result<String> {
        let mut out = Vec::new();
        self.report(diagnostic, false)
            .write((self.filename, Source::from(self.source)), &mut out)?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }
}
