//! User-facing diagnostics for the property compiler.
//!
//! Two failure regimes coexist. User mistakes (bad expression, type
//! mismatch, inconsistent override, ...) become [`Diagnostic`]s collected
//! into a [`DiagSink`] so that a whole compilation reports as many problems
//! as it can in one run. Framework bugs (double render, orphaned slot,
//! mutation of a frozen tree) are `panic!`s and never surface as ordinary
//! diagnostics.

use std::fmt;

use fable_common::Span;
use serde::Serialize;

/// The category of a user diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagKind {
    /// A host value or expression form that cannot be turned into an
    /// expression node, or a reference to something that does not exist.
    InvalidExpression,
    /// An expression's resolved type is not acceptable where it appears.
    TypeMismatch,
    /// An overriding property disagrees with its base on arguments,
    /// dynamic variables or another part of its signature.
    InconsistentOverride,
    /// A dynamic variable is referenced or implicitly required while no
    /// binding for it is in scope.
    UnboundDynamicVariable,
    /// An abstract property is not overridden by one or more concrete node
    /// subtypes. Reported once per abstract property, naming all of them.
    MissingOverride,
    /// A property's return type inference depends on itself.
    RecursiveTypeInference,
    /// Warning: a binding (local or dynamic-variable) is never used.
    UnusedBinding,
}

impl DiagKind {
    pub fn severity(self) -> Severity {
        match self {
            DiagKind::UnusedBinding => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

impl fmt::Display for DiagKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiagKind::InvalidExpression => "invalid expression",
            DiagKind::TypeMismatch => "type mismatch",
            DiagKind::InconsistentOverride => "inconsistent override",
            DiagKind::UnboundDynamicVariable => "unbound dynamic variable",
            DiagKind::MissingOverride => "missing override",
            DiagKind::RecursiveTypeInference => "recursive type inference",
            DiagKind::UnusedBinding => "unused binding",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Error,
    Warning,
}

/// One reported problem, with a source location and optional notes.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagKind,
    pub severity: Severity,
    pub message: String,
    pub span: Span,
    pub notes: Vec<String>,
}

impl Diagnostic {
    pub fn new(kind: DiagKind, span: Span, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message: message.into(),
            span,
            notes: Vec::new(),
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        for note in &self.notes {
            write!(f, "\n  note: {note}")?;
        }
        Ok(())
    }
}

/// Marker that a diagnostic was emitted and the current property's
/// construction must stop. The diagnostic itself is already in the sink;
/// callers propagate this with `?` and the driver moves on to the next
/// property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aborted;

pub type CResult<T> = Result<T, Aborted>;

/// Which warning categories are enabled for a compilation.
#[derive(Debug, Clone, Copy)]
pub struct Warnings {
    pub unused_bindings: bool,
    pub unused_dynvar_bindings: bool,
}

impl Default for Warnings {
    fn default() -> Self {
        Self {
            unused_bindings: true,
            unused_dynvar_bindings: true,
        }
    }
}

/// Batch collector of diagnostics for one compilation.
#[derive(Debug, Default)]
pub struct DiagSink {
    diags: Vec<Diagnostic>,
}

impl DiagSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn emit(&mut self, diag: Diagnostic) {
        self.diags.push(diag);
    }

    /// Emit an error diagnostic and return the abort marker for `?`.
    pub fn fatal(&mut self, kind: DiagKind, span: Span, message: impl Into<String>) -> Aborted {
        self.emit(Diagnostic::new(kind, span, message));
        Aborted
    }

    pub fn warn(&mut self, kind: DiagKind, span: Span, message: impl Into<String>) {
        debug_assert_eq!(kind.severity(), Severity::Warning);
        self.emit(Diagnostic::new(kind, span, message));
    }

    pub fn has_errors(&self) -> bool {
        self.diags.iter().any(Diagnostic::is_error)
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diags
    }

    pub fn take(&mut self) -> Vec<Diagnostic> {
        std::mem::take(&mut self.diags)
    }
}
