//! Ariadne-based rendering for property compilation diagnostics.
//!
//! Renders [`Diagnostic`] values into formatted, labeled messages using
//! the ariadne library. Output is colorless so the rendered text is
//! stable across terminals and in tests. Each diagnostic carries a code,
//! its message as the primary label, and one help line per attached note.

use std::ops::Range;

use ariadne::{Color, Config, Label, Report, ReportKind, Source};
use fable_common::LineIndex;

use crate::error::{DiagKind, Diagnostic, Severity};

// ── Error Codes ────────────────────────────────────────────────────────

/// Assign a unique code to each diagnostic kind.
fn error_code(kind: DiagKind) -> &'static str {
    match kind {
        DiagKind::InvalidExpression => "E0001",
        DiagKind::TypeMismatch => "E0002",
        DiagKind::InconsistentOverride => "E0003",
        DiagKind::UnboundDynamicVariable => "E0004",
        DiagKind::MissingOverride => "E0005",
        DiagKind::RecursiveTypeInference => "E0006",
        DiagKind::UnusedBinding => "W0001",
    }
}

// ── Main Rendering Function ────────────────────────────────────────────

/// Render a diagnostic into a formatted string using ariadne.
pub fn render_diagnostic(diag: &Diagnostic, source: &str, _filename: &str) -> String {
    let config = Config::default().with_color(false);
    let source_len = source.len();

    // Clamp a range to be valid within source bounds. Ariadne needs at
    // least a one-character span.
    let clamp = |r: Range<usize>| -> Range<usize> {
        let s = r.start.min(source_len);
        let e = r.end.min(source_len).max(s);
        if s == e {
            s..e.saturating_add(1).min(source_len)
        } else {
            s..e
        }
    };

    let code = error_code(diag.kind);
    let kind = match diag.severity {
        Severity::Error => ReportKind::Error,
        Severity::Warning => ReportKind::Warning,
    };
    let color = match diag.severity {
        Severity::Error => Color::Red,
        Severity::Warning => Color::Yellow,
    };
    let span = clamp(diag.span.start as usize..diag.span.end as usize);

    let mut builder = Report::build(kind, span.clone())
        .with_code(code)
        .with_message(&diag.message)
        .with_config(config)
        .with_label(
            Label::new(span)
                .with_message(&diag.message)
                .with_color(color),
        );
    for note in &diag.notes {
        builder.set_help(note);
    }
    let report = builder.finish();

    // Render to buffer without colors.
    let mut buf = Vec::new();
    let cache = Source::from(source);
    report.write(cache, &mut buf).expect("failed to write diagnostic");
    String::from_utf8(buf).expect("diagnostic output should be valid UTF-8")
}

/// Render every collected diagnostic, in emission order.
pub fn render_all(diags: &[Diagnostic], source: &str, filename: &str) -> String {
    diags
        .iter()
        .map(|d| render_diagnostic(d, source, filename))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Machine-readable form of the collected diagnostics, for tooling that
/// consumes them instead of printing them. Spans are reported both as
/// byte offsets and as 1-based line/column positions in `source`.
pub fn diagnostics_json(diags: &[Diagnostic], source: &str) -> String {
    let index = LineIndex::new(source);
    let entries: Vec<_> = diags
        .iter()
        .map(|d| {
            let (line, col) = index.line_col(d.span.start);
            serde_json::json!({
                "code": error_code(d.kind),
                "kind": d.kind,
                "severity": d.severity,
                "span": d.span,
                "line": line,
                "col": col,
                "message": d.message,
                "notes": d.notes,
            })
        })
        .collect();
    serde_json::to_string_pretty(&entries).unwrap_or_else(|_| "[]".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fable_common::Span;

    #[test]
    fn renders_code_and_message() {
        let src = "node.parent.depth";
        let diag = Diagnostic::new(
            DiagKind::TypeMismatch,
            Span::new(5, 11),
            "expected Int, got Bool",
        );
        let out = render_diagnostic(&diag, src, "props.dsl");
        assert!(out.contains("E0002"));
        assert!(out.contains("expected Int, got Bool"));
    }

    #[test]
    fn warnings_render_as_warnings() {
        let src = "bind env = x in y";
        let diag = Diagnostic::new(
            DiagKind::UnusedBinding,
            Span::new(0, 4),
            "useless bind of dynamic variable env",
        );
        let out = render_diagnostic(&diag, src, "props.dsl");
        assert!(out.contains("W0001"));
        assert!(out.contains("Warning"));
    }

    #[test]
    fn out_of_range_span_is_clamped() {
        let src = "x";
        let diag = Diagnostic::new(
            DiagKind::InvalidExpression,
            Span::new(40, 80),
            "value cannot be used as an expression",
        );
        let out = render_diagnostic(&diag, src, "props.dsl");
        assert!(out.contains("E0001"));
    }

    #[test]
    fn json_dump_carries_kind_and_position() {
        let src = "node.parent\n  .depth";
        let diag = Diagnostic::new(
            DiagKind::TypeMismatch,
            Span::new(15, 20),
            "expected Int, got Bool",
        );
        let out = diagnostics_json(&[diag], src);
        assert!(out.contains("TypeMismatch"));
        assert!(out.contains("expected Int, got Bool"));
        // offset 15 is column 4 of the second line
        assert!(out.contains("\"line\": 2"));
        assert!(out.contains("\"col\": 4"));
    }

    #[test]
    fn notes_become_help_lines() {
        let src = "try x";
        let diag = Diagnostic::new(
            DiagKind::TypeMismatch,
            Span::new(0, 5),
            "no fallback for a non-nullable type",
        )
        .with_note("add an explicit fallback expression");
        let out = render_diagnostic(&diag, src, "props.dsl");
        assert!(out.contains("add an explicit fallback expression"));
    }
}
