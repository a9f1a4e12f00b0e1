//! Session diagnostics
//!
//! Structural problems (dependency cycles) are reported once per build.
//! Per-expression failures are kept as the latest occurrence per item so a
//! renderer can show them without flooding on every keystroke.

use serde::Serialize;

/// How severe a diagnostic is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    /// The affected feature is permanently out of action for this session
    Error,
    /// The affected item degraded gracefully (e.g. left editable)
    Warning,
    /// Informational only
    Information,
}

/// Machine-readable diagnostic category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticCode {
    /// Expressions formed a cycle and were excluded for the session
    DependencyCycle,
    /// An expression failed to parse
    ExpressionSyntax,
    /// An expression failed at evaluation time
    ExpressionRuntime,
    /// A population fetch failed
    PopulationFetch,
    /// Population completed with some items unfilled
    PopulationPartial,
}

/// One diagnostic record attached to the session
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    /// Severity of the problem
    pub severity: Severity,
    /// Category for machine consumption
    pub code: DiagnosticCode,
    /// Human-readable description
    pub message: String,
    /// Owning item, when the problem is attributable to one
    pub link_id: Option<String>,
}

impl Diagnostic {
    /// Structural cycle diagnostic, reported once per session
    pub fn cycle(members: &[String]) -> Self {
        Self {
            severity: Severity::Error,
            code: DiagnosticCode::DependencyCycle,
            message: format!(
                "expressions excluded from evaluation due to a dependency cycle: {}",
                members.join(" -> ")
            ),
            link_id: None,
        }
    }

    /// Per-item expression failure, silent to the end user
    pub fn expression(link_id: &str, syntax: bool, message: String) -> Self {
        Self {
            severity: Severity::Warning,
            code: if syntax {
                DiagnosticCode::ExpressionSyntax
            } else {
                DiagnosticCode::ExpressionRuntime
            },
            message,
            link_id: Some(link_id.to_string()),
        }
    }
}
