//! Error types for questionnaire form sessions
//!
//! Expression failures are deliberately split off from structural errors:
//! a single broken expression is caught, recorded against its owning item
//! and must never abort the evaluation of unrelated expressions.

use thiserror::Error;

/// Result type alias for form engine operations
pub type Result<T> = std::result::Result<T, FormError>;

/// Errors raised by a single expression evaluation.
///
/// These are values, not control flow: the session records the latest one
/// per binding and keeps the item's last-known-good state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    /// The expression text could not be parsed by the backend
    #[error("syntax error in expression: {message}")]
    Syntax {
        /// Backend-reported parse failure
        message: String,
    },

    /// The expression parsed but failed during evaluation
    #[error("evaluation failed: {message}")]
    Runtime {
        /// Backend-reported evaluation failure
        message: String,
    },

    /// The expression references a `%name` that is not in scope
    #[error("unresolved name '%{name}'")]
    UnresolvedName {
        /// The environment variable name that could not be resolved
        name: String,
    },

    /// An enablement expression produced something other than a single boolean
    #[error("expected a single boolean result, got {actual}")]
    NotABoolean {
        /// Short description of the offending result
        actual: String,
    },

    /// The result could not be converted to the owning item's answer type
    #[error("result is not assignable to a '{item_type}' item: {message}")]
    TypeMismatch {
        /// Item type code of the owning item
        item_type: String,
        /// What went wrong during conversion
        message: String,
    },
}

/// Error raised by the injected resource fetch callback.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("resource fetch failed for '{query}': {message}")]
pub struct FetchError {
    /// The query string handed to the callback
    pub query: String,
    /// Transport- or server-side failure description
    pub message: String,
}

/// Top-level error type for form engine operations
#[derive(Error, Debug)]
pub enum FormError {
    /// A linkId was requested that the loaded definition does not contain
    #[error("unknown linkId '{link_id}'")]
    UnknownLinkId {
        /// The offending linkId
        link_id: String,
    },

    /// Instance operations are only valid on repeating items
    #[error("item '{link_id}' does not repeat")]
    NotRepeating {
        /// The offending linkId
        link_id: String,
    },

    /// A repeat instance index was out of range
    #[error("no repeat instance {index} for '{link_id}'")]
    NoSuchInstance {
        /// Repeating group linkId
        link_id: String,
        /// The out-of-range positional index
        index: usize,
    },

    /// A per-expression failure surfaced through a fallible API
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Expressions form a dependency cycle and were excluded from evaluation
    #[error("dependency cycle: {}", members.join(" -> "))]
    DependencyCycle {
        /// Human-readable names of the participating bindings
        members: Vec<String>,
    },

    /// A population fetch failed outright
    #[error(transparent)]
    PopulationFetch(#[from] FetchError),

    /// The questionnaire definition is structurally unusable
    #[error("invalid definition: {message}")]
    InvalidDefinition {
        /// What made the definition unusable
        message: String,
    },

    /// Resource (de)serialization failure
    #[error("resource error: {0}")]
    Resource(#[from] serde_json::Error),
}
