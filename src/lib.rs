//! Expression and enablement engine for FHIR SDC questionnaires
//!
//! A reactive core for structured data capture forms: it extracts the
//! expressions a questionnaire declares, resolves their dependencies into
//! a cycle-safe evaluation order, evaluates them against a mutable answer
//! tree, derives which items are active, and seeds answers from external
//! clinical records. Rendering, theming and the fhirpath interpreter
//! itself are external collaborators.

pub mod config;
pub mod diagnostics;
pub mod enablement;
pub mod error;
pub mod eval;
pub mod graph;
pub mod model;
pub mod populate;
pub mod registry;
pub mod repeats;
pub mod session;
pub mod store;

// Re-export main types
pub use config::{FormConfig, RetentionPolicy};
pub use diagnostics::{Diagnostic, DiagnosticCode, Severity};
pub use error::{ExpressionError, FetchError, FormError, Result};
pub use eval::{EvalContext, Evaluator, ExpressionBackend};
pub use model::{
    AnswerValue, Coding, ItemType, Quantity, Questionnaire, QuestionnaireResponse, Reference,
};
pub use populate::{
    LaunchContext, PopulationIssue, PopulationOutcome, PopulationStatus, RepopulateContext,
    RepopulateRequest, RequestConfig, ResourceFetcher, fetch_repopulate,
};
pub use session::FormSession;
pub use store::{AnswerStore, StoreEvent, WriteOutcome, WriteSource};
