//! Expression evaluation adapter
//!
//! The fhirpath interpreter itself lives behind [`ExpressionBackend`]: a
//! pure function from expression text plus context to values. The adapter
//! owns nothing mutable and never writes to the answer store; callers
//! decide how to apply a result. Failures are caught per expression so one
//! broken binding cannot take down the rest of a pass.

use std::fmt;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::error::ExpressionError;

/// Everything an expression may read: the focus resource, resolved
/// variables, and external launch context.
pub struct EvalContext<'a> {
    /// Focus resource (`%resource`): the current response view, or one
    /// repeat instance's subtree for instance-scoped expressions
    pub focus: &'a Value,
    /// Variables resolved earlier in the same pass, by name
    pub variables: &'a FxHashMap<String, Value>,
    /// Launch context and population context resources, by name
    pub launch: &'a FxHashMap<String, Value>,
}

impl<'a> EvalContext<'a> {
    /// Resolve a `%name` reference: pass-local variables shadow launch
    /// context entries of the same name.
    pub fn variable(&self, name: &str) -> Option<&Value> {
        match name {
            "resource" | "context" => Some(self.focus),
            _ => self.variables.get(name).or_else(|| self.launch.get(name)),
        }
    }
}

impl fmt::Debug for EvalContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvalContext")
            .field("variables", &self.variables.keys().collect::<Vec<_>>())
            .field("launch", &self.launch.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// The injected expression-language interpreter.
///
/// Implementations must be side-effect free: same expression and context,
/// same result collection.
pub trait ExpressionBackend: Send + Sync {
    /// Evaluate an expression, returning the result collection
    fn evaluate(&self, expression: &str, context: &EvalContext<'_>)
    -> Result<Vec<Value>, ExpressionError>;
}

/// Stateless wrapper over the backend with the result-shaping helpers the
/// engine needs.
#[derive(Clone)]
pub struct Evaluator {
    backend: Arc<dyn ExpressionBackend>,
}

impl Evaluator {
    /// Wrap an interpreter
    pub fn new(backend: Arc<dyn ExpressionBackend>) -> Self {
        Self { backend }
    }

    /// Evaluate to the raw result collection
    pub fn evaluate(
        &self,
        expression: &str,
        context: &EvalContext<'_>,
    ) -> Result<Vec<Value>, ExpressionError> {
        self.backend.evaluate(expression, context)
    }

    /// Evaluate to at most one value (`None` for an empty collection)
    pub fn evaluate_single(
        &self,
        expression: &str,
        context: &EvalContext<'_>,
    ) -> Result<Option<Value>, ExpressionError> {
        Ok(self.backend.evaluate(expression, context)?.into_iter().next())
    }

    /// Evaluate an enablement condition: the result must coerce to a
    /// single strict boolean.
    pub fn evaluate_bool(
        &self,
        expression: &str,
        context: &EvalContext<'_>,
    ) -> Result<bool, ExpressionError> {
        let values = self.backend.evaluate(expression, context)?;
        match values.as_slice() {
            [Value::Bool(b)] => Ok(*b),
            [] => Ok(false),
            [other] => Err(ExpressionError::NotABoolean { actual: short_type_name(other) }),
            _ => Err(ExpressionError::NotABoolean {
                actual: format!("a collection of {}", values.len()),
            }),
        }
    }
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Evaluator")
    }
}

fn short_type_name(value: &Value) -> String {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixed(Vec<Value>);

    impl ExpressionBackend for Fixed {
        fn evaluate(
            &self,
            _expression: &str,
            _context: &EvalContext<'_>,
        ) -> Result<Vec<Value>, ExpressionError> {
            Ok(self.0.clone())
        }
    }

    fn context_fixture<'a>(
        focus: &'a Value,
        variables: &'a FxHashMap<String, Value>,
        launch: &'a FxHashMap<String, Value>,
    ) -> EvalContext<'a> {
        EvalContext { focus, variables, launch }
    }

    #[test]
    fn strict_bool_rejects_non_boolean_results() {
        let evaluator = Evaluator::new(Arc::new(Fixed(vec![json!(42)])));
        let focus = json!({});
        let vars = FxHashMap::default();
        let launch = FxHashMap::default();
        let err = evaluator
            .evaluate_bool("anything", &context_fixture(&focus, &vars, &launch))
            .unwrap_err();
        assert_eq!(err, ExpressionError::NotABoolean { actual: "a number".to_string() });
    }

    #[test]
    fn empty_result_coerces_to_false() {
        let evaluator = Evaluator::new(Arc::new(Fixed(Vec::new())));
        let focus = json!({});
        let vars = FxHashMap::default();
        let launch = FxHashMap::default();
        assert!(
            !evaluator
                .evaluate_bool("anything", &context_fixture(&focus, &vars, &launch))
                .unwrap()
        );
    }

    #[test]
    fn pass_variables_shadow_launch_entries() {
        let focus = json!({});
        let mut vars = FxHashMap::default();
        vars.insert("who".to_string(), json!("variable"));
        let mut launch = FxHashMap::default();
        launch.insert("who".to_string(), json!("launch"));

        let context = context_fixture(&focus, &vars, &launch);
        assert_eq!(context.variable("who"), Some(&json!("variable")));
        assert_eq!(context.variable("resource"), Some(&focus));
    }
}
