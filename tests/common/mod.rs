//! Shared test support: a scripted expression backend keyed by expression
//! text and a canned resource fetcher, so engine plumbing can be tested
//! deterministically without a real fhirpath interpreter or server.
#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use sdc_forms::error::{ExpressionError, FetchError};
use sdc_forms::eval::{EvalContext, ExpressionBackend};
use sdc_forms::populate::{RequestConfig, ResourceFetcher};
use serde_json::Value;

type Rule = Box<dyn Fn(&EvalContext<'_>) -> Result<Vec<Value>, ExpressionError> + Send + Sync>;

/// Backend that maps known expression strings to closures over the
/// evaluation context; unknown expressions fail like a syntax error.
#[derive(Default)]
pub struct ScriptedBackend {
    rules: HashMap<String, Rule>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(
        mut self,
        expression: &str,
        rule: impl Fn(&EvalContext<'_>) -> Result<Vec<Value>, ExpressionError> + Send + Sync + 'static,
    ) -> Self {
        self.rules.insert(expression.to_string(), Box::new(rule));
        self
    }

    /// Expression that always produces one constant value
    #[allow(dead_code)]
    pub fn value(self, expression: &str, value: Value) -> Self {
        self.on(expression, move |_| Ok(vec![value.clone()]))
    }
}

impl ExpressionBackend for ScriptedBackend {
    fn evaluate(
        &self,
        expression: &str,
        context: &EvalContext<'_>,
    ) -> Result<Vec<Value>, ExpressionError> {
        match self.rules.get(expression) {
            Some(rule) => rule(context),
            None => Err(ExpressionError::Syntax {
                message: format!("no script registered for '{expression}'"),
            }),
        }
    }
}

/// Fetcher serving canned responses by exact query string
#[derive(Default)]
pub struct StaticFetcher {
    responses: HashMap<String, Value>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, query: &str, response: Value) -> Self {
        self.responses.insert(query.to_string(), response);
        self
    }
}

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(&self, query: &str, _config: &RequestConfig) -> Result<Value, FetchError> {
        self.responses.get(query).cloned().ok_or_else(|| FetchError {
            query: query.to_string(),
            message: "no canned response".to_string(),
        })
    }
}

/// Pull the `answer[].value*` json values of one item out of a response
/// snapshot, searching the item tree recursively.
#[allow(dead_code)]
pub fn answer_values(resource: &Value, link_id: &str) -> Vec<Value> {
    fn walk(items: &[Value], link_id: &str, found: &mut Vec<Value>) {
        for item in items {
            if item.get("linkId").and_then(Value::as_str) == Some(link_id) {
                if let Some(answers) = item.get("answer").and_then(Value::as_array) {
                    for answer in answers {
                        if let Some(map) = answer.as_object() {
                            for (key, value) in map {
                                if key.starts_with("value") {
                                    found.push(value.clone());
                                }
                            }
                        }
                    }
                }
            }
            if let Some(children) = item.get("item").and_then(Value::as_array) {
                walk(children, link_id, found);
            }
        }
    }

    let mut found = Vec::new();
    if let Some(items) = resource.get("item").and_then(Value::as_array) {
        walk(items, link_id, &mut found);
    }
    found
}
