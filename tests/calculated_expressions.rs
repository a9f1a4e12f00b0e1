//! Calculated expression flows through a full session: dependency-ordered
//! recomputation, debounce draining, per-expression error isolation and
//! cycle exclusion.

mod common;

use std::sync::Arc;

use common::{ScriptedBackend, answer_values};
use pretty_assertions::assert_eq;
use sdc_forms::error::ExpressionError;
use sdc_forms::model::Coding;
use sdc_forms::{AnswerValue, DiagnosticCode, FormConfig, FormSession, Questionnaire};
use serde_json::{Value, json};

const VARIABLE_URL: &str = "http://hl7.org/fhir/StructureDefinition/variable";
const CALCULATED_URL: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression";

const PAIN_LEVEL_EXPR: &str = "item.where(linkId='pain-level').answer.value";
const PAIN_CLASS_EXPR: &str = "iif(%painLevel < 5,'Y','N')";

fn pain_questionnaire() -> Questionnaire {
    serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "url": "http://example.org/Questionnaire/pain",
        "status": "active",
        "extension": [{
            "url": VARIABLE_URL,
            "valueExpression": {
                "name": "painLevel",
                "language": "text/fhirpath",
                "expression": PAIN_LEVEL_EXPR
            }
        }],
        "item": [
            { "linkId": "pain-level", "type": "integer" },
            {
                "linkId": "pain-class",
                "type": "choice",
                "extension": [{
                    "url": CALCULATED_URL,
                    "valueExpression": { "language": "text/fhirpath", "expression": PAIN_CLASS_EXPR }
                }]
            }
        ]
    }))
    .unwrap()
}

fn pain_backend() -> ScriptedBackend {
    ScriptedBackend::new()
        .on(PAIN_LEVEL_EXPR, |ctx| Ok(answer_values(ctx.focus, "pain-level")))
        .on(PAIN_CLASS_EXPR, |ctx| {
            match ctx.variable("painLevel").and_then(Value::as_i64) {
                Some(level) => Ok(vec![json!(if level < 5 { "Y" } else { "N" })]),
                None => Ok(Vec::new()),
            }
        })
}

#[test]
fn pain_level_drives_the_coded_classification() {
    let mut session =
        FormSession::new(pain_questionnaire(), Arc::new(pain_backend()), FormConfig::default())
            .unwrap();

    session.set_answer("pain-level", &[], vec![AnswerValue::Integer(3)]).unwrap();
    session.flush();
    assert_eq!(
        session.answer("pain-class", &[]).unwrap(),
        &[AnswerValue::Coding(Coding::from_code("Y"))]
    );

    session.set_answer("pain-level", &[], vec![AnswerValue::Integer(7)]).unwrap();
    session.flush();
    assert_eq!(
        session.answer("pain-class", &[]).unwrap(),
        &[AnswerValue::Coding(Coding::from_code("N"))]
    );
}

#[test]
fn recomputation_is_idempotent_without_further_edits() {
    let mut session =
        FormSession::new(pain_questionnaire(), Arc::new(pain_backend()), FormConfig::default())
            .unwrap();

    session.set_answer("pain-level", &[], vec![AnswerValue::Integer(3)]).unwrap();
    session.flush();
    let before = session.response();

    // A launch context write forces a full re-evaluation pass.
    session.set_launch_context("nothing", json!(null));
    assert_eq!(session.response(), before);
}

#[test]
fn clearing_the_dependency_clears_the_computed_answer() {
    let mut session =
        FormSession::new(pain_questionnaire(), Arc::new(pain_backend()), FormConfig::default())
            .unwrap();

    session.set_answer("pain-level", &[], vec![AnswerValue::Integer(3)]).unwrap();
    session.flush();
    assert_eq!(session.answer("pain-class", &[]).unwrap().len(), 1);

    session.clear_answer("pain-level", &[]).unwrap();
    session.flush();
    assert!(session.answer("pain-class", &[]).unwrap().is_empty());
}

#[test]
fn user_writes_to_computed_items_are_dropped() {
    let mut session =
        FormSession::new(pain_questionnaire(), Arc::new(pain_backend()), FormConfig::default())
            .unwrap();

    let outcome = session
        .set_answer("pain-class", &[], vec![AnswerValue::Coding(Coding::from_code("X"))])
        .unwrap();
    assert_eq!(outcome, sdc_forms::WriteOutcome::DroppedComputed);
}

#[test]
fn free_text_edits_wait_for_their_debounce_deadline() {
    use std::time::{Duration, Instant};

    let mut session =
        FormSession::new(pain_questionnaire(), Arc::new(pain_backend()), FormConfig::default())
            .unwrap();

    session.set_answer("pain-level", &[], vec![AnswerValue::Integer(3)]).unwrap();
    assert!(session.has_pending_edits());

    // Not due yet: nothing recomputes.
    session.poll(Instant::now());
    assert!(session.answer("pain-class", &[]).unwrap().is_empty());

    // Past the window the coalesced edit drains into one recomputation.
    session.poll(Instant::now() + Duration::from_millis(400));
    assert!(!session.has_pending_edits());
    assert_eq!(
        session.answer("pain-class", &[]).unwrap(),
        &[AnswerValue::Coding(Coding::from_code("Y"))]
    );
}

#[test]
fn answer_expression_results_surface_as_candidate_options() {
    const ANSWER_EXPRESSION_URL: &str =
        "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerExpression";

    let questionnaire: Questionnaire = serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "extension": [{
            "url": VARIABLE_URL,
            "valueExpression": {
                "name": "units",
                "language": "text/fhirpath",
                "expression": "'kg' | 'lb'"
            }
        }],
        "item": [{
            "linkId": "weight-unit",
            "type": "choice",
            "extension": [{
                "url": ANSWER_EXPRESSION_URL,
                "valueExpression": { "language": "text/fhirpath", "expression": "%units" }
            }]
        }]
    }))
    .unwrap();

    let backend = ScriptedBackend::new()
        .on("'kg' | 'lb'", |_| Ok(vec![json!("kg"), json!("lb")]))
        .on("%units", |ctx| {
            Ok(ctx
                .variable("units")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default())
        });

    let session =
        FormSession::new(questionnaire, Arc::new(backend), FormConfig::default()).unwrap();
    assert_eq!(
        session.answer_options("weight-unit"),
        Some(&[json!("kg"), json!("lb")][..])
    );
}

#[test]
fn a_failing_expression_does_not_stop_the_others() {
    let questionnaire: Questionnaire = serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [
            { "linkId": "input", "type": "integer" },
            {
                "linkId": "doubled",
                "type": "integer",
                "extension": [{
                    "url": CALCULATED_URL,
                    "valueExpression": {
                        "language": "text/fhirpath",
                        "expression": "item.where(linkId='input').answer.value * 2"
                    }
                }]
            },
            {
                "linkId": "broken",
                "type": "integer",
                "extension": [{
                    "url": CALCULATED_URL,
                    "valueExpression": {
                        "language": "text/fhirpath",
                        "expression": "item.where(linkId='input').answer.value.explode()"
                    }
                }]
            }
        ]
    }))
    .unwrap();

    // Both expressions read the same input; only one of them works.
    let backend = ScriptedBackend::new()
        .on("item.where(linkId='input').answer.value * 2", |ctx| {
            let input = answer_values(ctx.focus, "input");
            Ok(input.iter().filter_map(Value::as_i64).map(|v| json!(v * 2)).collect())
        })
        .on("item.where(linkId='input').answer.value.explode()", |_| {
            Err(ExpressionError::Runtime { message: "boom".to_string() })
        });

    let mut session =
        FormSession::new(questionnaire, Arc::new(backend), FormConfig::default()).unwrap();
    session.set_answer("input", &[], vec![AnswerValue::Integer(4)]).unwrap();
    session.flush();

    assert_eq!(session.answer("doubled", &[]).unwrap(), &[AnswerValue::Integer(8)]);
    let errors: Vec<_> = session.expression_errors().collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, Some("broken"));
}

#[test]
fn runtime_failure_keeps_the_last_known_good_value() {
    let questionnaire: Questionnaire = serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [
            { "linkId": "input", "type": "integer" },
            {
                "linkId": "flaky",
                "type": "integer",
                "extension": [{
                    "url": CALCULATED_URL,
                    "valueExpression": {
                        "language": "text/fhirpath",
                        "expression": "item.where(linkId='input').answer.value * 10"
                    }
                }]
            }
        ]
    }))
    .unwrap();

    let backend = ScriptedBackend::new().on("item.where(linkId='input').answer.value * 10", |ctx| {
        match answer_values(ctx.focus, "input").first().and_then(Value::as_i64) {
            Some(v) if v <= 5 => Ok(vec![json!(v * 10)]),
            Some(_) => Err(ExpressionError::Runtime { message: "too large".to_string() }),
            None => Ok(Vec::new()),
        }
    });

    let mut session =
        FormSession::new(questionnaire, Arc::new(backend), FormConfig::default()).unwrap();

    session.set_answer("input", &[], vec![AnswerValue::Integer(3)]).unwrap();
    session.flush();
    assert_eq!(session.answer("flaky", &[]).unwrap(), &[AnswerValue::Integer(30)]);

    session.set_answer("input", &[], vec![AnswerValue::Integer(9)]).unwrap();
    session.flush();
    // The failed evaluation left the previous result in place.
    assert_eq!(session.answer("flaky", &[]).unwrap(), &[AnswerValue::Integer(30)]);
    assert_eq!(session.expression_errors().count(), 1);
}

#[test]
fn cyclic_expressions_are_excluded_but_the_rest_still_runs() {
    let questionnaire: Questionnaire = serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "extension": [
            {
                "url": VARIABLE_URL,
                "valueExpression": { "name": "a", "language": "text/fhirpath", "expression": "%b + 1" }
            },
            {
                "url": VARIABLE_URL,
                "valueExpression": { "name": "b", "language": "text/fhirpath", "expression": "%a + 1" }
            }
        ],
        "item": [
            { "linkId": "input", "type": "integer" },
            {
                "linkId": "echo",
                "type": "integer",
                "extension": [{
                    "url": CALCULATED_URL,
                    "valueExpression": {
                        "language": "text/fhirpath",
                        "expression": "item.where(linkId='input').answer.value"
                    }
                }]
            }
        ]
    }))
    .unwrap();

    let backend = ScriptedBackend::new().on("item.where(linkId='input').answer.value", |ctx| {
        Ok(answer_values(ctx.focus, "input"))
    });

    let mut session =
        FormSession::new(questionnaire, Arc::new(backend), FormConfig::default()).unwrap();

    // Reported once as a structural diagnostic, not per pass.
    let cycles: Vec<_> = session
        .diagnostics()
        .iter()
        .filter(|d| d.code == DiagnosticCode::DependencyCycle)
        .collect();
    assert_eq!(cycles.len(), 1);

    session.set_answer("input", &[], vec![AnswerValue::Integer(5)]).unwrap();
    session.flush();
    assert_eq!(session.answer("echo", &[]).unwrap(), &[AnswerValue::Integer(5)]);
    assert_eq!(
        session
            .diagnostics()
            .iter()
            .filter(|d| d.code == DiagnosticCode::DependencyCycle)
            .count(),
        1
    );
}
