//! Per-instance expression scopes: each instance of a repeating group
//! evaluates against its own subtree, and adding or removing one instance
//! never disturbs the computed values of the others.

mod common;

use std::sync::Arc;

use common::{ScriptedBackend, answer_values};
use pretty_assertions::assert_eq;
use sdc_forms::{AnswerValue, FormConfig, FormSession, Questionnaire};
use serde_json::{Value, json};

const CALCULATED_URL: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression";

const DOUBLED_EXPR: &str = "item.where(linkId='dose').answer.value * 2";

fn meds_questionnaire() -> Questionnaire {
    serde_json::from_value(json!({
        "resourceType": "Questionnaire",
        "status": "active",
        "item": [{
            "linkId": "meds",
            "type": "group",
            "repeats": true,
            "item": [
                { "linkId": "dose", "type": "integer" },
                {
                    "linkId": "dose-doubled",
                    "type": "integer",
                    "extension": [{
                        "url": CALCULATED_URL,
                        "valueExpression": { "language": "text/fhirpath", "expression": DOUBLED_EXPR }
                    }]
                }
            ]
        }]
    }))
    .unwrap()
}

fn doubling_backend() -> ScriptedBackend {
    // The focus handed to a scoped expression is its own instance subtree,
    // so reading 'dose' can only see the sibling answer.
    ScriptedBackend::new().on(DOUBLED_EXPR, |ctx| {
        Ok(answer_values(ctx.focus, "dose")
            .iter()
            .filter_map(Value::as_i64)
            .map(|v| json!(v * 2))
            .collect())
    })
}

#[test]
fn instances_compute_independently() {
    let mut session = FormSession::new(
        meds_questionnaire(),
        Arc::new(doubling_backend()),
        FormConfig::default(),
    )
    .unwrap();

    session.add_repeat_instance("meds").unwrap();
    session.set_answer("dose", &[0], vec![AnswerValue::Integer(3)]).unwrap();
    session.set_answer("dose", &[1], vec![AnswerValue::Integer(5)]).unwrap();
    session.flush();

    assert_eq!(session.answer("dose-doubled", &[0]).unwrap(), &[AnswerValue::Integer(6)]);
    assert_eq!(session.answer("dose-doubled", &[1]).unwrap(), &[AnswerValue::Integer(10)]);
}

#[test]
fn editing_one_instance_does_not_touch_the_other() {
    let mut session = FormSession::new(
        meds_questionnaire(),
        Arc::new(doubling_backend()),
        FormConfig::default(),
    )
    .unwrap();

    session.add_repeat_instance("meds").unwrap();
    session.set_answer("dose", &[0], vec![AnswerValue::Integer(3)]).unwrap();
    session.set_answer("dose", &[1], vec![AnswerValue::Integer(5)]).unwrap();
    session.flush();

    session.set_answer("dose", &[1], vec![AnswerValue::Integer(7)]).unwrap();
    session.flush();

    assert_eq!(session.answer("dose-doubled", &[0]).unwrap(), &[AnswerValue::Integer(6)]);
    assert_eq!(session.answer("dose-doubled", &[1]).unwrap(), &[AnswerValue::Integer(14)]);
}

#[test]
fn adding_an_instance_leaves_existing_values_alone() {
    let mut session = FormSession::new(
        meds_questionnaire(),
        Arc::new(doubling_backend()),
        FormConfig::default(),
    )
    .unwrap();

    session.add_repeat_instance("meds").unwrap();
    session.set_answer("dose", &[0], vec![AnswerValue::Integer(3)]).unwrap();
    session.set_answer("dose", &[1], vec![AnswerValue::Integer(5)]).unwrap();
    session.flush();

    let index = session.add_repeat_instance("meds").unwrap();
    assert_eq!(index, 2);
    assert_eq!(session.store().instance_count("meds"), 3);

    assert_eq!(session.answer("dose-doubled", &[0]).unwrap(), &[AnswerValue::Integer(6)]);
    assert_eq!(session.answer("dose-doubled", &[1]).unwrap(), &[AnswerValue::Integer(10)]);
    assert!(session.answer("dose-doubled", &[2]).unwrap().is_empty());
}

#[test]
fn removing_an_instance_shifts_the_rest_without_recomputing_them_wrong() {
    let mut session = FormSession::new(
        meds_questionnaire(),
        Arc::new(doubling_backend()),
        FormConfig::default(),
    )
    .unwrap();

    session.add_repeat_instance("meds").unwrap();
    session.set_answer("dose", &[0], vec![AnswerValue::Integer(3)]).unwrap();
    session.set_answer("dose", &[1], vec![AnswerValue::Integer(5)]).unwrap();
    session.flush();

    session.remove_repeat_instance("meds", 0).unwrap();
    assert_eq!(session.store().instance_count("meds"), 1);

    // The surviving instance is now index 0, answers and computed value
    // intact.
    assert_eq!(session.answer("dose", &[0]).unwrap(), &[AnswerValue::Integer(5)]);
    assert_eq!(session.answer("dose-doubled", &[0]).unwrap(), &[AnswerValue::Integer(10)]);
}
