//! QuestionnaireResponse model
//!
//! The serialized form of the answer tree. Produced as a read view over the
//! store at any time; also accepted as input when resuming a draft.

use serde::{Deserialize, Serialize};

use crate::model::value::AnswerValue;

/// A response document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireResponse {
    /// Always `"QuestionnaireResponse"`
    #[serde(rename = "resourceType", default = "response_resource_type")]
    pub resource_type: String,
    /// Lifecycle status of the response
    #[serde(default = "in_progress")]
    pub status: String,
    /// Canonical reference to the questionnaire answered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub questionnaire: Option<String>,
    /// Answers grouped per definition item
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<ResponseItem>,
}

fn response_resource_type() -> String {
    "QuestionnaireResponse".to_string()
}

fn in_progress() -> String {
    "in-progress".to_string()
}

impl QuestionnaireResponse {
    /// An empty in-progress response
    pub fn empty(questionnaire: Option<String>) -> Self {
        Self {
            resource_type: response_resource_type(),
            status: in_progress(),
            questionnaire,
            item: Vec::new(),
        }
    }
}

/// Answers for one definition item; repeating groups appear as sibling
/// items sharing a linkId
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseItem {
    /// Pointer to the definition item
    pub link_id: String,
    /// Item text at time of answering
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// The answer(s) to the question
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer: Vec<ResponseAnswer>,
    /// Child items of a group
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<ResponseItem>,
}

/// One answer to a question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseAnswer {
    /// The answer value
    #[serde(flatten)]
    pub value: AnswerValue,
    /// Child items nested under the answer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<ResponseItem>,
}

impl ResponseAnswer {
    /// Answer with no nested items
    pub fn new(value: AnswerValue) -> Self {
        Self { value, item: Vec::new() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn answer_value_flattens_into_fhir_shape() {
        let item = ResponseItem {
            link_id: "pain-level".to_string(),
            text: None,
            answer: vec![ResponseAnswer::new(AnswerValue::Integer(3))],
            item: Vec::new(),
        };
        let json = serde_json::to_value(&item).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "linkId": "pain-level",
                "answer": [{ "valueInteger": 3 }]
            })
        );
        assert_eq!(serde_json::from_value::<ResponseItem>(json).unwrap(), item);
    }
}
