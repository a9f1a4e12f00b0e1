//! Questionnaire definition model
//!
//! The immutable subset of a FHIR Questionnaire this engine consumes. The
//! definition tree is loaded once per session and never mutated; everything
//! mutable lives in the answer store.

use serde::{Deserialize, Serialize};

use crate::model::value::{AnswerValue, EnableWhenAnswer};

/// A questionnaire definition document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Questionnaire {
    /// Always `"Questionnaire"`
    #[serde(rename = "resourceType", default = "questionnaire_resource_type")]
    pub resource_type: String,
    /// Canonical identifier
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Name for this questionnaire
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Publication status (draft | active | retired | unknown)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Questionnaire-level extensions (variables, launch contexts, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    /// The item tree
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireItem>,
}

fn questionnaire_resource_type() -> String {
    "Questionnaire".to_string()
}

impl Questionnaire {
    /// Depth-first walk over every item in the tree
    pub fn walk_items(&self, mut visit: impl FnMut(&QuestionnaireItem, Option<&QuestionnaireItem>)) {
        fn recurse<'a>(
            item: &'a QuestionnaireItem,
            parent: Option<&'a QuestionnaireItem>,
            visit: &mut impl FnMut(&QuestionnaireItem, Option<&QuestionnaireItem>),
        ) {
            visit(item, parent);
            for child in &item.item {
                recurse(child, Some(item), visit);
            }
        }
        for item in &self.item {
            recurse(item, None, &mut visit);
        }
    }

    /// Find a definition item by linkId
    pub fn find_item(&self, link_id: &str) -> Option<&QuestionnaireItem> {
        fn recurse<'a>(items: &'a [QuestionnaireItem], link_id: &str) -> Option<&'a QuestionnaireItem> {
            for item in items {
                if item.link_id == link_id {
                    return Some(item);
                }
                if let Some(found) = recurse(&item.item, link_id) {
                    return Some(found);
                }
            }
            None
        }
        recurse(&self.item, link_id)
    }
}

/// One node of the definition tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionnaireItem {
    /// Unique id for the item within the questionnaire
    pub link_id: String,
    /// Kind of the item
    #[serde(rename = "type")]
    pub item_type: ItemType,
    /// Primary text for the item
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Whether the item may repeat
    #[serde(default, skip_serializing_if = "is_false")]
    pub repeats: bool,
    /// Whether the item must be included in data results
    #[serde(default, skip_serializing_if = "is_false")]
    pub required: bool,
    /// Don't allow human editing
    #[serde(default, skip_serializing_if = "is_false")]
    pub read_only: bool,
    /// Only allow data when these conditions hold
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable_when: Vec<EnableWhen>,
    /// How multiple enableWhen conditions combine
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable_behavior: Option<EnableBehavior>,
    /// Permitted answers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub answer_option: Vec<AnswerOption>,
    /// ValueSet of permitted answers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_value_set: Option<String>,
    /// Initial values when the form is first rendered
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub initial: Vec<ItemInitial>,
    /// Item-level extensions (expressions, variables, ...)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
    /// Nested items
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub item: Vec<QuestionnaireItem>,
}

impl QuestionnaireItem {
    /// Whether this item is a repeating group (multiple answer node instances)
    pub fn is_repeat_group(&self) -> bool {
        self.repeats && self.item_type == ItemType::Group
    }
}

/// The closed set of item kinds this engine handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemType {
    /// Grouping item with no direct answer
    #[serde(rename = "group")]
    Group,
    /// Display-only text
    #[serde(rename = "display")]
    Display,
    /// Yes/no answer
    #[serde(rename = "boolean")]
    Boolean,
    /// Real number answer
    #[serde(rename = "decimal")]
    Decimal,
    /// Whole number answer
    #[serde(rename = "integer")]
    Integer,
    /// Date answer
    #[serde(rename = "date")]
    Date,
    /// Date and time answer
    #[serde(rename = "dateTime")]
    DateTime,
    /// Time of day answer
    #[serde(rename = "time")]
    Time,
    /// Short free-text answer
    #[serde(rename = "string")]
    String,
    /// Long free-text answer
    #[serde(rename = "text")]
    Text,
    /// Url answer
    #[serde(rename = "url")]
    Url,
    /// Answer from a fixed set of codes
    #[serde(rename = "choice")]
    Choice,
    /// Coded answer or free text
    #[serde(rename = "open-choice")]
    OpenChoice,
    /// Binary content answer
    #[serde(rename = "attachment")]
    Attachment,
    /// Resource reference answer
    #[serde(rename = "reference")]
    Reference,
    /// Measured amount answer
    #[serde(rename = "quantity")]
    Quantity,
}

impl ItemType {
    /// The FHIR code for this item type
    pub fn code(&self) -> &'static str {
        match self {
            ItemType::Group => "group",
            ItemType::Display => "display",
            ItemType::Boolean => "boolean",
            ItemType::Decimal => "decimal",
            ItemType::Integer => "integer",
            ItemType::Date => "date",
            ItemType::DateTime => "dateTime",
            ItemType::Time => "time",
            ItemType::String => "string",
            ItemType::Text => "text",
            ItemType::Url => "url",
            ItemType::Choice => "choice",
            ItemType::OpenChoice => "open-choice",
            ItemType::Attachment => "attachment",
            ItemType::Reference => "reference",
            ItemType::Quantity => "quantity",
        }
    }

    /// Whether the item can carry answers at all
    pub fn holds_answers(&self) -> bool {
        !matches!(self, ItemType::Group | ItemType::Display)
    }

    /// Whether edits to this item type recompute immediately rather than
    /// waiting out the debounce window (discrete selections vs keystrokes).
    pub fn recomputes_immediately(&self) -> bool {
        matches!(self, ItemType::Boolean | ItemType::Choice | ItemType::OpenChoice)
    }
}

/// A single enableWhen condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableWhen {
    /// LinkId of the question this condition reads
    pub question: String,
    /// Comparison operator
    pub operator: EnableWhenOperator,
    /// Expected answer
    #[serde(flatten)]
    pub answer: EnableWhenAnswer,
}

/// enableWhen comparison operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnableWhenOperator {
    /// Answer exists (or not, when the expected boolean is false)
    #[serde(rename = "exists")]
    Exists,
    /// Answer equals the expected value
    #[serde(rename = "=")]
    Equals,
    /// Answer differs from the expected value
    #[serde(rename = "!=")]
    NotEquals,
    /// Answer is greater than the expected value
    #[serde(rename = ">")]
    Greater,
    /// Answer is less than the expected value
    #[serde(rename = "<")]
    Less,
    /// Answer is greater than or equal to the expected value
    #[serde(rename = ">=")]
    GreaterOrEquals,
    /// Answer is less than or equal to the expected value
    #[serde(rename = "<=")]
    LessOrEquals,
}

/// How multiple enableWhen conditions combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnableBehavior {
    /// Every condition must hold
    #[serde(rename = "all")]
    All,
    /// At least one condition must hold
    #[serde(rename = "any")]
    Any,
}

/// One permitted answer for a choice item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOption {
    /// The option value
    #[serde(flatten)]
    pub value: AnswerValue,
    /// Whether the option is selected by default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_selected: Option<bool>,
}

/// An initial value for an item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemInitial {
    /// The initial answer value
    #[serde(flatten)]
    pub value: AnswerValue,
}

/// A FHIR extension, limited to the value types the SDC profile uses
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Extension {
    /// Identity of the extension
    #[serde(default)]
    pub url: String,
    /// An expression payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_expression: Option<ExpressionDef>,
    /// A code payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_code: Option<String>,
    /// An id payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_id: Option<String>,
    /// A string payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_string: Option<String>,
    /// A coding payload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_coding: Option<crate::model::value::Coding>,
    /// Nested extensions (complex extensions such as launchContext)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub extension: Vec<Extension>,
}

/// A FHIR Expression datatype
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExpressionDef {
    /// Short name assigned to the expression for reuse
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Expression language media type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// The expression text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn unknown_item_type_is_rejected_at_load() {
        let json = serde_json::json!({
            "linkId": "q1",
            "type": "hologram"
        });
        assert!(serde_json::from_value::<QuestionnaireItem>(json).is_err());
    }

    #[test]
    fn enable_when_answer_uses_answer_x_keys() {
        let json = serde_json::json!({
            "question": "pain-present",
            "operator": "=",
            "answerBoolean": true
        });
        let condition: EnableWhen = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(condition.answer, EnableWhenAnswer::Boolean(true));
        assert_eq!(serde_json::to_value(&condition).unwrap(), json);
    }

    #[test]
    fn walk_items_visits_depth_first_with_parents() {
        let questionnaire: Questionnaire = serde_json::from_value(serde_json::json!({
            "resourceType": "Questionnaire",
            "item": [
                { "linkId": "g", "type": "group", "item": [
                    { "linkId": "a", "type": "string" },
                    { "linkId": "b", "type": "string" }
                ]}
            ]
        }))
        .unwrap();

        let mut seen = Vec::new();
        questionnaire.walk_items(|item, parent| {
            seen.push((item.link_id.clone(), parent.map(|p| p.link_id.clone())));
        });
        assert_eq!(
            seen,
            vec![
                ("g".to_string(), None),
                ("a".to_string(), Some("g".to_string())),
                ("b".to_string(), Some("g".to_string())),
            ]
        );
    }
}
