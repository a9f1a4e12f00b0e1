//! Answer value types
//!
//! FHIR `value[x]` / `answer[x]` polymorphism is modeled as closed enums so
//! an unhandled value type is a deserialization error, not a silent no-op.
//! Dates, times and dateTimes are kept as strings (FHIR allows partial
//! precision); ordering parses them with chrono and falls back to the
//! lexicographic order of the ISO form.

use std::cmp::Ordering;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ExpressionError;
use crate::model::questionnaire::ItemType;

/// A terminology coding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Coding {
    /// Code system URI
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Symbol in the system
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable representation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    /// Coding with a bare code and no system
    pub fn from_code(code: impl Into<String>) -> Self {
        Self {
            system: None,
            code: Some(code.into()),
            display: None,
        }
    }
}

/// A measured or counted amount
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Quantity {
    /// Numerical value
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Decimal>,
    /// Unit representation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// System that defines the coded unit form
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Coded form of the unit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// A literal reference to another resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    /// Relative or absolute resource reference
    #[serde(rename = "reference", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    /// Text alternative for the resource
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Content in a format defined elsewhere
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    /// Mime type of the content
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    /// Uri where the data can be found
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Label to display in place of the data
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One answer value, tagged with its FHIR `value[x]` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AnswerValue {
    /// `valueBoolean`
    #[serde(rename = "valueBoolean")]
    Boolean(bool),
    /// `valueDecimal`
    #[serde(rename = "valueDecimal")]
    Decimal(Decimal),
    /// `valueInteger`
    #[serde(rename = "valueInteger")]
    Integer(i64),
    /// `valueDate`, ISO-8601 date of possibly partial precision
    #[serde(rename = "valueDate")]
    Date(String),
    /// `valueDateTime`, ISO-8601 instant of possibly partial precision
    #[serde(rename = "valueDateTime")]
    DateTime(String),
    /// `valueTime`, time of day
    #[serde(rename = "valueTime")]
    Time(String),
    /// `valueString`
    #[serde(rename = "valueString")]
    String(String),
    /// `valueUri`
    #[serde(rename = "valueUri")]
    Uri(String),
    /// `valueAttachment`
    #[serde(rename = "valueAttachment")]
    Attachment(Attachment),
    /// `valueCoding`
    #[serde(rename = "valueCoding")]
    Coding(Coding),
    /// `valueQuantity`
    #[serde(rename = "valueQuantity")]
    Quantity(Quantity),
    /// `valueReference`
    #[serde(rename = "valueReference")]
    Reference(Reference),
}

/// The `answer[x]` side of an enableWhen condition.
///
/// Same payloads as [`AnswerValue`] under different FHIR key names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EnableWhenAnswer {
    /// `answerBoolean`
    #[serde(rename = "answerBoolean")]
    Boolean(bool),
    /// `answerDecimal`
    #[serde(rename = "answerDecimal")]
    Decimal(Decimal),
    /// `answerInteger`
    #[serde(rename = "answerInteger")]
    Integer(i64),
    /// `answerDate`
    #[serde(rename = "answerDate")]
    Date(String),
    /// `answerDateTime`
    #[serde(rename = "answerDateTime")]
    DateTime(String),
    /// `answerTime`
    #[serde(rename = "answerTime")]
    Time(String),
    /// `answerString`
    #[serde(rename = "answerString")]
    String(String),
    /// `answerCoding`
    #[serde(rename = "answerCoding")]
    Coding(Coding),
    /// `answerQuantity`
    #[serde(rename = "answerQuantity")]
    Quantity(Quantity),
    /// `answerReference`
    #[serde(rename = "answerReference")]
    Reference(Reference),
}

impl From<EnableWhenAnswer> for AnswerValue {
    fn from(answer: EnableWhenAnswer) -> Self {
        match answer {
            EnableWhenAnswer::Boolean(v) => AnswerValue::Boolean(v),
            EnableWhenAnswer::Decimal(v) => AnswerValue::Decimal(v),
            EnableWhenAnswer::Integer(v) => AnswerValue::Integer(v),
            EnableWhenAnswer::Date(v) => AnswerValue::Date(v),
            EnableWhenAnswer::DateTime(v) => AnswerValue::DateTime(v),
            EnableWhenAnswer::Time(v) => AnswerValue::Time(v),
            EnableWhenAnswer::String(v) => AnswerValue::String(v),
            EnableWhenAnswer::Coding(v) => AnswerValue::Coding(v),
            EnableWhenAnswer::Quantity(v) => AnswerValue::Quantity(v),
            EnableWhenAnswer::Reference(v) => AnswerValue::Reference(v),
        }
    }
}

impl AnswerValue {
    /// Equality as used by enableWhen `=` / `!=`.
    ///
    /// Codings match on system + code (display is ignored), quantities on
    /// value + coded unit. Everything else is plain value equality.
    pub fn matches(&self, expected: &AnswerValue) -> bool {
        match (self, expected) {
            (AnswerValue::Coding(a), AnswerValue::Coding(b)) => {
                a.code == b.code && (a.system == b.system || a.system.is_none() || b.system.is_none())
            }
            (AnswerValue::Quantity(a), AnswerValue::Quantity(b)) => {
                a.value == b.value && a.system == b.system && (a.code == b.code || a.unit == b.unit)
            }
            (a, b) => numeric_pair(a, b).map_or(a == b, |(x, y)| x == y),
        }
    }

    /// Ordering as used by enableWhen `<`, `<=`, `>`, `>=`.
    ///
    /// Returns `None` when the two values are not comparable.
    pub fn compare(&self, expected: &AnswerValue) -> Option<Ordering> {
        if let Some((a, b)) = numeric_pair(self, expected) {
            return Some(a.cmp(&b));
        }
        match (self, expected) {
            (AnswerValue::String(a), AnswerValue::String(b)) => Some(a.cmp(b)),
            (AnswerValue::Date(a), AnswerValue::Date(b)) => Some(compare_dates(a, b)),
            (AnswerValue::DateTime(a), AnswerValue::DateTime(b)) => Some(compare_date_times(a, b)),
            (AnswerValue::Time(a), AnswerValue::Time(b)) => Some(compare_times(a, b)),
            (AnswerValue::Quantity(a), AnswerValue::Quantity(b)) => {
                if a.system == b.system && (a.code == b.code || a.unit == b.unit) {
                    Some(a.value?.cmp(&b.value?))
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Convert an evaluation result into the answer type of the owning item.
    ///
    /// A string landing on a choice item becomes a bare-code coding, and
    /// integers widen to decimals, matching how calculated expression
    /// results are applied in form renderers.
    pub fn from_json(item_type: ItemType, value: &Value) -> std::result::Result<Self, ExpressionError> {
        let mismatch = |message: &str| ExpressionError::TypeMismatch {
            item_type: item_type.code().to_string(),
            message: message.to_string(),
        };

        match item_type {
            ItemType::Boolean => value
                .as_bool()
                .map(AnswerValue::Boolean)
                .ok_or_else(|| mismatch("expected a boolean")),
            ItemType::Integer => match value {
                Value::Number(n) => n
                    .as_i64()
                    .map(AnswerValue::Integer)
                    .ok_or_else(|| mismatch("expected a whole number")),
                _ => Err(mismatch("expected a number")),
            },
            ItemType::Decimal => json_decimal(value)
                .map(AnswerValue::Decimal)
                .ok_or_else(|| mismatch("expected a number")),
            ItemType::String | ItemType::Text => match value {
                Value::String(s) => Ok(AnswerValue::String(s.clone())),
                Value::Number(n) => Ok(AnswerValue::String(n.to_string())),
                Value::Bool(b) => Ok(AnswerValue::String(b.to_string())),
                _ => Err(mismatch("expected a string")),
            },
            ItemType::Date => json_string(value)
                .map(AnswerValue::Date)
                .ok_or_else(|| mismatch("expected a date string")),
            ItemType::DateTime => json_string(value)
                .map(AnswerValue::DateTime)
                .ok_or_else(|| mismatch("expected a dateTime string")),
            ItemType::Time => json_string(value)
                .map(AnswerValue::Time)
                .ok_or_else(|| mismatch("expected a time string")),
            ItemType::Url => json_string(value)
                .map(AnswerValue::Uri)
                .ok_or_else(|| mismatch("expected a uri string")),
            ItemType::Choice | ItemType::OpenChoice => match value {
                Value::String(code) => Ok(AnswerValue::Coding(Coding::from_code(code.clone()))),
                Value::Object(_) => serde_json::from_value::<Coding>(value.clone())
                    .map(AnswerValue::Coding)
                    .map_err(|e| mismatch(&format!("not a coding: {e}"))),
                _ => Err(mismatch("expected a code or coding")),
            },
            ItemType::Quantity => match value {
                Value::Number(_) => Ok(AnswerValue::Quantity(Quantity {
                    value: json_decimal(value),
                    ..Quantity::default()
                })),
                Value::Object(_) => serde_json::from_value::<Quantity>(value.clone())
                    .map(AnswerValue::Quantity)
                    .map_err(|e| mismatch(&format!("not a quantity: {e}"))),
                _ => Err(mismatch("expected a number or quantity")),
            },
            ItemType::Reference => match value {
                Value::String(reference) => Ok(AnswerValue::Reference(Reference {
                    reference: Some(reference.clone()),
                    display: None,
                })),
                Value::Object(_) => serde_json::from_value::<Reference>(value.clone())
                    .map(AnswerValue::Reference)
                    .map_err(|e| mismatch(&format!("not a reference: {e}"))),
                _ => Err(mismatch("expected a reference")),
            },
            ItemType::Attachment => serde_json::from_value::<Attachment>(value.clone())
                .map(AnswerValue::Attachment)
                .map_err(|e| mismatch(&format!("not an attachment: {e}"))),
            ItemType::Group | ItemType::Display => {
                Err(mismatch("group and display items cannot hold answers"))
            }
        }
    }
}

fn json_string(value: &Value) -> Option<String> {
    value.as_str().map(str::to_string)
}

fn json_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(n) => Decimal::from_str(&n.to_string()).ok(),
        _ => None,
    }
}

// Integers and decimals compare against each other through Decimal.
fn numeric_pair(a: &AnswerValue, b: &AnswerValue) -> Option<(Decimal, Decimal)> {
    let to_decimal = |v: &AnswerValue| match v {
        AnswerValue::Integer(i) => Some(Decimal::from(*i)),
        AnswerValue::Decimal(d) => Some(*d),
        _ => None,
    };
    Some((to_decimal(a)?, to_decimal(b)?))
}

fn compare_dates(a: &str, b: &str) -> Ordering {
    match (NaiveDate::from_str(a), NaiveDate::from_str(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn compare_date_times(a: &str, b: &str) -> Ordering {
    match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn compare_times(a: &str, b: &str) -> Ordering {
    match (NaiveTime::from_str(a), NaiveTime::from_str(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}
