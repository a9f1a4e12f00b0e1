//! FHIR resource models
//!
//! The subset of Questionnaire and QuestionnaireResponse this engine needs,
//! with stable FHIR field names preserved through serde.

mod questionnaire;
mod response;
mod value;

pub use questionnaire::{
    AnswerOption, EnableBehavior, EnableWhen, EnableWhenOperator, ExpressionDef, Extension,
    ItemInitial, ItemType, Questionnaire, QuestionnaireItem,
};
pub use response::{QuestionnaireResponse, ResponseAnswer, ResponseItem};
pub use value::{AnswerValue, Attachment, Coding, EnableWhenAnswer, Quantity, Reference};
