//! Known SDC extension identifiers
//!
//! One fixed table maps extension urls to binding kinds. Extraction code
//! looks things up here instead of matching url strings ad hoc.

use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;

use super::ExpressionKind;

/// Variable declaration (core extension, questionnaire- or item-level)
pub const EXT_VARIABLE: &str = "http://hl7.org/fhir/StructureDefinition/variable";

/// Calculated expression whose result becomes the item's answer
pub const EXT_CALCULATED_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-calculatedExpression";

/// Boolean expression controlling whether the item is enabled
pub const EXT_ENABLE_WHEN_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-enableWhenExpression";

/// Expression seeding the item's answer during population
pub const EXT_INITIAL_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-initialExpression";

/// Query establishing the population context of an item (or group instances)
pub const EXT_ITEM_POPULATION_CONTEXT: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-itemPopulationContext";

/// Expression producing the permitted answers for an item
pub const EXT_ANSWER_EXPRESSION: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-answerExpression";

/// Launch context declaration (patient, user, encounter, ...)
pub const EXT_LAUNCH_CONTEXT: &str =
    "http://hl7.org/fhir/uv/sdc/StructureDefinition/sdc-questionnaire-launchContext";

static BINDING_KINDS: Lazy<FxHashMap<&'static str, ExpressionKind>> = Lazy::new(|| {
    let mut table = FxHashMap::default();
    table.insert(EXT_VARIABLE, ExpressionKind::Variable);
    table.insert(EXT_CALCULATED_EXPRESSION, ExpressionKind::Calculated);
    table.insert(EXT_ENABLE_WHEN_EXPRESSION, ExpressionKind::EnableWhen);
    table.insert(EXT_INITIAL_EXPRESSION, ExpressionKind::Initial);
    table.insert(EXT_ITEM_POPULATION_CONTEXT, ExpressionKind::PopulationContext);
    table.insert(EXT_ANSWER_EXPRESSION, ExpressionKind::AnswerOptions);
    table
});

/// Binding kind declared by an extension url, if it is one of ours
pub fn binding_kind_for(url: &str) -> Option<ExpressionKind> {
    BINDING_KINDS.get(url).copied()
}
