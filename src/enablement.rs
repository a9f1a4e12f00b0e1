//! Enablement engine
//!
//! Decides each item's own enabled state from its `enableWhen` conditions
//! and `enableWhenExpression` results. The store ANDs the ancestor chain in
//! when applying the decision, so a disabled ancestor forces all
//! descendants off regardless of their own conditions.
//!
//! Recomputation is scoped through a linked-question map: an answer edit
//! only re-evaluates the items whose conditions reference the edited
//! question, which keeps per-keystroke cost bounded by fan-out rather than
//! tree size.

use rustc_hash::{FxHashMap, FxHashSet};
use std::cmp::Ordering;

use crate::model::{
    AnswerValue, EnableBehavior, EnableWhen, EnableWhenAnswer, EnableWhenOperator, Questionnaire,
};
use crate::registry::ExpressionRegistry;
use crate::store::{AnswerStore, DirtyKey};

#[derive(Debug, Clone)]
struct ItemConditions {
    conditions: Vec<EnableWhen>,
    behavior: EnableBehavior,
}

/// Per-item enablement state
#[derive(Debug, Default)]
pub struct EnablementEngine {
    conditions: FxHashMap<String, ItemConditions>,
    linked: FxHashMap<String, Vec<String>>,
    scope_of: FxHashMap<String, String>,
    condition_state: FxHashMap<(String, usize), bool>,
    expression_state: FxHashMap<(String, usize), bool>,
}

impl EnablementEngine {
    /// Collect conditions and the linked-question map from the definition
    pub fn build(questionnaire: &Questionnaire, registry: &ExpressionRegistry) -> Self {
        let mut engine = Self::default();

        questionnaire.walk_items(|item, _| {
            if let Some(scope) = registry.repeat_scope_of(&item.link_id) {
                engine.scope_of.insert(item.link_id.clone(), scope.to_string());
            }
            if item.enable_when.is_empty() {
                return;
            }
            // Absent enableBehavior means every condition must hold.
            let behavior = item.enable_behavior.unwrap_or(EnableBehavior::All);
            engine.conditions.insert(
                item.link_id.clone(),
                ItemConditions { conditions: item.enable_when.clone(), behavior },
            );
            for condition in &item.enable_when {
                let dependents = engine.linked.entry(condition.question.clone()).or_default();
                if !dependents.contains(&item.link_id) {
                    dependents.push(item.link_id.clone());
                }
            }
        });

        engine
    }

    /// Items whose conditions reference a question
    pub fn dependents_of(&self, question: &str) -> &[String] {
        self.linked.get(question).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Evaluate every condition in the tree, e.g. at build time or after a
    /// shape change
    pub fn recompute_all(&mut self, store: &AnswerStore) {
        let items: Vec<String> = self.conditions.keys().cloned().collect();
        for link_id in items {
            self.refresh_item(&link_id, store);
        }
    }

    /// Re-evaluate only the items whose referenced questions changed.
    /// Returns the set of items whose own state flipped.
    pub fn recompute_for_changed(&mut self, changed: &[DirtyKey], store: &AnswerStore) -> Vec<String> {
        let mut targets: FxHashSet<String> = FxHashSet::default();
        for key in changed {
            for dependent in self.dependents_of(&key.link_id) {
                targets.insert(dependent.clone());
            }
        }

        let mut flipped = Vec::new();
        for link_id in targets {
            if self.refresh_item(&link_id, store) {
                flipped.push(link_id);
            }
        }
        flipped
    }

    // Refresh one item's condition results across its instances; true when
    // any instance changed.
    fn refresh_item(&mut self, link_id: &str, store: &AnswerStore) -> bool {
        let Some(item_conditions) = self.conditions.get(link_id).cloned() else {
            return false;
        };
        let scope = self.scope_of.get(link_id).cloned();
        let instances = match &scope {
            Some(group) => store.instance_count(group).max(1),
            None => 1,
        };

        let mut changed = false;
        for instance in 0..instances {
            let resolved = self.evaluate_conditions(&item_conditions, link_id, instance, store);
            let previous = self
                .condition_state
                .insert((link_id.to_string(), instance), resolved);
            if previous != Some(resolved) {
                changed = true;
            }
        }
        changed
    }

    fn evaluate_conditions(
        &self,
        item_conditions: &ItemConditions,
        link_id: &str,
        instance: usize,
        store: &AnswerStore,
    ) -> bool {
        let item_scope = self.scope_of.get(link_id);
        let results = item_conditions.conditions.iter().map(|condition| {
            // A referenced question inside the same repeat instance is read
            // from that instance only; anything else is read globally.
            let question_scope = self.scope_of.get(&condition.question);
            let scope = match (item_scope, question_scope) {
                (Some(a), Some(b)) if a == b => Some((a.as_str(), instance)),
                _ => None,
            };
            let answers = store.answers_of(&condition.question, scope);
            condition_holds(condition, &answers)
        });

        match item_conditions.behavior {
            EnableBehavior::All => results.fold(true, |acc, r| acc && r),
            EnableBehavior::Any => results.fold(false, |acc, r| acc || r),
        }
    }

    /// Record an enableWhenExpression result for an item instance
    pub fn set_expression_result(&mut self, link_id: &str, instance: usize, enabled: bool) -> bool {
        let previous = self
            .expression_state
            .insert((link_id.to_string(), instance), enabled);
        previous != Some(enabled)
    }

    /// The item's own condition result: enableWhen AND enableWhenExpression,
    /// defaulting to enabled where nothing is declared
    pub fn decide(&self, link_id: &str, instance: usize) -> bool {
        let key = (link_id.to_string(), instance);
        let condition = self.condition_state.get(&key).copied().unwrap_or(true);
        let expression = self.expression_state.get(&key).copied().unwrap_or(true);
        condition && expression
    }
}

/// Whether one enableWhen condition holds against the question's current
/// answers.
///
/// `exists` is always decidable; the comparison operators need at least one
/// answer and hold when any answer satisfies them.
pub fn condition_holds(condition: &EnableWhen, answers: &[AnswerValue]) -> bool {
    if condition.operator == EnableWhenOperator::Exists {
        let expected = matches!(condition.answer, EnableWhenAnswer::Boolean(true));
        return !answers.is_empty() == expected;
    }

    let expected: AnswerValue = condition.answer.clone().into();
    answers.iter().any(|answer| match condition.operator {
        EnableWhenOperator::Exists => false,
        EnableWhenOperator::Equals => answer.matches(&expected),
        EnableWhenOperator::NotEquals => !answer.matches(&expected),
        EnableWhenOperator::Greater => answer.compare(&expected) == Some(Ordering::Greater),
        EnableWhenOperator::Less => answer.compare(&expected) == Some(Ordering::Less),
        EnableWhenOperator::GreaterOrEquals => {
            matches!(answer.compare(&expected), Some(Ordering::Greater | Ordering::Equal))
        }
        EnableWhenOperator::LessOrEquals => {
            matches!(answer.compare(&expected), Some(Ordering::Less | Ordering::Equal))
        }
    })
}
