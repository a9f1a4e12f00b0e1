//! Form session
//!
//! One explicit object owns the store, registry, resolver and enablement
//! state for a single questionnaire instance; nothing here is process
//! global, so any number of sessions can live side by side. All evaluation
//! and enablement recomputation runs synchronously inside one update
//! cycle; only population fetches are asynchronous.

use std::sync::Arc;
use std::time::Instant;

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;

use crate::config::FormConfig;
use crate::diagnostics::Diagnostic;
use crate::enablement::EnablementEngine;
use crate::error::{ExpressionError, FormError, Result};
use crate::eval::{EvalContext, Evaluator, ExpressionBackend};
use crate::graph::{DependencyResolver, NodeKey};
use crate::model::{AnswerValue, Questionnaire, QuestionnaireResponse};
use crate::registry::{ExpressionKind, ExpressionLanguage, ExpressionRegistry};
use crate::store::{AnswerStore, DirtyKey, WriteOutcome, WriteSource};

/// What triggered a recomputation pass
pub(crate) enum Changes {
    /// Evaluate everything, e.g. at build time or after population
    All,
    /// Scoped: only the downstream closure of these dirty answers
    Dirty(Vec<DirtyKey>),
}

/// A live form instance: the session object described in the system design
pub struct FormSession {
    pub(crate) questionnaire: Arc<Questionnaire>,
    pub(crate) config: FormConfig,
    pub(crate) registry: ExpressionRegistry,
    pub(crate) resolver: DependencyResolver,
    pub(crate) store: AnswerStore,
    pub(crate) enablement: EnablementEngine,
    pub(crate) evaluator: Evaluator,
    /// Launch context and fetched population resources, by `%name`
    pub(crate) launch: FxHashMap<String, Value>,
    /// Last successful result per variable binding node
    pub(crate) var_values: FxHashMap<NodeKey, Value>,
    /// Population context resource per (repeat group, instance)
    pub(crate) instance_contexts: FxHashMap<(String, usize), (String, Value)>,
    /// Latest answerExpression results per item
    pub(crate) answer_options: FxHashMap<String, Vec<Value>>,
    pub(crate) diagnostics: Vec<Diagnostic>,
    /// Latest failure per binding instance; cleared on the next success
    pub(crate) expression_errors: IndexMap<(crate::registry::BindingId, Option<usize>), ExpressionError>,
    pub(crate) repopulate_token: u64,
    /// Terminology callback for value-set expansion; held for the renderer,
    /// the engine itself never calls it
    pub(crate) terminology: Option<Arc<dyn crate::populate::ResourceFetcher>>,
}

impl FormSession {
    /// Build a session over an empty response
    pub fn new(
        questionnaire: Questionnaire,
        backend: Arc<dyn ExpressionBackend>,
        config: FormConfig,
    ) -> Result<Self> {
        Self::build(questionnaire, None, backend, config)
    }

    /// Build a session resuming a previously saved response
    pub fn with_response(
        questionnaire: Questionnaire,
        response: &QuestionnaireResponse,
        backend: Arc<dyn ExpressionBackend>,
        config: FormConfig,
    ) -> Result<Self> {
        Self::build(questionnaire, Some(response), backend, config)
    }

    fn build(
        questionnaire: Questionnaire,
        response: Option<&QuestionnaireResponse>,
        backend: Arc<dyn ExpressionBackend>,
        config: FormConfig,
    ) -> Result<Self> {
        let questionnaire = Arc::new(questionnaire);
        let registry = ExpressionRegistry::build(&questionnaire);
        let computed = registry.computed_items();

        let store = match response {
            Some(response) => AnswerStore::from_response(
                questionnaire.clone(),
                response,
                computed,
                config.debounce_window,
            ),
            None => AnswerStore::from_definition(
                questionnaire.clone(),
                computed,
                config.debounce_window,
            ),
        };

        let resolver = DependencyResolver::build(&registry, &store.repeat_instance_counts());
        let mut diagnostics = Vec::new();
        for cycle in resolver.cycles() {
            log::warn!("dependency cycle detected: {}", cycle.join(" -> "));
            diagnostics.push(Diagnostic::cycle(cycle));
        }

        let mut enablement = EnablementEngine::build(&questionnaire, &registry);
        enablement.recompute_all(&store);

        let mut session = Self {
            questionnaire,
            config,
            registry,
            resolver,
            store,
            enablement,
            evaluator: Evaluator::new(backend),
            launch: FxHashMap::default(),
            var_values: FxHashMap::default(),
            instance_contexts: FxHashMap::default(),
            answer_options: FxHashMap::default(),
            diagnostics,
            expression_errors: IndexMap::new(),
            repopulate_token: 0,
            terminology: None,
        };
        session.recompute(Changes::All);
        Ok(session)
    }

    /// The loaded definition
    pub fn questionnaire(&self) -> &Questionnaire {
        &self.questionnaire
    }

    /// Read access to the answer store
    pub fn store(&self) -> &AnswerStore {
        &self.store
    }

    /// Register a store mutation listener
    pub fn subscribe(&mut self, listener: impl Fn(&crate::store::StoreEvent) + 'static) {
        self.store.subscribe(listener);
    }

    /// Provide the terminology callback used for value-set expansion.
    ///
    /// Coded-value expansion is a rendering concern; the engine stores the
    /// callback for the renderer but never invokes it itself.
    pub fn set_terminology_fetcher(&mut self, fetcher: Arc<dyn crate::populate::ResourceFetcher>) {
        self.terminology = Some(fetcher);
    }

    /// The terminology callback, if one was provided
    pub fn terminology_fetcher(&self) -> Option<&Arc<dyn crate::populate::ResourceFetcher>> {
        self.terminology.as_ref()
    }

    /// Session diagnostics: structural cycles and population problems
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Latest expression failures, by owning item
    pub fn expression_errors(&self) -> impl Iterator<Item = (Option<&str>, &ExpressionError)> {
        self.expression_errors.iter().map(|((id, _), error)| {
            (self.registry.binding(*id).owner.as_deref(), error)
        })
    }

    /// Provide a launch context resource (`%patient`, `%user`, ...) and
    /// re-evaluate everything that reads it
    pub fn set_launch_context(&mut self, name: impl Into<String>, resource: Value) {
        self.launch.insert(name.into(), resource);
        self.recompute(Changes::All);
    }

    /// Write a user edit.
    ///
    /// Discrete answers (boolean, choice) recompute before this returns;
    /// free-text edits coalesce until their debounce deadline, drained by
    /// [`FormSession::poll`] or [`FormSession::flush`].
    pub fn set_answer(
        &mut self,
        link_id: &str,
        instance_path: &[usize],
        answers: Vec<AnswerValue>,
    ) -> Result<WriteOutcome> {
        if let Some(item) = self.questionnaire.find_item(link_id) {
            if !item.item_type.holds_answers() {
                return Err(FormError::InvalidDefinition {
                    message: format!("'{link_id}' is a {} item and cannot hold answers", item.item_type.code()),
                });
            }
        }
        let outcome = self.store.set_answer(link_id, instance_path, answers, WriteSource::User)?;
        if outcome == WriteOutcome::Applied {
            self.drain(Instant::now());
        }
        Ok(outcome)
    }

    /// Remove a user answer
    pub fn clear_answer(&mut self, link_id: &str, instance_path: &[usize]) -> Result<WriteOutcome> {
        let outcome = self.store.set_answer(link_id, instance_path, Vec::new(), WriteSource::User)?;
        if outcome == WriteOutcome::Applied {
            self.drain(Instant::now());
        }
        Ok(outcome)
    }

    /// Drain coalesced edits whose debounce deadline has passed
    pub fn poll(&mut self, now: Instant) {
        self.drain(now);
    }

    /// Drain every coalesced edit immediately, e.g. on blur or submit
    pub fn flush(&mut self) {
        let pending = self.store.take_all_pending();
        if !pending.is_empty() {
            self.recompute(Changes::Dirty(pending));
        }
    }

    /// Whether edits are waiting on their debounce deadline
    pub fn has_pending_edits(&self) -> bool {
        self.store.has_pending()
    }

    fn drain(&mut self, now: Instant) {
        let due = self.store.take_due(now);
        if !due.is_empty() {
            self.recompute(Changes::Dirty(due));
        }
    }

    /// Current enabled state of an item instance
    pub fn is_enabled(&self, link_id: &str, instance_path: &[usize]) -> Result<bool> {
        self.store.is_enabled(link_id, instance_path)
    }

    /// Current answers of an item instance
    pub fn answer(&self, link_id: &str, instance_path: &[usize]) -> Result<&[AnswerValue]> {
        self.store.get_answer(link_id, instance_path)
    }

    /// Latest answerExpression results for an item, as candidate options
    pub fn answer_options(&self, link_id: &str) -> Option<&[Value]> {
        self.answer_options.get(link_id).map(Vec::as_slice)
    }

    /// The current response document, disabled subtrees and unanswered
    /// items excluded
    pub fn response(&self) -> QuestionnaireResponse {
        self.store.to_response(self.questionnaire.url.clone(), false)
    }

    // -- recomputation driver ---------------------------------------------

    /// One update cycle: evaluate affected bindings in topological order,
    /// settle enablement, and absorb resulting writes in at most one
    /// follow-up pass (passes are idempotent given unchanged inputs).
    pub(crate) fn recompute(&mut self, changes: Changes) {
        let mut scope = changes;
        for pass in 0..self.config.max_passes.max(1) {
            let writes = self.run_pass(&scope);
            if writes.is_empty() {
                return;
            }
            log::debug!("pass {pass} produced {} downstream write(s)", writes.len());
            scope = Changes::Dirty(writes);
        }
        log::debug!("recomputation hit the pass bound; further writes wait for the next edit");
    }

    fn run_pass(&mut self, changes: &Changes) -> Vec<DirtyKey> {
        let affected = match changes {
            Changes::All => None,
            Changes::Dirty(keys) => {
                let mut seeds = Vec::new();
                for key in keys {
                    seeds.push(NodeKey::answer(key.link_id.clone()));
                    if let Some(instance) = key.instance {
                        seeds.push(NodeKey::Answer {
                            link_id: key.link_id.clone(),
                            instance: Some(instance),
                        });
                    }
                }
                Some(self.resolver.affected_by(seeds))
            }
        };

        let order: Vec<NodeKey> = self.resolver.order().to_vec();
        let mut snapshot = self.response_snapshot();
        let mut snapshot_dirty = false;
        let mut writes: Vec<DirtyKey> = Vec::new();

        for node in order {
            let NodeKey::Binding { id, instance } = node.clone() else {
                continue;
            };
            if self.resolver.is_excluded(&node) {
                continue;
            }
            if let Some(affected) = &affected {
                if !affected.contains(&node) {
                    continue;
                }
            }

            let binding = self.registry.binding(id).clone();
            // Query variables are resolved by the population pipeline, and
            // initial/context expressions only run there as well.
            if binding.language == ExpressionLanguage::FhirQuery
                || matches!(binding.kind, ExpressionKind::Initial | ExpressionKind::PopulationContext)
            {
                continue;
            }

            if snapshot_dirty {
                snapshot = self.response_snapshot();
                snapshot_dirty = false;
            }

            let focus = match self.binding_focus(&binding, instance) {
                Some(focus) => focus,
                None => snapshot.clone(),
            };
            let variables = self.resolve_binding_variables(&node, &binding, instance);
            let context = EvalContext {
                focus: &focus,
                variables: &variables,
                launch: &self.launch,
            };

            match binding.kind {
                ExpressionKind::Variable => {
                    match self.evaluator.evaluate(&binding.expression, &context) {
                        Ok(values) => {
                            self.var_values.insert(node.clone(), collection_value(values));
                            self.clear_error(id, instance);
                        }
                        Err(error) => self.record_error(&binding, instance, error),
                    }
                }
                ExpressionKind::Calculated => {
                    let owner = match &binding.owner {
                        Some(owner) => owner.clone(),
                        None => continue,
                    };
                    match self.evaluator.evaluate_single(&binding.expression, &context) {
                        Ok(result) => {
                            self.clear_error(id, instance);
                            if self.apply_calculated(&owner, instance, result) {
                                writes.push(DirtyKey { link_id: owner, instance });
                                snapshot_dirty = true;
                            }
                        }
                        // Failure keeps the last-known-good value in place.
                        Err(error) => self.record_error(&binding, instance, error),
                    }
                }
                ExpressionKind::EnableWhen => {
                    let owner = match &binding.owner {
                        Some(owner) => owner.clone(),
                        None => continue,
                    };
                    match self.evaluator.evaluate_bool(&binding.expression, &context) {
                        Ok(enabled) => {
                            self.clear_error(id, instance);
                            self.enablement
                                .set_expression_result(&owner, instance.unwrap_or(0), enabled);
                        }
                        Err(error) => self.record_error(&binding, instance, error),
                    }
                }
                ExpressionKind::AnswerOptions => {
                    let owner = match &binding.owner {
                        Some(owner) => owner.clone(),
                        None => continue,
                    };
                    match self.evaluator.evaluate(&binding.expression, &context) {
                        Ok(values) => {
                            self.clear_error(id, instance);
                            self.answer_options.insert(owner, values);
                        }
                        Err(error) => self.record_error(&binding, instance, error),
                    }
                }
                ExpressionKind::Initial | ExpressionKind::PopulationContext => {}
            }
        }

        // Plain enableWhen conditions for items whose questions changed,
        // then fold every decision into the tree in one walk.
        match changes {
            Changes::All => self.enablement.recompute_all(&self.store),
            Changes::Dirty(keys) => {
                let mut all_dirty = keys.clone();
                all_dirty.extend(writes.iter().cloned());
                self.enablement.recompute_for_changed(&all_dirty, &self.store);
            }
        }
        let enablement = &self.enablement;
        let cleared = self
            .store
            .apply_enablement(&|link_id, instance| enablement.decide(link_id, instance), self.config.retention);
        writes.extend(cleared);

        writes
    }

    fn apply_calculated(&mut self, owner: &str, instance: Option<usize>, result: Option<Value>) -> bool {
        let item_type = match self.questionnaire.find_item(owner) {
            Some(item) => item.item_type,
            None => return false,
        };
        let path: Vec<usize> = instance.into_iter().collect();

        let answers = match result {
            // A successfully empty result clears the computed answer.
            None => Vec::new(),
            Some(value) => match AnswerValue::from_json(item_type, &value) {
                Ok(answer) => vec![answer],
                Err(error) => {
                    log::warn!("calculated result for '{owner}' rejected: {error}");
                    return false;
                }
            },
        };

        match self.store.set_answer(owner, &path, answers, WriteSource::Calculated) {
            Ok(WriteOutcome::Applied) => true,
            Ok(_) => false,
            Err(error) => {
                log::warn!("calculated write to '{owner}' failed: {error}");
                false
            }
        }
    }

    // Focus resource for a binding: its repeat instance subtree when
    // scoped, otherwise the full response snapshot (handled by the caller).
    fn binding_focus(&self, binding: &crate::registry::ExpressionBinding, instance: Option<usize>) -> Option<Value> {
        let instance = instance?;
        let owner = binding.owner.as_deref()?;
        let group = self.registry.repeat_scope_of(owner)?;
        self.store.instance_json(group, instance)
    }

    /// Population contexts visible to an item: the results of
    /// itemPopulationContext declarations on the item and its ancestors,
    /// nearest declaration winning per name. The nearest repeating
    /// ancestor is read at the item's own instance, outer groups at their
    /// first.
    pub(crate) fn push_population_contexts(
        &self,
        owner: &str,
        instance: Option<usize>,
        variables: &mut FxHashMap<String, Value>,
    ) {
        let scope = self.registry.repeat_scope_of(owner).map(str::to_string);
        let mut inserted: FxHashSet<String> = FxHashSet::default();
        let mut cursor = Some(owner.to_string());
        while let Some(link_id) = cursor {
            let index = if scope.as_deref() == Some(link_id.as_str()) {
                instance.unwrap_or(0)
            } else {
                0
            };
            if let Some((name, resource)) = self.instance_contexts.get(&(link_id.clone(), index)) {
                if inserted.insert(name.clone()) {
                    variables.insert(name.clone(), resource.clone());
                }
            }
            cursor = self.registry.parent_of(&link_id).map(str::to_string);
        }
    }

    // Collect the values of every variable this binding reads: resolved
    // producer results from the pass cache, plus any population contexts
    // in scope.
    fn resolve_binding_variables(
        &self,
        node: &NodeKey,
        binding: &crate::registry::ExpressionBinding,
        instance: Option<usize>,
    ) -> FxHashMap<String, Value> {
        let mut variables = FxHashMap::default();

        if let Some(owner) = binding.owner.as_deref() {
            self.push_population_contexts(owner, instance, &mut variables);
        }

        if let Some(deps) = self.resolver.deps_of(node) {
            for (name, producer) in &deps.variables {
                let Some(producer) = producer else {
                    continue; // external name, served from the launch map
                };
                let producer_scope = self
                    .registry
                    .binding(*producer)
                    .owner
                    .as_deref()
                    .and_then(|owner| self.registry.repeat_scope_of(owner));
                let producer_node = NodeKey::Binding {
                    id: *producer,
                    instance: if producer_scope.is_some() { instance } else { None },
                };
                if let Some(value) = self.var_values.get(&producer_node) {
                    variables.insert(name.clone(), value.clone());
                }
            }
        }

        variables
    }

    pub(crate) fn response_snapshot(&self) -> Value {
        serde_json::to_value(self.store.to_response(self.questionnaire.url.clone(), false))
            .unwrap_or(Value::Null)
    }

    fn record_error(
        &mut self,
        binding: &crate::registry::ExpressionBinding,
        instance: Option<usize>,
        error: ExpressionError,
    ) {
        let owner = binding.owner.as_deref().unwrap_or("<questionnaire>");
        log::warn!("expression on '{owner}' failed: {error} (expression: {})", binding.expression);
        self.expression_errors.insert((binding.id, instance), error);
    }

    fn clear_error(&mut self, id: crate::registry::BindingId, instance: Option<usize>) {
        self.expression_errors.shift_remove(&(id, instance));
    }
}

impl std::fmt::Debug for FormSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FormSession")
            .field("questionnaire", &self.questionnaire.url)
            .field("diagnostics", &self.diagnostics.len())
            .finish_non_exhaustive()
    }
}

fn collection_value(values: Vec<Value>) -> Value {
    match values.len() {
        1 => values.into_iter().next().unwrap_or(Value::Null),
        _ => Value::Array(values),
    }
}
