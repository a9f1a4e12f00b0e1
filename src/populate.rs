//! Population engine
//!
//! Seeds the answer tree from external clinical data before (or around)
//! interactive editing. The engine only composes query strings and
//! interprets results; transport belongs to the injected
//! [`ResourceFetcher`]. Population writes bypass the disabled-write guard
//! because they happen before enablement settles.

use async_trait::async_trait;
use futures::future::join_all;
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde_json::Value;

use crate::diagnostics::{Diagnostic, DiagnosticCode, Severity};
use crate::error::{ExpressionError, FetchError, FormError, Result};
use crate::eval::EvalContext;
use crate::graph::{DependencyResolver, NodeKey};
use crate::model::AnswerValue;
use crate::registry::{BindingId, ExpressionBinding, ExpressionKind, ExpressionLanguage};
use crate::session::{Changes, FormSession};
use crate::store::{WriteOutcome, WriteSource};

/// Options forwarded verbatim to the fetch callback (auth headers, server
/// base, ...); the engine never interprets them
#[derive(Debug, Clone, Default)]
pub struct RequestConfig {
    /// Base url of the clinical data server
    pub source_server: Option<String>,
    /// Additional request headers
    pub headers: Vec<(String, String)>,
}

/// The injected resource fetch callback.
///
/// Receives a composed query such as `Observation?code=29463-7&subject=123`
/// and returns the Bundle or Resource as raw json.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Execute one query against the clinical data source
    async fn fetch(&self, query: &str, config: &RequestConfig)
    -> std::result::Result<Value, FetchError>;
}

/// Resources handed in by the launching application
#[derive(Debug, Clone, Default)]
pub struct LaunchContext {
    /// The patient in context
    pub patient: Option<Value>,
    /// The practitioner using the form
    pub user: Option<Value>,
    /// The encounter in context
    pub encounter: Option<Value>,
    /// Further declared launch contexts, by name
    pub extras: Vec<(String, Value)>,
}

impl LaunchContext {
    /// Context with just a patient
    pub fn for_patient(patient: Value) -> Self {
        Self { patient: Some(patient), ..Self::default() }
    }

    /// Add the practitioner in context
    pub fn with_user(mut self, user: Value) -> Self {
        self.user = Some(user);
        self
    }

    /// Add the encounter in context
    pub fn with_encounter(mut self, encounter: Value) -> Self {
        self.encounter = Some(encounter);
        self
    }

    /// Add a named launch context resource
    pub fn with_extra(mut self, name: impl Into<String>, resource: Value) -> Self {
        self.extras.push((name.into(), resource));
        self
    }

    fn into_map(self) -> FxHashMap<String, Value> {
        let mut map = FxHashMap::default();
        if let Some(patient) = self.patient {
            map.insert("patient".to_string(), patient);
        }
        if let Some(user) = self.user {
            map.insert("user".to_string(), user);
        }
        if let Some(encounter) = self.encounter {
            map.insert("encounter".to_string(), encounter);
        }
        for (name, resource) in self.extras {
            map.insert(name, resource);
        }
        map
    }
}

/// Overall result of a population run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopulationStatus {
    /// Every expression and fetch succeeded
    Success,
    /// Some items could not be populated; see the issues
    PartialFailure,
    /// Nothing could be populated
    Failure,
}

/// One thing that went wrong during population
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationIssue {
    /// The item that could not be populated, when attributable
    pub link_id: Option<String>,
    /// The query that failed, for fetch problems
    pub query: Option<String>,
    /// What happened
    pub message: String,
}

/// The holistic outcome of a population run: never a bare boolean
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationOutcome {
    /// Success, partial failure with an item list, or failure
    pub status: PopulationStatus,
    /// Everything that went wrong, in pipeline order
    pub issues: Vec<PopulationIssue>,
}

/// An in-flight single-item repopulation; apply is token-checked so a
/// superseded request discards its stale response
#[derive(Debug)]
pub struct RepopulateRequest {
    token: u64,
    link_id: String,
    queries: Vec<(BindingId, Option<String>, String)>,
}

impl RepopulateRequest {
    /// The item being repopulated
    pub fn link_id(&self) -> &str {
        &self.link_id
    }
}

/// Fetched context for one repopulation request
#[derive(Debug)]
pub struct RepopulateContext {
    resources: Vec<(BindingId, Option<String>, std::result::Result<Value, FetchError>)>,
}

/// Run the fetch phase of a repopulation.
///
/// Deliberately free of the session borrow: a host can start a newer
/// request while an older fetch is still in flight; the older apply will
/// then be discarded by its token.
pub async fn fetch_repopulate(
    request: &RepopulateRequest,
    fetcher: &dyn ResourceFetcher,
    config: &RequestConfig,
) -> RepopulateContext {
    let fetches = request.queries.iter().map(|(id, name, query)| async move {
        let result = fetcher.fetch(query, config).await;
        (*id, name.clone(), result)
    });
    RepopulateContext { resources: join_all(fetches).await }
}

static QUERY_TEMPLATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{(.+?)\}\}").expect("query template regex"));

impl FormSession {
    /// Populate the form from external clinical data.
    ///
    /// Pipeline: resolve query variables through the fetcher, establish
    /// item population contexts (fanning repeating groups out to one
    /// instance per matched resource), evaluate initial expressions, then
    /// settle enablement over the seeded tree.
    pub async fn populate(
        &mut self,
        fetcher: &dyn ResourceFetcher,
        config: &RequestConfig,
        launch: LaunchContext,
    ) -> PopulationOutcome {
        self.launch.extend(launch.into_map());
        for declared in self.registry.launch_contexts() {
            if !self.launch.contains_key(&declared.name) {
                log::debug!("declared launch context '%{}' was not supplied", declared.name);
            }
        }

        let mut issues: Vec<PopulationIssue> = Vec::new();
        let mut seeded = 0usize;

        let populated_items: Vec<String> = self
            .registry
            .bindings()
            .iter()
            .filter(|b| matches!(b.kind, ExpressionKind::Initial | ExpressionKind::PopulationContext))
            .filter_map(|b| b.owner.clone())
            .collect();
        for link_id in &populated_items {
            self.store.mark_populating(link_id, true);
        }

        // 1. Questionnaire-level query variables, fetched concurrently.
        let query_bindings: Vec<ExpressionBinding> = self
            .registry
            .bindings()
            .iter()
            .filter(|b| b.kind == ExpressionKind::Variable && b.language == ExpressionLanguage::FhirQuery)
            .cloned()
            .collect();

        let mut renders: Vec<(ExpressionBinding, String)> = Vec::new();
        for binding in query_bindings {
            match self.render_query(&binding.expression) {
                Ok(query) => renders.push((binding, query)),
                Err(error) => issues.push(PopulationIssue {
                    link_id: binding.owner.clone(),
                    query: Some(binding.expression.clone()),
                    message: error.to_string(),
                }),
            }
        }

        let fetches = renders.into_iter().map(|(binding, query)| async move {
            let result = fetcher.fetch(&query, config).await;
            (binding, query, result)
        });
        for (binding, query, result) in join_all(fetches).await {
            match result {
                Ok(resource) => {
                    if let Some(name) = &binding.name {
                        self.launch.insert(name.clone(), resource.clone());
                    }
                    self.var_values.insert(NodeKey::binding(binding.id), resource);
                    seeded += 1;
                }
                Err(error) => {
                    log::warn!("population fetch failed: {error}");
                    issues.push(PopulationIssue {
                        link_id: binding.owner.clone(),
                        query: Some(query),
                        message: error.to_string(),
                    });
                }
            }
        }

        // 2. Item population contexts; a repeating group matching N
        // resources becomes exactly N instances with private contexts.
        let context_bindings: Vec<ExpressionBinding> = self
            .registry
            .of_kind(ExpressionKind::PopulationContext)
            .cloned()
            .collect();
        for binding in context_bindings {
            match self.establish_population_context(&binding) {
                Ok(contexts) => seeded += contexts,
                Err(error) => issues.push(PopulationIssue {
                    link_id: binding.owner.clone(),
                    query: None,
                    message: error.to_string(),
                }),
            }
        }

        // The fan-out may have changed the tree's shape.
        self.resolver =
            DependencyResolver::build(&self.registry, &self.store.repeat_instance_counts());

        // 3. Initial expressions, instance by instance for scoped items.
        let initial_bindings: Vec<ExpressionBinding> = self
            .registry
            .of_kind(ExpressionKind::Initial)
            .cloned()
            .collect();
        for binding in initial_bindings {
            let Some(owner) = binding.owner.clone() else {
                continue;
            };
            let instances: Vec<Option<usize>> = match self.registry.repeat_scope_of(&owner) {
                Some(group) => (0..self.store.instance_count(group).max(1)).map(Some).collect(),
                None => vec![None],
            };
            for instance in instances {
                match self.seed_initial(&binding, instance) {
                    Ok(true) => seeded += 1,
                    Ok(false) => {}
                    Err(error) => issues.push(PopulationIssue {
                        link_id: Some(owner.clone()),
                        query: None,
                        message: error.to_string(),
                    }),
                }
            }
        }

        for link_id in &populated_items {
            self.store.mark_populating(link_id, false);
        }

        // 4. Settle expressions and enablement over the seeded tree.
        self.recompute(Changes::All);

        let status = if issues.is_empty() {
            PopulationStatus::Success
        } else if seeded > 0 {
            PopulationStatus::PartialFailure
        } else {
            PopulationStatus::Failure
        };
        if status != PopulationStatus::Success {
            let failed: Vec<String> = issues
                .iter()
                .filter_map(|issue| issue.link_id.clone())
                .collect();
            self.diagnostics.push(Diagnostic {
                severity: Severity::Warning,
                code: if status == PopulationStatus::Failure {
                    DiagnosticCode::PopulationFetch
                } else {
                    DiagnosticCode::PopulationPartial
                },
                message: format!(
                    "population completed with {} issue(s); affected items: [{}]",
                    issues.len(),
                    failed.join(", ")
                ),
                link_id: None,
            });
        }
        log::info!("population finished: {status:?}, {} issue(s)", issues.len());

        PopulationOutcome { status, issues }
    }

    /// Start repopulating one item with freshly fetched context.
    ///
    /// Bumps the request token: any older in-flight repopulation becomes
    /// stale and its apply will be discarded (last request wins).
    pub fn begin_repopulate(&mut self, link_id: &str) -> Result<RepopulateRequest> {
        let binding = self
            .registry
            .binding_of_kind(link_id, ExpressionKind::Initial)
            .cloned()
            .ok_or_else(|| FormError::InvalidDefinition {
                message: format!("'{link_id}' has no initialExpression to repopulate"),
            })?;

        // Re-fetch exactly the query variables this item's expression reads.
        let node = NodeKey::binding(binding.id);
        let mut queries = Vec::new();
        if let Some(deps) = self.resolver.deps_of(&node) {
            for (_, producer) in &deps.variables {
                let Some(producer) = producer else { continue };
                let producer_binding = self.registry.binding(*producer);
                if producer_binding.language != ExpressionLanguage::FhirQuery {
                    continue;
                }
                match self.render_query(&producer_binding.expression) {
                    Ok(query) => {
                        queries.push((*producer, producer_binding.name.clone(), query));
                    }
                    Err(error) => {
                        return Err(FormError::Expression(error));
                    }
                }
            }
        }

        self.repopulate_token += 1;
        self.store.mark_populating(link_id, true);
        Ok(RepopulateRequest { token: self.repopulate_token, link_id: link_id.to_string(), queries })
    }

    /// Apply a finished repopulation.
    ///
    /// Returns `Ok(false)` when the request was superseded by a newer one;
    /// the stale response is discarded without touching the store.
    pub fn apply_repopulate(
        &mut self,
        request: &RepopulateRequest,
        context: RepopulateContext,
    ) -> Result<bool> {
        if request.token != self.repopulate_token {
            log::debug!(
                "discarding stale repopulate response for '{}' (token {} < {})",
                request.link_id,
                request.token,
                self.repopulate_token
            );
            return Ok(false);
        }

        for (id, name, result) in context.resources {
            match result {
                Ok(resource) => {
                    if let Some(name) = name {
                        self.launch.insert(name, resource.clone());
                    }
                    self.var_values.insert(NodeKey::binding(id), resource);
                }
                Err(error) => {
                    self.store.mark_populating(&request.link_id, false);
                    return Err(error.into());
                }
            }
        }

        let binding = self
            .registry
            .binding_of_kind(&request.link_id, ExpressionKind::Initial)
            .cloned()
            .ok_or_else(|| FormError::UnknownLinkId { link_id: request.link_id.clone() })?;
        self.seed_initial(&binding, None).map_err(FormError::Expression)?;

        self.store.mark_populating(&request.link_id, false);
        self.recompute(Changes::Dirty(vec![crate::store::DirtyKey {
            link_id: request.link_id.clone(),
            instance: None,
        }]));
        Ok(true)
    }

    /// Convenience wrapper: begin, fetch and apply one repopulation
    pub async fn repopulate(
        &mut self,
        link_id: &str,
        fetcher: &dyn ResourceFetcher,
        config: &RequestConfig,
    ) -> Result<bool> {
        let request = self.begin_repopulate(link_id)?;
        let context = fetch_repopulate(&request, fetcher, config).await;
        self.apply_repopulate(&request, context)
    }

    // Evaluate one itemPopulationContext and record per-instance contexts;
    // returns how many contexts were established.
    fn establish_population_context(&mut self, binding: &ExpressionBinding) -> std::result::Result<usize, ExpressionError> {
        let Some(owner) = binding.owner.clone() else {
            return Ok(0);
        };
        let Some(name) = binding.name.clone() else {
            log::debug!("itemPopulationContext on '{owner}' has no name; skipping");
            return Ok(0);
        };

        let snapshot = self.response_snapshot();
        let mut variables = self.collect_unscoped_variables(binding);
        self.push_population_contexts(&owner, None, &mut variables);
        let context = EvalContext { focus: &snapshot, variables: &variables, launch: &self.launch };
        let values = self.evaluator.evaluate(&binding.expression, &context)?;

        let is_repeat_group = self
            .questionnaire
            .find_item(&owner)
            .is_some_and(|item| item.is_repeat_group());

        if is_repeat_group {
            // Exactly one instance per matched resource, never fewer than
            // one node so the group stays renderable.
            let wanted = values.len().max(1);
            let current = self.store.instance_count(&owner);
            for _ in current..wanted {
                self.store
                    .add_instance(&owner, &[])
                    .map_err(|e| ExpressionError::Runtime { message: e.to_string() })?;
            }
            for index in (wanted..current).rev() {
                self.store
                    .remove_instance(&owner, index, &[])
                    .map_err(|e| ExpressionError::Runtime { message: e.to_string() })?;
            }
            for (index, value) in values.iter().enumerate() {
                self.instance_contexts
                    .insert((owner.clone(), index), (name.clone(), value.clone()));
            }
            Ok(values.len())
        } else {
            match values.into_iter().next() {
                Some(value) => {
                    self.instance_contexts.insert((owner.clone(), 0), (name, value));
                    Ok(1)
                }
                None => Ok(0),
            }
        }
    }

    // Evaluate an initialExpression and write the result through the store
    // with population semantics; true when an answer was written.
    fn seed_initial(
        &mut self,
        binding: &ExpressionBinding,
        instance: Option<usize>,
    ) -> std::result::Result<bool, ExpressionError> {
        let Some(owner) = binding.owner.clone() else {
            return Ok(false);
        };
        let Some(item) = self.questionnaire.find_item(&owner) else {
            return Ok(false);
        };
        let item_type = item.item_type;
        let repeats = item.repeats;

        let focus = match instance {
            Some(index) => {
                let group = self.registry.repeat_scope_of(&owner).map(str::to_string);
                group
                    .and_then(|group| self.store.instance_json(&group, index))
                    .unwrap_or(Value::Null)
            }
            None => self.response_snapshot(),
        };
        let variables = self.resolve_population_variables(binding, instance);
        let context = EvalContext { focus: &focus, variables: &variables, launch: &self.launch };
        let values = self.evaluator.evaluate(&binding.expression, &context)?;

        let mut answers = Vec::new();
        for value in &values {
            answers.push(AnswerValue::from_json(item_type, value)?);
            if !repeats {
                break;
            }
        }
        if answers.is_empty() {
            return Ok(false);
        }

        let path: Vec<usize> = instance.into_iter().collect();
        match self
            .store
            .set_answer(&owner, &path, answers, WriteSource::Population)
        {
            Ok(WriteOutcome::Applied) => Ok(true),
            Ok(_) => Ok(false),
            Err(error) => Err(ExpressionError::Runtime { message: error.to_string() }),
        }
    }

    fn resolve_population_variables(
        &self,
        binding: &ExpressionBinding,
        instance: Option<usize>,
    ) -> FxHashMap<String, Value> {
        let mut variables = self.collect_unscoped_variables(binding);
        if let Some(owner) = binding.owner.as_deref() {
            self.push_population_contexts(owner, instance, &mut variables);
        }
        variables
    }

    // Values of already-resolved (unscoped) variable producers this
    // binding reads, mainly fetched query variables.
    fn collect_unscoped_variables(&self, binding: &ExpressionBinding) -> FxHashMap<String, Value> {
        let mut variables = FxHashMap::default();
        let refs = crate::graph::extract_refs(&binding.expression);
        for name in refs.variables {
            if let Some(producer) = self.registry.resolve_variable(&name, binding.owner.as_deref()) {
                if let Some(value) = self.var_values.get(&NodeKey::binding(producer)) {
                    variables.insert(name, value.clone());
                }
            }
        }
        variables
    }

    // Substitute `{{expression}}` embeddings in an x-fhir-query template.
    fn render_query(&self, template: &str) -> std::result::Result<String, ExpressionError> {
        let mut rendered = String::new();
        let mut last = 0usize;
        let empty = FxHashMap::default();
        let focus = Value::Null;

        for captures in QUERY_TEMPLATE_RE.captures_iter(template) {
            let whole = captures.get(0).map(|m| (m.start(), m.end())).unwrap_or((0, 0));
            let expression = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
            rendered.push_str(&template[last..whole.0]);

            let context = EvalContext { focus: &focus, variables: &empty, launch: &self.launch };
            match self.evaluator.evaluate_single(expression.trim(), &context)? {
                Some(Value::String(text)) => rendered.push_str(&text),
                Some(Value::Number(number)) => rendered.push_str(&number.to_string()),
                Some(other) => {
                    return Err(ExpressionError::Runtime {
                        message: format!("query embedding '{expression}' produced {other}"),
                    });
                }
                None => {
                    return Err(ExpressionError::Runtime {
                        message: format!("query embedding '{expression}' produced nothing"),
                    });
                }
            }
            last = whole.1;
        }
        rendered.push_str(&template[last..]);
        Ok(rendered)
    }
}
