//! Expression registry
//!
//! Built by one traversal of the definition tree at load time. Catalogs
//! every declared expression binding keyed by owning item and kind, and
//! resolves variable names with subtree shadowing. The registry never
//! evaluates anything; it only needs rebuilding when the tree's shape
//! changes, not on answer edits.

mod extensions;

pub use extensions::{
    EXT_ANSWER_EXPRESSION, EXT_CALCULATED_EXPRESSION, EXT_ENABLE_WHEN_EXPRESSION,
    EXT_INITIAL_EXPRESSION, EXT_ITEM_POPULATION_CONTEXT, EXT_LAUNCH_CONTEXT, EXT_VARIABLE,
    binding_kind_for,
};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::model::{Extension, Questionnaire};

/// Stable handle for one expression binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub(crate) u32);

/// What role a declared expression plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExpressionKind {
    /// Named value available to other expressions in scope
    Variable,
    /// Result becomes the owning item's answer
    Calculated,
    /// Boolean condition on the owning item's enabled state
    EnableWhen,
    /// Seeds the owning item's answer during population
    Initial,
    /// Establishes the population context (and repeat fan-out) of a group
    PopulationContext,
    /// Produces the owning item's permitted answers
    AnswerOptions,
}

/// Language of the expression text
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpressionLanguage {
    /// `text/fhirpath` - evaluated through the expression backend
    FhirPath,
    /// `application/x-fhir-query` - resolved by the population fetcher
    FhirQuery,
}

/// One declared expression, immutable after the registry build
#[derive(Debug, Clone)]
pub struct ExpressionBinding {
    /// Registry handle
    pub id: BindingId,
    /// Owning item, or `None` for questionnaire-level declarations
    pub owner: Option<String>,
    /// Role of the expression
    pub kind: ExpressionKind,
    /// Declared name (variables and population contexts)
    pub name: Option<String>,
    /// Raw expression text
    pub expression: String,
    /// Expression language
    pub language: ExpressionLanguage,
}

/// A declared launch context (patient, user, encounter, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchContextDecl {
    /// Context name code, e.g. `patient`
    pub name: String,
    /// Expected resource types, informational
    pub resource_types: Vec<String>,
}

/// Catalog of every expression binding in one questionnaire
#[derive(Debug, Default)]
pub struct ExpressionRegistry {
    bindings: Vec<ExpressionBinding>,
    by_owner: FxHashMap<String, Vec<BindingId>>,
    global_variables: Vec<BindingId>,
    item_variables: FxHashMap<String, Vec<BindingId>>,
    parent_of: FxHashMap<String, Option<String>>,
    repeat_scope_of: FxHashMap<String, String>,
    launch_contexts: Vec<LaunchContextDecl>,
}

impl ExpressionRegistry {
    /// Build the registry from a definition tree in one traversal
    pub fn build(questionnaire: &Questionnaire) -> Self {
        let mut registry = Self::default();

        for extension in &questionnaire.extension {
            if let Some(decl) = parse_launch_context(extension) {
                registry.launch_contexts.push(decl);
                continue;
            }
            registry.add_from_extension(extension, None);
        }

        // One pass over the item tree: record parentage, repeat scopes and
        // every item-level binding.
        questionnaire.walk_items(|item, parent| {
            registry
                .parent_of
                .insert(item.link_id.clone(), parent.map(|p| p.link_id.clone()));

            if let Some(parent) = parent {
                let scope = if parent.is_repeat_group() {
                    Some(parent.link_id.clone())
                } else {
                    registry.repeat_scope_of.get(&parent.link_id).cloned()
                };
                if let Some(scope) = scope {
                    registry.repeat_scope_of.insert(item.link_id.clone(), scope);
                }
            }

            for extension in &item.extension {
                registry.add_from_extension(extension, Some(&item.link_id));
            }
        });

        registry
    }

    fn add_from_extension(&mut self, extension: &Extension, owner: Option<&str>) {
        let Some(kind) = binding_kind_for(&extension.url) else {
            return;
        };
        let Some(def) = &extension.value_expression else {
            return;
        };
        let Some(expression) = &def.expression else {
            return;
        };
        let language = match def.language.as_deref() {
            Some("text/fhirpath") | None => ExpressionLanguage::FhirPath,
            Some("application/x-fhir-query") => ExpressionLanguage::FhirQuery,
            Some(other) => {
                log::debug!("skipping expression in unsupported language '{other}'");
                return;
            }
        };
        // Only variables may be queries; everything else must be fhirpath.
        if language == ExpressionLanguage::FhirQuery && kind != ExpressionKind::Variable {
            log::debug!("skipping {kind:?} binding declared as x-fhir-query");
            return;
        }

        let id = BindingId(self.bindings.len() as u32);
        let binding = ExpressionBinding {
            id,
            owner: owner.map(str::to_string),
            kind,
            name: def.name.clone(),
            expression: expression.clone(),
            language,
        };

        match (&binding.owner, kind) {
            (None, ExpressionKind::Variable) => self.global_variables.push(id),
            (Some(link_id), ExpressionKind::Variable) => {
                self.item_variables.entry(link_id.clone()).or_default().push(id);
            }
            _ => {}
        }
        if let Some(link_id) = &binding.owner {
            self.by_owner.entry(link_id.clone()).or_default().push(id);
        }
        self.bindings.push(binding);
    }

    /// Look up a binding by handle
    pub fn binding(&self, id: BindingId) -> &ExpressionBinding {
        &self.bindings[id.0 as usize]
    }

    /// All bindings, in declaration order
    pub fn bindings(&self) -> &[ExpressionBinding] {
        &self.bindings
    }

    /// Bindings declared on one item
    pub fn bindings_of(&self, link_id: &str) -> &[BindingId] {
        self.by_owner.get(link_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The binding of a given kind on one item, if declared
    pub fn binding_of_kind(&self, link_id: &str, kind: ExpressionKind) -> Option<&ExpressionBinding> {
        self.bindings_of(link_id)
            .iter()
            .map(|id| self.binding(*id))
            .find(|b| b.kind == kind)
    }

    /// All bindings of one kind, in declaration order
    pub fn of_kind(&self, kind: ExpressionKind) -> impl Iterator<Item = &ExpressionBinding> {
        self.bindings.iter().filter(move |b| b.kind == kind)
    }

    /// Declared launch contexts
    pub fn launch_contexts(&self) -> &[LaunchContextDecl] {
        &self.launch_contexts
    }

    /// Resolve a `%name` reference seen at `from`, honoring subtree
    /// shadowing: the nearest declaration on the ancestor chain wins,
    /// then questionnaire-level variables.
    pub fn resolve_variable(&self, name: &str, from: Option<&str>) -> Option<BindingId> {
        let mut cursor = from.map(str::to_string);
        while let Some(link_id) = cursor {
            if let Some(declared) = self.item_variables.get(&link_id) {
                if let Some(found) = declared
                    .iter()
                    .rev()
                    .find(|id| self.binding(**id).name.as_deref() == Some(name))
                {
                    return Some(*found);
                }
            }
            cursor = self.parent_of.get(&link_id).cloned().flatten();
        }
        self.global_variables
            .iter()
            .find(|id| self.binding(**id).name.as_deref() == Some(name))
            .copied()
    }

    /// Nearest repeating-group ancestor of an item, if any
    pub fn repeat_scope_of(&self, link_id: &str) -> Option<&str> {
        self.repeat_scope_of.get(link_id).map(String::as_str)
    }

    /// Parent linkId of an item
    pub fn parent_of(&self, link_id: &str) -> Option<&str> {
        self.parent_of.get(link_id).and_then(|p| p.as_deref())
    }

    /// Whether the definition knows this linkId at all
    pub fn contains_item(&self, link_id: &str) -> bool {
        self.parent_of.contains_key(link_id)
    }

    /// LinkIds owned by a calculated expression; their answer nodes are
    /// not directly user-editable
    pub fn computed_items(&self) -> FxHashSet<String> {
        self.of_kind(ExpressionKind::Calculated)
            .filter_map(|b| b.owner.clone())
            .collect()
    }
}

fn parse_launch_context(extension: &Extension) -> Option<LaunchContextDecl> {
    if extension.url != EXT_LAUNCH_CONTEXT {
        return None;
    }
    let mut name = None;
    let mut resource_types = Vec::new();
    for nested in &extension.extension {
        match nested.url.as_str() {
            "name" => {
                name = nested
                    .value_coding
                    .as_ref()
                    .and_then(|c| c.code.clone())
                    .or_else(|| nested.value_id.clone());
            }
            "type" => {
                if let Some(code) = &nested.value_code {
                    resource_types.push(code.clone());
                }
            }
            _ => {}
        }
    }
    name.map(|name| LaunchContextDecl { name, resource_types })
}
