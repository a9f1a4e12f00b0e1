//! Dependency resolution
//!
//! One explicit producer/consumer graph over expression bindings and answer
//! values replaces per-field subscription wiring. The resolver computes a
//! topological evaluation order by depth-first traversal; expressions caught
//! in a cycle are excluded from evaluation for the whole session and
//! surfaced once as a structural diagnostic.
//!
//! The graph is rebuilt when the tree's shape changes (a repeat instance
//! added or removed introduces or retires scoped binding nodes), never on
//! plain answer edits.

mod extract;

pub use extract::{ExtractedRefs, extract_refs};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::registry::{BindingId, ExpressionKind, ExpressionRegistry};

/// One vertex of the dependency graph.
///
/// Answer nodes carry an optional repeat instance index; a scoped edit is
/// fed to the resolver both with and without its instance so unscoped
/// consumers observe it too.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NodeKey {
    /// The current answer(s) of an item
    Answer {
        /// Item linkId
        link_id: String,
        /// Repeat instance of the nearest repeating ancestor, when scoped
        instance: Option<usize>,
    },
    /// A declared expression binding
    Binding {
        /// Registry handle
        id: BindingId,
        /// Repeat instance, when the owner sits inside a repeating group
        instance: Option<usize>,
    },
}

impl NodeKey {
    /// Unscoped answer node
    pub fn answer(link_id: impl Into<String>) -> Self {
        NodeKey::Answer { link_id: link_id.into(), instance: None }
    }

    /// Unscoped binding node
    pub fn binding(id: BindingId) -> Self {
        NodeKey::Binding { id, instance: None }
    }
}

/// Resolved dependency set of one binding node
#[derive(Debug, Clone, Default)]
pub struct DependencySet {
    /// Variable references resolved to their producing binding, or kept as
    /// external context names when nothing in the questionnaire declares them
    pub variables: Vec<(String, Option<BindingId>)>,
    /// Answer linkIds the expression reads
    pub answers: Vec<String>,
}

impl DependencySet {
    /// Names that resolve to nothing declared: launch context and
    /// environment names like `%patient` or `%resource`
    pub fn externals(&self) -> impl Iterator<Item = &str> {
        self.variables
            .iter()
            .filter(|(_, producer)| producer.is_none())
            .map(|(name, _)| name.as_str())
    }
}

/// The dependency graph and its evaluation order
#[derive(Debug, Default)]
pub struct DependencyResolver {
    nodes: Vec<NodeKey>,
    consumers: FxHashMap<NodeKey, Vec<NodeKey>>,
    deps: FxHashMap<NodeKey, DependencySet>,
    order: Vec<NodeKey>,
    excluded: FxHashSet<NodeKey>,
    cycles: Vec<Vec<String>>,
}

impl DependencyResolver {
    /// Build the graph for the current tree shape.
    ///
    /// `instance_counts` maps each repeating group to its current number of
    /// instances; bindings owned by items inside such a group get one node
    /// per instance so scopes stay private to their instance.
    pub fn build(registry: &ExpressionRegistry, instance_counts: &FxHashMap<String, usize>) -> Self {
        let mut resolver = Self::default();

        for binding in registry.bindings() {
            let scope = binding
                .owner
                .as_deref()
                .and_then(|owner| registry.repeat_scope_of(owner));

            match scope {
                None => resolver.add_binding_node(registry, binding.id, None, None),
                Some(group) => {
                    let count = instance_counts.get(group).copied().unwrap_or(1);
                    for instance in 0..count {
                        resolver.add_binding_node(registry, binding.id, Some(instance), Some(group));
                    }
                }
            }
        }

        resolver.toposort(registry);
        resolver
    }

    fn add_binding_node(
        &mut self,
        registry: &ExpressionRegistry,
        id: BindingId,
        instance: Option<usize>,
        scope: Option<&str>,
    ) {
        let binding = registry.binding(id);
        let node = NodeKey::Binding { id, instance };
        let refs = extract_refs(&binding.expression);

        let mut deps = DependencySet::default();
        for name in refs.variables {
            let producer = registry.resolve_variable(&name, binding.owner.as_deref());
            if let Some(producer) = producer {
                let producer_scope = registry
                    .binding(producer)
                    .owner
                    .as_deref()
                    .and_then(|owner| registry.repeat_scope_of(owner));
                let producer_instance = if producer_scope.is_some() && producer_scope == scope {
                    instance
                } else {
                    None
                };
                self.add_edge(NodeKey::Binding { id: producer, instance: producer_instance }, node.clone());
            }
            deps.variables.push((name, producer));
        }
        for link_id in refs.answers {
            let answer_scope = registry.repeat_scope_of(&link_id);
            let answer_instance = if answer_scope.is_some() && answer_scope == scope {
                instance
            } else {
                None
            };
            let source = NodeKey::Answer { link_id: link_id.clone(), instance: answer_instance };
            self.add_edge(source, node.clone());
            deps.answers.push(link_id);
        }

        // A calculated expression is the producer of its owner's answer.
        if binding.kind == ExpressionKind::Calculated {
            if let Some(owner) = &binding.owner {
                self.add_edge(node.clone(), NodeKey::Answer { link_id: owner.clone(), instance });
                if instance.is_some() {
                    self.add_edge(node.clone(), NodeKey::answer(owner.clone()));
                }
            }
        }

        self.deps.insert(node.clone(), deps);
        self.push_node(node);
    }

    fn push_node(&mut self, node: NodeKey) {
        if !self.nodes.contains(&node) {
            self.nodes.push(node);
        }
    }

    fn add_edge(&mut self, from: NodeKey, to: NodeKey) {
        self.push_node(from.clone());
        self.push_node(to.clone());
        let consumers = self.consumers.entry(from).or_default();
        if !consumers.contains(&to) {
            consumers.push(to);
        }
    }

    // Depth-first topological sort with cycle detection. Nodes on a cycle
    // are collected, excluded from the order, and remembered for the
    // one-time structural diagnostic.
    fn toposort(&mut self, registry: &ExpressionRegistry) {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            InProgress,
            Done,
        }

        let mut marks: FxHashMap<NodeKey, Mark> = FxHashMap::default();
        let mut stack: Vec<NodeKey> = Vec::new();
        let mut post_order: Vec<NodeKey> = Vec::new();
        let mut cyclic: FxHashSet<NodeKey> = FxHashSet::default();

        fn visit(
            node: &NodeKey,
            consumers: &FxHashMap<NodeKey, Vec<NodeKey>>,
            marks: &mut FxHashMap<NodeKey, Mark>,
            stack: &mut Vec<NodeKey>,
            post_order: &mut Vec<NodeKey>,
            cyclic: &mut FxHashSet<NodeKey>,
        ) {
            match marks.get(node) {
                Some(Mark::Done) => return,
                Some(Mark::InProgress) => {
                    // Back edge: everything from the first occurrence of
                    // `node` on the stack participates in the cycle.
                    if let Some(start) = stack.iter().position(|n| n == node) {
                        for member in &stack[start..] {
                            cyclic.insert(member.clone());
                        }
                    }
                    return;
                }
                None => {}
            }

            marks.insert(node.clone(), Mark::InProgress);
            stack.push(node.clone());
            if let Some(next) = consumers.get(node) {
                for consumer in next {
                    visit(consumer, consumers, marks, stack, post_order, cyclic);
                }
            }
            stack.pop();
            marks.insert(node.clone(), Mark::Done);
            post_order.push(node.clone());
        }

        for node in &self.nodes {
            visit(node, &self.consumers, &mut marks, &mut stack, &mut post_order, &mut cyclic);
        }

        post_order.reverse();
        self.order = post_order
            .into_iter()
            .filter(|node| !cyclic.contains(node))
            .collect();

        if !cyclic.is_empty() {
            let mut members: Vec<String> = cyclic
                .iter()
                .map(|node| self.describe(node, registry))
                .collect();
            members.sort();
            self.cycles.push(members);
            self.excluded = cyclic;
        }
    }

    fn describe(&self, node: &NodeKey, registry: &ExpressionRegistry) -> String {
        match node {
            NodeKey::Answer { link_id, .. } => format!("answer '{link_id}'"),
            NodeKey::Binding { id, .. } => {
                let binding = registry.binding(*id);
                match (&binding.name, &binding.owner) {
                    (Some(name), _) => format!("variable '{name}'"),
                    (None, Some(owner)) => format!("{:?} expression on '{owner}'", binding.kind),
                    (None, None) => format!("{:?} expression", binding.kind),
                }
            }
        }
    }

    /// Producer-before-consumer evaluation order, cycles excluded
    pub fn order(&self) -> &[NodeKey] {
        &self.order
    }

    /// Whether a node was excluded because of a cycle
    pub fn is_excluded(&self, node: &NodeKey) -> bool {
        self.excluded.contains(node)
    }

    /// Detected cycles (one entry per build that found any), as
    /// human-readable member names
    pub fn cycles(&self) -> &[Vec<String>] {
        &self.cycles
    }

    /// Resolved dependency set of a binding node
    pub fn deps_of(&self, node: &NodeKey) -> Option<&DependencySet> {
        self.deps.get(node)
    }

    /// Downstream closure of a set of changed nodes: everything that
    /// directly or transitively consumes them
    pub fn affected_by<I>(&self, changed: I) -> FxHashSet<NodeKey>
    where
        I: IntoIterator<Item = NodeKey>,
    {
        let mut affected: FxHashSet<NodeKey> = FxHashSet::default();
        let mut frontier: Vec<NodeKey> = changed.into_iter().collect();

        while let Some(node) = frontier.pop() {
            if !affected.insert(node.clone()) {
                continue;
            }
            if let Some(consumers) = self.consumers.get(&node) {
                frontier.extend(consumers.iter().cloned());
            }
        }
        affected
    }

    /// Every binding node in the graph, in evaluation order
    pub fn binding_nodes(&self) -> impl Iterator<Item = &NodeKey> {
        self.order.iter().filter(|n| matches!(n, NodeKey::Binding { .. }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Questionnaire;
    use crate::registry::EXT_CALCULATED_EXPRESSION;
    use serde_json::json;

    fn build(value: serde_json::Value) -> (ExpressionRegistry, DependencyResolver) {
        let questionnaire: Questionnaire = serde_json::from_value(value).unwrap();
        let registry = ExpressionRegistry::build(&questionnaire);
        let resolver = DependencyResolver::build(&registry, &FxHashMap::default());
        (registry, resolver)
    }

    fn variable_ext(name: &str, expression: &str) -> serde_json::Value {
        json!({
            "url": crate::registry::EXT_VARIABLE,
            "valueExpression": {
                "name": name,
                "language": "text/fhirpath",
                "expression": expression
            }
        })
    }

    fn calculated_ext(expression: &str) -> serde_json::Value {
        json!({
            "url": EXT_CALCULATED_EXPRESSION,
            "valueExpression": { "language": "text/fhirpath", "expression": expression }
        })
    }

    #[test]
    fn variable_producer_orders_before_consumer() {
        let (registry, resolver) = build(json!({
            "resourceType": "Questionnaire",
            "extension": [
                variable_ext("painLevel", "%resource.item.where(linkId='pain-level').answer.value")
            ],
            "item": [
                { "linkId": "pain-level", "type": "integer" },
                {
                    "linkId": "pain-class",
                    "type": "choice",
                    "extension": [calculated_ext("iif(%painLevel < 5, 'Y', 'N')")]
                }
            ]
        }));

        let order = resolver.order();
        let variable = registry.resolve_variable("painLevel", None).unwrap();
        let calculated = registry
            .binding_of_kind("pain-class", ExpressionKind::Calculated)
            .unwrap()
            .id;

        let pos = |key: &NodeKey| order.iter().position(|n| n == key).unwrap();
        assert!(pos(&NodeKey::answer("pain-level")) < pos(&NodeKey::binding(variable)));
        assert!(pos(&NodeKey::binding(variable)) < pos(&NodeKey::binding(calculated)));
        assert!(pos(&NodeKey::binding(calculated)) < pos(&NodeKey::answer("pain-class")));
    }

    #[test]
    fn cycle_members_are_excluded_and_reported_once() {
        let (registry, resolver) = build(json!({
            "resourceType": "Questionnaire",
            "extension": [
                variable_ext("a", "%b + 1"),
                variable_ext("b", "%a + 1"),
                variable_ext("standalone", "1 + 1")
            ],
            "item": []
        }));

        assert_eq!(resolver.cycles().len(), 1);
        assert_eq!(resolver.cycles()[0].len(), 2);

        let a = registry.resolve_variable("a", None).unwrap();
        let b = registry.resolve_variable("b", None).unwrap();
        let standalone = registry.resolve_variable("standalone", None).unwrap();
        assert!(resolver.is_excluded(&NodeKey::binding(a)));
        assert!(resolver.is_excluded(&NodeKey::binding(b)));
        assert!(!resolver.is_excluded(&NodeKey::binding(standalone)));
        assert!(resolver.order().contains(&NodeKey::binding(standalone)));
    }

    #[test]
    fn affected_set_is_the_downstream_closure() {
        let (registry, resolver) = build(json!({
            "resourceType": "Questionnaire",
            "extension": [
                variable_ext("weight", "%resource.item.where(linkId='weight').answer.value"),
                variable_ext("doubled", "%weight * 2")
            ],
            "item": [
                { "linkId": "weight", "type": "decimal" },
                { "linkId": "unrelated", "type": "string" },
                {
                    "linkId": "display-weight",
                    "type": "decimal",
                    "extension": [calculated_ext("%doubled / 2")]
                }
            ]
        }));

        let affected = resolver.affected_by([NodeKey::answer("weight")]);
        let weight = registry.resolve_variable("weight", None).unwrap();
        let doubled = registry.resolve_variable("doubled", None).unwrap();
        assert!(affected.contains(&NodeKey::binding(weight)));
        assert!(affected.contains(&NodeKey::binding(doubled)));
        assert!(affected.contains(&NodeKey::answer("display-weight")));

        let unrelated = resolver.affected_by([NodeKey::answer("unrelated")]);
        assert!(!unrelated.contains(&NodeKey::binding(weight)));
    }

    #[test]
    fn scoped_bindings_get_one_node_per_instance() {
        let questionnaire: Questionnaire = serde_json::from_value(json!({
            "resourceType": "Questionnaire",
            "item": [{
                "linkId": "meds",
                "type": "group",
                "repeats": true,
                "item": [
                    { "linkId": "med-dose", "type": "decimal" },
                    {
                        "linkId": "med-dose-doubled",
                        "type": "decimal",
                        "extension": [calculated_ext(
                            "%context.item.where(linkId='med-dose').answer.value * 2"
                        )]
                    }
                ]
            }]
        }))
        .unwrap();
        let registry = ExpressionRegistry::build(&questionnaire);

        let mut counts = FxHashMap::default();
        counts.insert("meds".to_string(), 3);
        let resolver = DependencyResolver::build(&registry, &counts);

        let calculated = registry
            .binding_of_kind("med-dose-doubled", ExpressionKind::Calculated)
            .unwrap()
            .id;
        for instance in 0..3 {
            let node = NodeKey::Binding { id: calculated, instance: Some(instance) };
            assert!(resolver.order().contains(&node), "missing node for instance {instance}");
        }

        // An edit in instance 1 must not reach instance 0's expression.
        let affected = resolver.affected_by([NodeKey::Answer {
            link_id: "med-dose".to_string(),
            instance: Some(1),
        }]);
        assert!(affected.contains(&NodeKey::Binding { id: calculated, instance: Some(1) }));
        assert!(!affected.contains(&NodeKey::Binding { id: calculated, instance: Some(0) }));
    }
}
