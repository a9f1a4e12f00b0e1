//! Answer store
//!
//! The mutable answer tree mirroring the response document; the only
//! mutable shared state in a session. Every other component reads it or
//! writes through its API. Repeated questions hold many answers on one
//! node; repeated groups are sibling nodes sharing a linkId, identified by
//! (linkId, positional index).

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use smallvec::SmallVec;

use crate::config::RetentionPolicy;
use crate::error::{FormError, Result};
use crate::model::{
    AnswerValue, Questionnaire, QuestionnaireItem, QuestionnaireResponse, ResponseAnswer,
    ResponseItem,
};

/// Who is writing; the guards differ per source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    /// An interactive edit
    User,
    /// A calculated expression applying its result
    Calculated,
    /// The population pipeline seeding answers before enablement settles
    Population,
}

/// What a write did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The value changed and subscribers were notified
    Applied,
    /// The new value equals the current one; nothing happened
    Unchanged,
    /// User write to a disabled item; dropped, not queued
    DroppedDisabled,
    /// User write to a computed (expression-owned) item; dropped
    DroppedComputed,
}

/// Mutation notifications delivered to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// An item's answers changed
    AnswerChanged {
        /// Item linkId
        link_id: String,
        /// Repeat instance of the nearest repeating ancestor, when scoped
        instance: Option<usize>,
    },
    /// A repeat instance was created
    InstanceAdded {
        /// Repeating group linkId
        link_id: String,
        /// Position of the new instance
        index: usize,
    },
    /// A repeat instance was removed; later indices shift down
    InstanceRemoved {
        /// Repeating group linkId
        link_id: String,
        /// Position the instance had
        index: usize,
    },
}

/// One node of the answer tree
#[derive(Debug, Clone, PartialEq)]
pub struct AnswerNode {
    /// Pointer to the definition item
    pub link_id: String,
    /// Current value(s); empty, one, or many depending on repeats
    pub answers: SmallVec<[AnswerValue; 1]>,
    /// Child nodes
    pub children: Vec<AnswerNode>,
    /// Effective enabled state (own condition AND ancestors)
    pub enabled: bool,
    /// Value owned by a calculated expression; not user-editable
    pub computed: bool,
    /// A population fetch for this item is in flight
    pub populating: bool,
}

impl AnswerNode {
    fn new(link_id: &str, computed: bool) -> Self {
        Self {
            link_id: link_id.to_string(),
            answers: SmallVec::new(),
            children: Vec::new(),
            enabled: true,
            computed,
            populating: false,
        }
    }

    fn clear_recursive(&mut self, cleared: &mut Vec<String>) {
        if !self.answers.is_empty() {
            self.answers.clear();
            cleared.push(self.link_id.clone());
        }
        for child in &mut self.children {
            child.clear_recursive(cleared);
        }
    }
}

/// A pending (coalesced) recomputation trigger
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirtyKey {
    /// Item linkId that changed
    pub link_id: String,
    /// Repeat instance, when the change was scoped
    pub instance: Option<usize>,
}

/// The mutable answer tree
pub struct AnswerStore {
    definition: Arc<Questionnaire>,
    roots: Vec<AnswerNode>,
    computed_items: FxHashSet<String>,
    repeat_groups: FxHashSet<String>,
    listeners: Vec<Box<dyn Fn(&StoreEvent)>>,
    pending: IndexMap<DirtyKey, Instant>,
    debounce_window: Duration,
}

impl AnswerStore {
    /// Build an empty tree from the definition, seeded with declared
    /// `initial` values.
    pub fn from_definition(
        definition: Arc<Questionnaire>,
        computed_items: FxHashSet<String>,
        debounce_window: Duration,
    ) -> Self {
        let repeat_groups = collect_repeat_groups(&definition);
        let roots = definition
            .item
            .iter()
            .map(|item| build_node(item, &computed_items))
            .collect();
        Self {
            definition,
            roots,
            computed_items,
            repeat_groups,
            listeners: Vec::new(),
            pending: IndexMap::new(),
            debounce_window,
        }
    }

    /// Build from the definition, then overlay a previously saved response.
    ///
    /// Repeated groups present more than once in the response get one
    /// instance per occurrence.
    pub fn from_response(
        definition: Arc<Questionnaire>,
        response: &QuestionnaireResponse,
        computed_items: FxHashSet<String>,
        debounce_window: Duration,
    ) -> Self {
        let mut store = Self::from_definition(definition.clone(), computed_items, debounce_window);
        let items: Vec<&QuestionnaireItem> = definition.item.iter().collect();
        merge_response_items(&mut store.roots, &items, &response.item, &store.computed_items);
        store
    }

    /// Register a mutation listener
    pub fn subscribe(&mut self, listener: impl Fn(&StoreEvent) + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn notify(&self, event: StoreEvent) {
        for listener in &self.listeners {
            listener(&event);
        }
    }

    /// Current answers of an item instance
    pub fn get_answer(&self, link_id: &str, instance_path: &[usize]) -> Result<&[AnswerValue]> {
        let path = self
            .locate(link_id, instance_path)
            .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
        Ok(&self.node(&path).answers)
    }

    /// Write an item instance's answers.
    ///
    /// User writes to disabled or computed items are dropped (logged,
    /// reported in the outcome) so the exported response can never pick up
    /// answers a user should not have been able to give.
    pub fn set_answer(
        &mut self,
        link_id: &str,
        instance_path: &[usize],
        answers: Vec<AnswerValue>,
        source: WriteSource,
    ) -> Result<WriteOutcome> {
        let path = self
            .locate(link_id, instance_path)
            .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
        let instance = self.instance_of(&path);
        let node = self.node_mut(&path);

        if source == WriteSource::User {
            if !node.enabled {
                log::debug!("dropping write to disabled item '{link_id}'");
                return Ok(WriteOutcome::DroppedDisabled);
            }
            if node.computed {
                log::debug!("dropping user write to computed item '{link_id}'");
                return Ok(WriteOutcome::DroppedComputed);
            }
        }

        if node.answers.as_slice() == answers.as_slice() {
            return Ok(WriteOutcome::Unchanged);
        }
        node.answers = SmallVec::from_vec(answers);

        let immediate = source != WriteSource::User
            || self
                .definition
                .find_item(link_id)
                .is_some_and(|item| item.item_type.recomputes_immediately());
        let due = if immediate {
            Instant::now()
        } else {
            Instant::now() + self.debounce_window
        };
        let key = DirtyKey { link_id: link_id.to_string(), instance };
        // Re-editing the same item pushes its deadline out; that is the
        // coalescing contract for rapid successive keystrokes.
        self.pending.insert(key, due);

        self.notify(StoreEvent::AnswerChanged { link_id: link_id.to_string(), instance });
        Ok(WriteOutcome::Applied)
    }

    /// Dirty entries whose deadline has passed, removed from the queue
    pub fn take_due(&mut self, now: Instant) -> Vec<DirtyKey> {
        let due: Vec<DirtyKey> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &due {
            self.pending.shift_remove(key);
        }
        due
    }

    /// Every dirty entry, regardless of deadline
    pub fn take_all_pending(&mut self) -> Vec<DirtyKey> {
        self.pending.drain(..).map(|(key, _)| key).collect()
    }

    /// Whether anything is waiting on its debounce deadline
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Create one more instance of a repeating group, seeded with the
    /// definition's initial values. Returns the new instance's index.
    pub fn add_instance(&mut self, link_id: &str, parent_path: &[usize]) -> Result<usize> {
        let item = self
            .definition
            .find_item(link_id)
            .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
        if !item.repeats {
            return Err(FormError::NotRepeating { link_id: link_id.to_string() });
        }

        let template = build_node(item, &self.computed_items);
        let (count, insert_at) = self.sibling_range(link_id, parent_path)?;
        let index = count;
        self.insert_sibling(link_id, parent_path, insert_at, template)?;
        self.notify(StoreEvent::InstanceAdded { link_id: link_id.to_string(), index });
        Ok(index)
    }

    /// Remove one instance of a repeating group; later indices shift down
    pub fn remove_instance(&mut self, link_id: &str, index: usize, parent_path: &[usize]) -> Result<()> {
        let item = self
            .definition
            .find_item(link_id)
            .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
        if !item.repeats {
            return Err(FormError::NotRepeating { link_id: link_id.to_string() });
        }

        let (count, _) = self.sibling_range(link_id, parent_path)?;
        if index >= count {
            return Err(FormError::NoSuchInstance { link_id: link_id.to_string(), index });
        }
        self.remove_sibling(link_id, parent_path, index)?;
        self.notify(StoreEvent::InstanceRemoved { link_id: link_id.to_string(), index });
        Ok(())
    }

    /// Number of instances of a repeating group
    pub fn instance_count(&self, link_id: &str) -> usize {
        let mut count = 0;
        for_each_node(&self.roots, &mut |node, _| {
            if node.link_id == link_id {
                count += 1;
            }
        });
        count
    }

    /// Instance counts for every repeating group, for resolver rebuilds
    pub fn repeat_instance_counts(&self) -> FxHashMap<String, usize> {
        let mut counts = FxHashMap::default();
        for group in &self.repeat_groups {
            counts.insert(group.clone(), self.instance_count(group));
        }
        counts
    }

    /// Answers of an item across the whole tree, or restricted to one
    /// repeat instance when `scope` is given.
    pub fn answers_of(&self, link_id: &str, scope: Option<(&str, usize)>) -> Vec<AnswerValue> {
        let mut found = Vec::new();
        match scope {
            None => {
                for_each_node(&self.roots, &mut |node, _| {
                    if node.link_id == link_id {
                        found.extend(node.answers.iter().cloned());
                    }
                });
            }
            Some((group, index)) => {
                if let Some(instance) = self.find_instance(group, index) {
                    for_each_node(std::slice::from_ref(instance), &mut |node, _| {
                        if node.link_id == link_id {
                            found.extend(node.answers.iter().cloned());
                        }
                    });
                }
            }
        }
        found
    }

    /// Whether an item instance is currently enabled
    pub fn is_enabled(&self, link_id: &str, instance_path: &[usize]) -> Result<bool> {
        let path = self
            .locate(link_id, instance_path)
            .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
        Ok(self.node(&path).enabled)
    }

    /// Flag or clear the pending-population marker on every instance of
    /// an item
    pub fn mark_populating(&mut self, link_id: &str, populating: bool) {
        for_each_node_mut(&mut self.roots, &mut |node, _| {
            if node.link_id == link_id {
                node.populating = populating;
            }
        });
    }

    /// Recompute effective enabled flags from a per-item decision.
    ///
    /// `decide` receives (linkId, instance of the nearest repeating
    /// ancestor) and returns the item's own condition result; the
    /// effective state ANDs in the ancestor chain. Returns the dirty keys
    /// of every node whose stored answers were discarded by a disable
    /// transition.
    pub fn apply_enablement(
        &mut self,
        decide: &dyn Fn(&str, usize) -> bool,
        retention: RetentionPolicy,
    ) -> Vec<DirtyKey> {
        let mut cleared = Vec::new();
        let repeat_groups = self.repeat_groups.clone();

        fn walk(
            nodes: &mut [AnswerNode],
            parent_enabled: bool,
            instance: usize,
            repeat_groups: &FxHashSet<String>,
            decide: &dyn Fn(&str, usize) -> bool,
            retention: RetentionPolicy,
            cleared: &mut Vec<DirtyKey>,
        ) {
            let mut sibling_counts: FxHashMap<String, usize> = FxHashMap::default();
            for node in nodes {
                let own_instance = if repeat_groups.contains(&node.link_id) {
                    let slot = sibling_counts.entry(node.link_id.clone()).or_insert(0);
                    let i = *slot;
                    *slot += 1;
                    i
                } else {
                    instance
                };

                let effective = parent_enabled && decide(&node.link_id, own_instance);
                let was_enabled = node.enabled;
                node.enabled = effective;

                if was_enabled && !effective && retention == RetentionPolicy::Discard {
                    let mut dropped = Vec::new();
                    node.clear_recursive(&mut dropped);
                    cleared.extend(dropped.into_iter().map(|link_id| DirtyKey {
                        link_id,
                        instance: Some(own_instance),
                    }));
                }

                walk(
                    &mut node.children,
                    effective,
                    own_instance,
                    repeat_groups,
                    decide,
                    retention,
                    cleared,
                );
            }
        }

        walk(
            &mut self.roots,
            true,
            0,
            &repeat_groups,
            decide,
            retention,
            &mut cleared,
        );

        for key in &cleared {
            self.notify(StoreEvent::AnswerChanged {
                link_id: key.link_id.clone(),
                instance: key.instance,
            });
        }
        cleared
    }

    /// The current response document as a read view.
    ///
    /// Disabled subtrees are excluded (unless asked for) and items without
    /// answers or answered descendants are pruned, so unanswered items
    /// never export empty answer arrays.
    pub fn to_response(&self, questionnaire: Option<String>, include_disabled: bool) -> QuestionnaireResponse {
        let mut response = QuestionnaireResponse::empty(questionnaire);
        response.item = self
            .roots
            .iter()
            .filter_map(|node| export_node(node, &self.definition, include_disabled))
            .collect();
        response
    }

    /// One repeat instance's subtree as a resource fragment, the focus for
    /// instance-scoped expression evaluation
    pub fn instance_json(&self, group: &str, index: usize) -> Option<Value> {
        let instance = self.find_instance(group, index)?;
        let exported = export_node(instance, &self.definition, false)
            .unwrap_or_else(|| ResponseItem {
                link_id: instance.link_id.clone(),
                text: None,
                answer: Vec::new(),
                item: Vec::new(),
            });
        serde_json::to_value(exported).ok()
    }

    // -- internals --------------------------------------------------------

    fn node(&self, path: &[usize]) -> &AnswerNode {
        let mut node = &self.roots[path[0]];
        for &index in &path[1..] {
            node = &node.children[index];
        }
        node
    }

    fn node_mut(&mut self, path: &[usize]) -> &mut AnswerNode {
        let mut node = &mut self.roots[path[0]];
        for &index in &path[1..] {
            node = &mut node.children[index];
        }
        node
    }

    // Repeat coordinates of a node: its index at each repeated-group
    // level along the path, outermost first.
    fn coords_of(&self, path: &[usize]) -> Vec<usize> {
        let mut coords = Vec::new();
        let mut nodes = &self.roots;
        for &index in path {
            let node = &nodes[index];
            if self.repeat_groups.contains(&node.link_id) {
                let position = nodes
                    .iter()
                    .take(index)
                    .filter(|sibling| sibling.link_id == node.link_id)
                    .count();
                coords.push(position);
            }
            nodes = &node.children;
        }
        coords
    }

    // Innermost repeat coordinate, the `instance` carried in events
    fn instance_of(&self, path: &[usize]) -> Option<usize> {
        self.coords_of(path).last().copied()
    }

    /// Resolve (linkId, instancePath) to a concrete node.
    ///
    /// The instance path is matched right-aligned against the node's
    /// repeat coordinates; unnamed outer levels default to the first
    /// instance.
    fn locate(&self, link_id: &str, instance_path: &[usize]) -> Option<Vec<usize>> {
        let mut matches = Vec::new();
        collect_paths(&self.roots, link_id, &mut Vec::new(), &mut matches);

        matches.into_iter().find(|path| {
            let coords = self.coords_of(path);
            if instance_path.len() > coords.len() {
                return false;
            }
            let pad = coords.len() - instance_path.len();
            coords[..pad].iter().all(|&c| c == 0) && &coords[pad..] == instance_path
        })
    }

    fn find_instance(&self, group: &str, index: usize) -> Option<&AnswerNode> {
        let mut matches = Vec::new();
        collect_paths(&self.roots, group, &mut Vec::new(), &mut matches);
        matches.get(index).map(|path| self.node(path))
    }

    fn sibling_range(&self, link_id: &str, parent_path: &[usize]) -> Result<(usize, usize)> {
        let siblings = if parent_path.is_empty() {
            match self.find_parent_list(link_id) {
                Some(list) => list,
                None => return Err(FormError::UnknownLinkId { link_id: link_id.to_string() }),
            }
        } else {
            let parent = self.node(parent_path);
            &parent.children
        };
        let count = siblings.iter().filter(|n| n.link_id == link_id).count();
        let last = siblings
            .iter()
            .rposition(|n| n.link_id == link_id)
            .map(|p| p + 1)
            .unwrap_or(siblings.len());
        Ok((count, last))
    }

    fn find_parent_list(&self, link_id: &str) -> Option<&Vec<AnswerNode>> {
        fn recurse<'a>(nodes: &'a Vec<AnswerNode>, link_id: &str) -> Option<&'a Vec<AnswerNode>> {
            if nodes.iter().any(|n| n.link_id == link_id) {
                return Some(nodes);
            }
            for node in nodes {
                if let Some(found) = recurse(&node.children, link_id) {
                    return Some(found);
                }
            }
            None
        }
        recurse(&self.roots, link_id)
    }

    fn insert_sibling(
        &mut self,
        link_id: &str,
        parent_path: &[usize],
        at: usize,
        node: AnswerNode,
    ) -> Result<()> {
        if parent_path.is_empty() {
            let list = self
                .find_parent_list_mut(link_id)
                .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?;
            list.insert(at, node);
        } else {
            let parent = self.node_mut(parent_path);
            parent.children.insert(at, node);
        }
        Ok(())
    }

    fn remove_sibling(&mut self, link_id: &str, parent_path: &[usize], index: usize) -> Result<()> {
        let list = if parent_path.is_empty() {
            self.find_parent_list_mut(link_id)
                .ok_or_else(|| FormError::UnknownLinkId { link_id: link_id.to_string() })?
        } else {
            &mut self.node_mut(parent_path).children
        };
        let mut seen = 0usize;
        let position = list.iter().position(|n| {
            if n.link_id == link_id {
                if seen == index {
                    return true;
                }
                seen += 1;
            }
            false
        });
        match position {
            Some(position) => {
                list.remove(position);
                Ok(())
            }
            None => Err(FormError::NoSuchInstance { link_id: link_id.to_string(), index }),
        }
    }

    fn find_parent_list_mut(&mut self, link_id: &str) -> Option<&mut Vec<AnswerNode>> {
        fn recurse<'a>(
            nodes: &'a mut Vec<AnswerNode>,
            link_id: &str,
        ) -> Option<&'a mut Vec<AnswerNode>> {
            if nodes.iter().any(|n| n.link_id == link_id) {
                return Some(nodes);
            }
            for node in nodes {
                if let Some(found) = recurse(&mut node.children, link_id) {
                    return Some(found);
                }
            }
            None
        }
        recurse(&mut self.roots, link_id)
    }
}

impl std::fmt::Debug for AnswerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnswerStore")
            .field("roots", &self.roots)
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn build_node(item: &QuestionnaireItem, computed: &FxHashSet<String>) -> AnswerNode {
    let mut node = AnswerNode::new(&item.link_id, computed.contains(&item.link_id));
    if item.item_type.holds_answers() {
        for initial in &item.initial {
            node.answers.push(initial.value.clone());
            if !item.repeats {
                break;
            }
        }
    }
    node.children = item.item.iter().map(|child| build_node(child, computed)).collect();
    node
}

fn collect_repeat_groups(definition: &Questionnaire) -> FxHashSet<String> {
    let mut groups = FxHashSet::default();
    definition.walk_items(|item, _| {
        if item.is_repeat_group() {
            groups.insert(item.link_id.clone());
        }
    });
    groups
}

fn merge_response_items(
    nodes: &mut Vec<AnswerNode>,
    items: &[&QuestionnaireItem],
    response_items: &[ResponseItem],
    computed: &FxHashSet<String>,
) {
    for response_item in response_items {
        let Some(item) = items.iter().find(|i| i.link_id == response_item.link_id) else {
            log::debug!("response contains unknown linkId '{}'", response_item.link_id);
            continue;
        };

        // A repeated group occurrence beyond the existing instances gets a
        // fresh node; otherwise merge into the first not-yet-filled match.
        let target = {
            let filled: Vec<usize> = nodes
                .iter()
                .enumerate()
                .filter(|(_, n)| n.link_id == response_item.link_id)
                .map(|(i, _)| i)
                .collect();
            let reusable = filled.iter().copied().find(|&i| {
                nodes[i].answers.is_empty() && nodes[i].children.iter().all(node_is_blank)
            });
            match reusable {
                Some(index) => index,
                None if item.is_repeat_group() => {
                    let insert_at = filled.last().map(|&i| i + 1).unwrap_or(nodes.len());
                    nodes.insert(insert_at, build_node(item, computed));
                    insert_at
                }
                None => match filled.first() {
                    Some(&index) => index,
                    None => continue,
                },
            }
        };

        let node = &mut nodes[target];
        node.answers = response_item
            .answer
            .iter()
            .map(|a| a.value.clone())
            .collect();
        let child_items: Vec<&QuestionnaireItem> = item.item.iter().collect();
        merge_response_items(&mut node.children, &child_items, &response_item.item, computed);
    }
}

fn node_is_blank(node: &AnswerNode) -> bool {
    node.answers.is_empty() && node.children.iter().all(node_is_blank)
}

fn for_each_node<'a>(nodes: &'a [AnswerNode], visit: &mut impl FnMut(&'a AnswerNode, usize)) {
    fn recurse<'a>(
        nodes: &'a [AnswerNode],
        depth: usize,
        visit: &mut impl FnMut(&'a AnswerNode, usize),
    ) {
        for node in nodes {
            visit(node, depth);
            recurse(&node.children, depth + 1, visit);
        }
    }
    recurse(nodes, 0, visit);
}

fn for_each_node_mut(nodes: &mut [AnswerNode], visit: &mut impl FnMut(&mut AnswerNode, usize)) {
    fn recurse(nodes: &mut [AnswerNode], depth: usize, visit: &mut impl FnMut(&mut AnswerNode, usize)) {
        for node in nodes {
            visit(node, depth);
            recurse(&mut node.children, depth + 1, visit);
        }
    }
    recurse(nodes, 0, visit);
}

fn collect_paths(
    nodes: &[AnswerNode],
    link_id: &str,
    prefix: &mut Vec<usize>,
    matches: &mut Vec<Vec<usize>>,
) {
    for (index, node) in nodes.iter().enumerate() {
        prefix.push(index);
        if node.link_id == link_id {
            matches.push(prefix.clone());
        }
        collect_paths(&node.children, link_id, prefix, matches);
        prefix.pop();
    }
}

fn export_node(
    node: &AnswerNode,
    definition: &Questionnaire,
    include_disabled: bool,
) -> Option<ResponseItem> {
    if !node.enabled && !include_disabled {
        return None;
    }

    let children: Vec<ResponseItem> = node
        .children
        .iter()
        .filter_map(|child| export_node(child, definition, include_disabled))
        .collect();

    if node.answers.is_empty() && children.is_empty() {
        return None;
    }

    Some(ResponseItem {
        link_id: node.link_id.clone(),
        text: definition.find_item(&node.link_id).and_then(|i| i.text.clone()),
        answer: node
            .answers
            .iter()
            .map(|value| ResponseAnswer::new(value.clone()))
            .collect(),
        item: children,
    })
}
