//! Repeat coordination
//!
//! Creating or removing a repeat instance is a shape change: the new
//! instance gets a fresh answer node with the item's defaults and its own
//! private binding scope, and the dependency resolver is rebuilt over the
//! new scope set. Other instances' computed values are never touched; each
//! scoped binding evaluates against its own instance subtree, so nothing
//! can leak across instances through shared state.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::Result;
use crate::graph::{DependencyResolver, NodeKey};
use crate::session::{Changes, FormSession};

impl FormSession {
    /// Create one more instance of a repeating group; returns the new
    /// instance's positional index
    pub fn add_repeat_instance(&mut self, link_id: &str) -> Result<usize> {
        let index = self.store.add_instance(link_id, &[])?;
        self.rebuild_shape();
        Ok(index)
    }

    /// Remove a repeat instance and unregister its scoped bindings; later
    /// instances shift down positionally
    pub fn remove_repeat_instance(&mut self, link_id: &str, index: usize) -> Result<()> {
        self.store.remove_instance(link_id, index, &[])?;

        // Population contexts are keyed positionally too: close the gap.
        let mut shifted = FxHashMap::default();
        for ((group, i), context) in self.instance_contexts.drain() {
            if group != link_id {
                shifted.insert((group, i), context);
            } else if i < index {
                shifted.insert((group, i), context);
            } else if i > index {
                shifted.insert((group, i - 1), context);
            }
        }
        self.instance_contexts = shifted;

        self.rebuild_shape();
        Ok(())
    }

    // Rebuild the resolver over the new scope set, drop cached values for
    // binding nodes that no longer exist, and settle. Settling is
    // idempotent: instances whose inputs did not change produce
    // no-op writes, which is what keeps existing instances stable across
    // add/remove.
    fn rebuild_shape(&mut self) {
        self.resolver =
            DependencyResolver::build(&self.registry, &self.store.repeat_instance_counts());
        let live: FxHashSet<&NodeKey> = self.resolver.order().iter().collect();
        self.var_values.retain(|key, _| live.contains(key));
        self.enablement.recompute_all(&self.store);
        self.recompute(Changes::All);
    }
}
