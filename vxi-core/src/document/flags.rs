//! Session-owned side-table of transient per-node interpreter flags.
//!
//! Documents are shared read-only between sessions, so nothing the
//! interpreter learns about a node is ever written onto the node itself.

use std::collections::HashMap;

use super::NodeId;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct NodeFlags {
    /// The node is on the current traversal path.
    pub traversing: bool,
    /// Form item whose value has been collected.
    pub filled: bool,
    /// An event was raised while this node was current.
    pub event_raised: bool,
    /// Branch not selected by an enclosing `<if>`.
    pub skipped: bool,
}

#[derive(Debug, Default)]
pub struct FlagTable {
    flags: HashMap<NodeId, NodeFlags>,
}

impl FlagTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> NodeFlags {
        self.flags.get(&id).copied().unwrap_or_default()
    }

    pub fn update(&mut self, id: NodeId, f: impl FnOnce(&mut NodeFlags)) {
        let entry = self.flags.entry(id).or_default();
        f(entry);
        if *entry == NodeFlags::default() {
            self.flags.remove(&id);
        }
    }

    pub fn is_filled(&self, id: NodeId) -> bool {
        self.get(id).filled
    }

    pub fn set_filled(&mut self, id: NodeId, filled: bool) {
        self.update(id, |f| f.filled = filled);
    }

    pub fn is_skipped(&self, id: NodeId) -> bool {
        self.get(id).skipped
    }

    /// Drop everything; the live document is being replaced.
    pub fn clear(&mut self) {
        self.flags.clear();
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Document, NodeSpec};

    #[test]
    fn default_entries_are_not_stored() {
        let doc = Document::from_spec("mem:x", &NodeSpec::element("vxml", &[], vec![])).unwrap();
        let root = doc.root();
        let mut table = FlagTable::new();
        table.set_filled(root, true);
        assert!(table.is_filled(root));
        assert_eq!(table.len(), 1);
        table.set_filled(root, false);
        assert!(table.is_empty());
    }

    #[test]
    fn flags_are_independent() {
        let doc = Document::from_spec("mem:x", &NodeSpec::element("vxml", &[], vec![])).unwrap();
        let mut table = FlagTable::new();
        table.update(doc.root(), |f| {
            f.traversing = true;
            f.event_raised = true;
        });
        let flags = table.get(doc.root());
        assert!(flags.traversing && flags.event_raised);
        assert!(!flags.filled);
        table.clear();
        assert_eq!(table.get(doc.root()), NodeFlags::default());
    }
}
