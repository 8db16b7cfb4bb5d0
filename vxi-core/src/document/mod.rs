//! Parsed dialog documents.
//!
//! A [`Document`] is an immutable arena of nodes addressed by [`NodeId`].
//! Sessions share one parsed document through `Arc<Document>`; all
//! interpreter state about a node (filled, visited, …) lives in the session's
//! own [`flags::FlagTable`], never on the node.
//!
//! The markup parser is an external collaborator. Documents arrive either as
//! a [`NodeSpec`] tree (JSON interchange form) or through
//! [`loader::DocumentLoader`].

pub mod flags;
pub mod loader;

pub use flags::{FlagTable, NodeFlags};
pub use loader::{DocumentLoader, JsonDocumentLoader};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VxiError};

/// Index of a node inside its [`Document`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Element {
        tag: String,
        attrs: BTreeMap<String, String>,
    },
    Text(String),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

/// Serialisable node tree used to build documents.
///
/// ```json
/// { "tag": "vxml", "children": [
///     { "tag": "form", "attrs": { "id": "main" }, "children": [
///         { "tag": "block", "children": ["Hello"] } ] } ] }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeSpec {
    Text(String),
    Element {
        tag: String,
        #[serde(default)]
        attrs: BTreeMap<String, String>,
        #[serde(default)]
        children: Vec<NodeSpec>,
    },
}

impl NodeSpec {
    pub fn element(tag: &str, attrs: &[(&str, &str)], children: Vec<NodeSpec>) -> Self {
        Self::Element {
            tag: tag.to_string(),
            attrs: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            children,
        }
    }

    pub fn text(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

/// One parsed dialog document.
#[derive(Debug, Clone)]
pub struct Document {
    uri: String,
    nodes: Vec<Node>,
}

impl Document {
    /// Build the arena from a node tree. The root must be an element.
    pub fn from_spec(uri: impl Into<String>, spec: &NodeSpec) -> Result<Self> {
        if matches!(spec, NodeSpec::Text(_)) {
            return Err(VxiError::Semantic(
                "document root must be an element".into(),
            ));
        }
        let mut doc = Self {
            uri: uri.into(),
            nodes: Vec::new(),
        };
        doc.push_spec(spec, None);
        Ok(doc)
    }

    pub fn from_json(uri: impl Into<String>, json: &[u8]) -> Result<Self> {
        let spec: NodeSpec = serde_json::from_slice(json)?;
        Self::from_spec(uri, &spec)
    }

    fn push_spec(&mut self, spec: &NodeSpec, parent: Option<NodeId>) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let (kind, children) = match spec {
            NodeSpec::Text(text) => (NodeKind::Text(text.clone()), &[][..]),
            NodeSpec::Element {
                tag,
                attrs,
                children,
            } => (
                NodeKind::Element {
                    tag: tag.clone(),
                    attrs: attrs.clone(),
                },
                children.as_slice(),
            ),
        };
        self.nodes.push(Node {
            kind,
            parent,
            children: Vec::with_capacity(children.len()),
        });
        for child in children {
            let child_id = self.push_spec(child, Some(id));
            self.nodes[id.index()].children.push(child_id);
        }
        id
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.index())
    }

    /// Tag name, or `""` for text nodes and unknown ids.
    pub fn tag(&self, id: NodeId) -> &str {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Element { tag, .. }) => tag,
            _ => "",
        }
    }

    pub fn is_element(&self, id: NodeId, tag: &str) -> bool {
        self.tag(id) == tag
    }

    /// Attribute value; absent attributes read as `""`.
    pub fn attr(&self, id: NodeId, name: &str) -> &str {
        self.opt_attr(id, name).unwrap_or("")
    }

    pub fn opt_attr(&self, id: NodeId, name: &str) -> Option<&str> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Element { attrs, .. }) => attrs.get(name).map(String::as_str),
            _ => None,
        }
    }

    pub fn text(&self, id: NodeId) -> Option<&str> {
        match self.node(id).map(|n| &n.kind) {
            Some(NodeKind::Text(text)) => Some(text),
            _ => None,
        }
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id).and_then(|n| n.parent)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    pub fn first_child(&self, id: NodeId) -> Option<NodeId> {
        self.children(id).first().copied()
    }

    pub fn next_sibling(&self, id: NodeId) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let pos = siblings.iter().position(|&c| c == id)?;
        siblings.get(pos + 1).copied()
    }

    /// Element children with the given tag, in document order.
    pub fn children_tagged<'a>(
        &'a self,
        id: NodeId,
        tag: &'a str,
    ) -> impl Iterator<Item = NodeId> + 'a {
        self.children(id)
            .iter()
            .copied()
            .filter(move |&c| self.tag(c) == tag)
    }

    /// `id` followed by its ancestors up to the root.
    pub fn ancestors_inclusive(&self, id: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        std::iter::successors(Some(id), move |&n| self.parent(n))
    }

    pub fn is_ancestor_or_self(&self, ancestor: NodeId, node: NodeId) -> bool {
        self.ancestors_inclusive(node).any(|n| n == ancestor)
    }

    /// Nearest ancestor-or-self whose tag is one of `tags`.
    pub fn nearest(&self, id: NodeId, tags: &[&str]) -> Option<NodeId> {
        self.ancestors_inclusive(id)
            .find(|&n| tags.contains(&self.tag(n)))
    }

    /// Pre-order walk of `id`'s subtree, `id` included.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(n) = stack.pop() {
            out.push(n);
            stack.extend(self.children(n).iter().rev().copied());
        }
        out
    }

    /// Concatenated text of the subtree, whitespace-normalised.
    pub fn text_content(&self, id: NodeId) -> String {
        let words: Vec<&str> = self
            .descendants(id)
            .into_iter()
            .filter_map(|n| self.text(n))
            .flat_map(str::split_whitespace)
            .collect();
        words.join(" ")
    }

    /// Element whose `id` attribute (or `name`, for dialogs) equals `target`.
    pub fn find_by_id(&self, target: &str) -> Option<NodeId> {
        let all = self.descendants(self.root());
        all.iter()
            .copied()
            .find(|&n| self.opt_attr(n, "id") == Some(target))
            .or_else(|| {
                all.iter().copied().find(|&n| {
                    matches!(self.tag(n), "form" | "menu")
                        && self.opt_attr(n, "name") == Some(target)
                })
            })
    }

    /// Form item named `name` inside `scope`'s subtree.
    pub fn find_item(&self, scope: NodeId, name: &str) -> Option<NodeId> {
        self.descendants(scope).into_iter().find(|&n| {
            is_form_item(self.tag(n)) && self.opt_attr(n, "name") == Some(name)
        })
    }

    /// First dialog (form or menu) in document order.
    pub fn first_dialog(&self) -> Option<NodeId> {
        self.children(self.root())
            .iter()
            .copied()
            .find(|&n| matches!(self.tag(n), "form" | "menu"))
    }
}

/// Tags that own a form-item variable and take part in `filled` logic.
pub fn is_form_item(tag: &str) -> bool {
    matches!(tag, "field" | "record" | "transfer" | "block" | "menu")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Document {
        let spec = NodeSpec::element(
            "vxml",
            &[],
            vec![NodeSpec::element(
                "form",
                &[("id", "main")],
                vec![
                    NodeSpec::element("field", &[("name", "pin")], vec![NodeSpec::text("  Enter  your pin ")]),
                    NodeSpec::element("block", &[("name", "done")], vec![]),
                ],
            )],
        );
        Document::from_spec("mem:sample", &spec).expect("valid document")
    }

    #[test]
    fn arena_preserves_order_and_parents() {
        let doc = sample();
        let form = doc.first_child(doc.root()).unwrap();
        assert_eq!(doc.tag(form), "form");
        let field = doc.first_child(form).unwrap();
        let block = doc.next_sibling(field).unwrap();
        assert_eq!(doc.tag(block), "block");
        assert_eq!(doc.next_sibling(block), None);
        assert_eq!(doc.parent(field), Some(form));
        assert_eq!(doc.parent(doc.root()), None);
    }

    #[test]
    fn absent_attributes_read_empty() {
        let doc = sample();
        let form = doc.first_child(doc.root()).unwrap();
        assert_eq!(doc.attr(form, "id"), "main");
        assert_eq!(doc.attr(form, "scope"), "");
        assert_eq!(doc.opt_attr(form, "scope"), None);
    }

    #[test]
    fn lookup_by_id_and_item_name() {
        let doc = sample();
        let form = doc.find_by_id("main").unwrap();
        let field = doc.find_item(form, "pin").unwrap();
        assert_eq!(doc.tag(field), "field");
        assert_eq!(doc.text_content(field), "Enter your pin");
        assert!(doc.is_ancestor_or_self(form, field));
        assert_eq!(doc.nearest(field, &["form"]), Some(form));
    }

    #[test]
    fn json_tree_loads() {
        let json = br#"{"tag":"vxml","children":[{"tag":"form","attrs":{"id":"f"},"children":["hi"]}]}"#;
        let doc = Document::from_json("mem:json", json).unwrap();
        assert_eq!(doc.len(), 3);
        assert_eq!(doc.first_dialog(), doc.find_by_id("f"));
    }

    #[test]
    fn text_root_is_rejected() {
        let err = Document::from_spec("mem:bad", &NodeSpec::text("hello")).unwrap_err();
        assert_eq!(err.event_name(), "error.semantic");
    }
}
