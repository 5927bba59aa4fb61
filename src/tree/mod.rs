//! Host node tree model
//!
//! The chat transcript is an arena of element nodes. Each node has a tag,
//! ordered attributes (`id` and `class` included), its own text (rendered
//! before its children) and child links. `#text` nodes carry text only.

mod live;
mod selector;

pub use live::{LiveTree, TreeChange};
pub use selector::Selector;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag used for bare text nodes
pub const TEXT_TAG: &str = "#text";

const ROOT_TAG: &str = "#document";

const VOID_TAGS: &[&str] = &[
    "area", "br", "col", "embed", "hr", "img", "input", "link", "meta", "source", "wbr",
];

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "figure",
    "footer", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr", "li", "main", "nav", "ol",
    "p", "pre", "section", "table", "tr", "ul",
];

/// Index of a node inside a [`Document`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl Node {
    fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_ascii_lowercase(),
            attrs: Vec::new(),
            text: String::new(),
            parent: None,
            children: Vec::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn id(&self) -> Option<&str> {
        self.attr("id").filter(|id| !id.is_empty())
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.attr("class").unwrap_or("").split_whitespace()
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.classes().any(|c| c == class)
    }

    pub fn is_text(&self) -> bool {
        self.tag == TEXT_TAG
    }

    fn set_attr(&mut self, name: &str, value: &str) {
        if let Some(slot) = self.attrs.iter_mut().find(|(k, _)| k == name) {
            slot.1 = value.to_string();
        } else {
            self.attrs.push((name.to_string(), value.to_string()));
        }
    }
}

/// Serializable description of a subtree, used for snapshots and for
/// appending content to a live tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub tag: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            ..Default::default()
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.class = Some(class.to_string());
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attrs.insert(name.to_string(), value.to_string());
        self
    }

    pub fn text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = NodeSpec>) -> Self {
        self.children.extend(children);
        self
    }
}

/// Arena-backed node tree. `NodeId(0)` is the document root.
#[derive(Debug, Clone)]
pub struct Document {
    nodes: Vec<Node>,
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl Document {
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new(ROOT_TAG)],
        }
    }

    /// Build a document whose root holds the given top-level nodes.
    pub fn from_specs(specs: impl IntoIterator<Item = NodeSpec>) -> Self {
        let mut doc = Self::new();
        let root = doc.root();
        for spec in specs {
            doc.append(root, &spec);
        }
        doc
    }

    /// Parse a JSON snapshot: either a single node or an array of nodes.
    pub fn from_json(json: &str) -> crate::Result<Self> {
        Self::from_value(serde_json::from_str(json)?)
    }

    pub fn from_value(value: serde_json::Value) -> crate::Result<Self> {
        let specs: Vec<NodeSpec> = if value.is_array() {
            serde_json::from_value(value)?
        } else {
            vec![serde_json::from_value(value)?]
        };
        Ok(Self::from_specs(specs))
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() <= 1
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    /// Append a subtree under `parent`, returning the new subtree root.
    pub fn append(&mut self, parent: NodeId, spec: &NodeSpec) -> Option<NodeId> {
        self.node(parent)?;
        let id = NodeId(self.nodes.len());
        let mut node = Node::new(&spec.tag);
        if let Some(node_id) = &spec.id {
            node.set_attr("id", node_id);
        }
        if let Some(class) = &spec.class {
            node.set_attr("class", class);
        }
        for (name, value) in &spec.attrs {
            node.set_attr(name, value);
        }
        node.text = spec.text.clone();
        node.parent = Some(parent);
        self.nodes.push(node);
        self.nodes[parent.0].children.push(id);
        for child in &spec.children {
            self.append(id, child);
        }
        Some(id)
    }

    pub fn set_text(&mut self, id: NodeId, text: &str) -> bool {
        match self.nodes.get_mut(id.0) {
            Some(node) => {
                node.text = text.to_string();
                true
            }
            None => false,
        }
    }

    pub fn set_attr(&mut self, id: NodeId, name: &str, value: &str) -> bool {
        match self.nodes.get_mut(id.0) {
            Some(node) => {
                node.set_attr(name, value);
                true
            }
            None => false,
        }
    }

    /// Detach every child of `id`. Detached nodes stay in the arena but are
    /// no longer reachable from the root.
    pub fn remove_children(&mut self, id: NodeId) -> bool {
        let Some(node) = self.nodes.get_mut(id.0) else {
            return false;
        };
        let children = std::mem::take(&mut node.children);
        for child in children {
            self.nodes[child.0].parent = None;
        }
        true
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.node(id)?.parent
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.node(id).map(|n| n.children.as_slice()).unwrap_or(&[])
    }

    /// Ancestors from the parent upwards, excluding `id` itself.
    pub fn ancestors(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut cursor = self.parent(id);
        while let Some(current) = cursor {
            out.push(current);
            cursor = self.parent(current);
        }
        out
    }

    /// Descendants in document order, excluding `id` itself.
    pub fn descendants(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack: Vec<NodeId> = self.children(id).iter().rev().copied().collect();
        while let Some(current) = stack.pop() {
            out.push(current);
            stack.extend(self.children(current).iter().rev().copied());
        }
        out
    }

    pub fn matches(&self, id: NodeId, selector: &Selector) -> bool {
        self.node(id).is_some_and(|n| selector.matches(n))
    }

    /// Descendants of `scope` matching `selector`, in document order.
    pub fn query_all(&self, scope: NodeId, selector: &Selector) -> Vec<NodeId> {
        self.descendants(scope)
            .into_iter()
            .filter(|id| self.matches(*id, selector))
            .collect()
    }

    pub fn query_first(&self, scope: NodeId, selector: &Selector) -> Option<NodeId> {
        self.descendants(scope)
            .into_iter()
            .find(|id| self.matches(*id, selector))
    }

    /// `id` itself or its nearest ancestor matching `selector`.
    pub fn closest(&self, id: NodeId, selector: &Selector) -> Option<NodeId> {
        if self.matches(id, selector) {
            return Some(id);
        }
        self.ancestors(id)
            .into_iter()
            .find(|a| self.matches(*a, selector))
    }

    /// Whether `id` is `ancestor` or lies below it.
    pub fn is_within(&self, id: NodeId, ancestor: NodeId) -> bool {
        id == ancestor || self.ancestors(id).contains(&ancestor)
    }

    /// Whether `id` is still reachable from the root.
    pub fn is_attached(&self, id: NodeId) -> bool {
        self.node(id).is_some() && self.is_within(id, self.root())
    }

    /// Nearest preceding sibling matching `selector`.
    pub fn previous_sibling_matching(&self, id: NodeId, selector: &Selector) -> Option<NodeId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent);
        let position = siblings.iter().position(|s| *s == id)?;
        siblings[..position]
            .iter()
            .rev()
            .copied()
            .find(|s| self.matches(*s, selector))
    }

    /// Stable identifier: the `id` attribute, else the arena position.
    pub fn stable_id(&self, id: NodeId) -> String {
        self.node(id)
            .and_then(|n| n.id())
            .map(str::to_string)
            .unwrap_or_else(|| id.to_string())
    }

    /// Concatenated text of the subtree, with a newline after block elements.
    pub fn text_content(&self, id: NodeId) -> String {
        let mut out = String::new();
        self.collect_text(id, &mut out);
        out
    }

    fn collect_text(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        out.push_str(&node.text);
        for child in &node.children {
            self.collect_text(*child, out);
        }
        if BLOCK_TAGS.contains(&node.tag.as_str()) && !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
    }

    /// Markup of the children of `id` (the node's own tag excluded).
    pub fn inner_markup(&self, id: NodeId) -> String {
        let mut out = String::new();
        if let Some(node) = self.node(id) {
            out.push_str(&escape_text(&node.text));
            for child in &node.children {
                self.write_markup(*child, &mut out);
            }
        }
        out
    }

    fn write_markup(&self, id: NodeId, out: &mut String) {
        let Some(node) = self.node(id) else {
            return;
        };
        if node.is_text() {
            out.push_str(&escape_text(&node.text));
            return;
        }
        out.push('<');
        out.push_str(&node.tag);
        for (name, value) in &node.attrs {
            out.push(' ');
            out.push_str(name);
            out.push_str("=\"");
            out.push_str(&escape_attr(value));
            out.push('"');
        }
        out.push('>');
        if VOID_TAGS.contains(&node.tag.as_str()) {
            return;
        }
        out.push_str(&escape_text(&node.text));
        for child in &node.children {
            self.write_markup(*child, out);
        }
        out.push_str("</");
        out.push_str(&node.tag);
        out.push('>');
    }
}

pub(crate) fn is_void_tag(tag: &str) -> bool {
    VOID_TAGS.contains(&tag)
}

fn escape_text(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn escape_attr(value: &str) -> String {
    value.replace('&', "&amp;").replace('"', "&quot;")
}
