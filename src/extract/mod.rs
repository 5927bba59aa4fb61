//! Per-turn extraction: content, reasoning detection, roles, attachments

mod attachments;
mod content;
mod role;
mod side_index;
mod thinking;

pub use attachments::AttachmentExtractor;
pub use content::{ContentWaiter, ExtractionStrategy, TurnContent};
pub use role::{Role, RoleClassifier, RoleDecision, RoleRule};
pub use side_index::harvest_side_index;
pub use thinking::ThinkingFilter;

use crate::profile::CompiledProfile;
use crate::tree::{Document, NodeId};
use serde::{Deserialize, Serialize};

/// Attachment metadata found inside one turn. Unique by `name` per turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub token_count_label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

/// Whether `id` sits in a reasoning container or reasoning panel at or
/// below `scope` (the scope node itself is not considered).
pub(crate) fn inside_reasoning(
    doc: &Document,
    id: NodeId,
    scope: NodeId,
    profile: &CompiledProfile,
) -> bool {
    std::iter::once(id)
        .chain(doc.ancestors(id))
        .take_while(|n| *n != scope)
        .any(|n| doc.matches(n, &profile.reasoning) || doc.matches(n, &profile.reasoning_panel))
}

/// Whether the node carries non-empty text of its own.
pub(crate) fn has_own_text(doc: &Document, id: NodeId) -> bool {
    doc.node(id).is_some_and(|n| !n.text.trim().is_empty())
}

/// Drop nodes that are nested inside another node of the same list, so a
/// container and its inner container are not both extracted.
pub(crate) fn outermost(doc: &Document, ids: Vec<NodeId>) -> Vec<NodeId> {
    ids.iter()
        .copied()
        .filter(|id| !doc.ancestors(*id).iter().any(|a| ids.contains(a)))
        .collect()
}
