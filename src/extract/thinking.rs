//! Detection of reasoning-only turns

use super::{has_own_text, inside_reasoning};
use crate::profile::CompiledProfile;
use crate::tree::{Document, NodeId};
use std::sync::Arc;

pub struct ThinkingFilter {
    profile: Arc<CompiledProfile>,
}

impl ThinkingFilter {
    pub fn new(profile: Arc<CompiledProfile>) -> Self {
        Self { profile }
    }

    /// True when the turn has a reasoning container and all of its visible
    /// text lives inside reasoning containers or their panels.
    pub fn is_thinking_only(&self, doc: &Document, turn: NodeId) -> bool {
        if doc.query_first(turn, &self.profile.reasoning).is_none() {
            return false;
        }
        doc.descendants(turn)
            .into_iter()
            .filter(|d| has_own_text(doc, *d))
            .all(|d| inside_reasoning(doc, d, turn, &self.profile))
    }
}
