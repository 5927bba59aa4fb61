//! Bounded waiting for a turn's content to finish rendering

use super::{inside_reasoning, outermost, Attachment, AttachmentExtractor};
use crate::markup::MarkupNormalizer;
use crate::profile::CompiledProfile;
use crate::tree::{Document, LiveTree, NodeId, Selector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Usable content of one turn. `rich_content` is already normalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnContent {
    pub rich_content: String,
    pub text_content: String,
    pub attachments: Vec<Attachment>,
}

/// Content sources, tried in order until one yields text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionStrategy {
    /// Content containers that are not inside a reasoning container
    OutsideReasoning,
    /// Any structured text node that is not reasoning
    StructuredText,
    /// Containers used by older layouts
    Legacy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct RawContent {
    markup: String,
    text: String,
}

impl ExtractionStrategy {
    pub const ORDER: [ExtractionStrategy; 3] = [
        ExtractionStrategy::OutsideReasoning,
        ExtractionStrategy::StructuredText,
        ExtractionStrategy::Legacy,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExtractionStrategy::OutsideReasoning => "outside-reasoning",
            ExtractionStrategy::StructuredText => "structured-text",
            ExtractionStrategy::Legacy => "legacy",
        }
    }

    fn extract(&self, doc: &Document, node: NodeId, profile: &CompiledProfile) -> Option<RawContent> {
        let (selector, skip_reasoning): (&Selector, bool) = match self {
            ExtractionStrategy::OutsideReasoning => (&profile.primary_content, true),
            ExtractionStrategy::StructuredText => (&profile.structured_text, true),
            ExtractionStrategy::Legacy => (&profile.legacy_content, false),
        };

        let candidates: Vec<NodeId> = doc
            .query_all(node, selector)
            .into_iter()
            .filter(|c| !skip_reasoning || !inside_reasoning(doc, *c, node, profile))
            .collect();

        let mut markup = Vec::new();
        let mut text = Vec::new();
        for candidate in outermost(doc, candidates) {
            let candidate_text = doc.text_content(candidate).trim().to_string();
            if candidate_text.is_empty() {
                continue;
            }
            markup.push(doc.inner_markup(candidate));
            text.push(candidate_text);
        }

        if text.is_empty() {
            None
        } else {
            Some(RawContent {
                markup: markup.join("\n"),
                text: text.join("\n"),
            })
        }
    }
}

/// Polls one node until content or attachments appear, or the bound elapses.
pub struct ContentWaiter {
    tree: LiveTree,
    profile: Arc<CompiledProfile>,
    attachments: AttachmentExtractor,
    normalizer: Arc<MarkupNormalizer>,
    timeout: Duration,
    interval: Duration,
}

impl ContentWaiter {
    pub fn new(
        tree: LiveTree,
        profile: Arc<CompiledProfile>,
        normalizer: Arc<MarkupNormalizer>,
        timeout: Duration,
        interval: Duration,
    ) -> Self {
        Self {
            tree,
            attachments: AttachmentExtractor::new(profile.clone()),
            profile,
            normalizer,
            timeout,
            interval: interval.max(Duration::from_millis(1)),
        }
    }

    /// Wait with the configured bound. `None` means the turn is unusable,
    /// which is different from a turn with empty content.
    pub async fn wait(&self, node: NodeId) -> Option<TurnContent> {
        self.wait_for(node, self.timeout).await
    }

    pub async fn wait_for(&self, node: NodeId, timeout: Duration) -> Option<TurnContent> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(content) = self.poll(node).await {
                return Some(content);
            }
            let now = Instant::now();
            if now >= deadline {
                debug!("No content for {} within {:?}", node, timeout);
                return None;
            }
            tokio::time::sleep(self.interval.min(deadline - now)).await;
        }
    }

    /// One synchronous read of the node.
    pub async fn poll(&self, node: NodeId) -> Option<TurnContent> {
        let (raw, attachments) = {
            let doc = self.tree.read().await;
            if !doc.is_attached(node) {
                return None;
            }
            let raw = ExtractionStrategy::ORDER.iter().find_map(|strategy| {
                let found = strategy.extract(&doc, node, &self.profile);
                if found.is_some() {
                    debug!("Content for {} via {}", node, strategy.name());
                }
                found
            });
            (raw, self.attachments.extract(&doc, node))
        };

        match raw {
            Some(raw) => Some(TurnContent {
                rich_content: self.normalizer.normalize(&raw.markup),
                text_content: raw.text,
                attachments,
            }),
            None if !attachments.is_empty() => Some(TurnContent {
                rich_content: String::new(),
                text_content: String::new(),
                attachments,
            }),
            None => None,
        }
    }
}
