//! Backward history traversal
//!
//! Starts at the newest turn and walks preceding siblings up to the oldest,
//! waiting (bounded) for each turn's content. The accumulated turns are
//! reversed before returning, so the transcript is always oldest first.

use crate::extract::{
    harvest_side_index, Attachment, ContentWaiter, RoleClassifier, ThinkingFilter,
};
use crate::location::{ChatId, LocationResolver};
use crate::markup::MarkupNormalizer;
use crate::profile::CompiledProfile;
use crate::progress::{ProgressPhase, RunContext};
use crate::tree::{LiveTree, NodeId};
use crate::{ClimbConfig, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub use crate::extract::Role;

/// One message of the conversation. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Turn {
    pub id: String,
    pub role: Role,
    pub rich_content: String,
    pub text_content: String,
    pub attachments: Vec<Attachment>,
    pub is_thinking_only: bool,
}

/// Turns in chronological order, unique by id, never thinking-only.
pub type Transcript = Vec<Turn>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClimbState {
    /// Nothing to climb: no conversation id or no turns
    Idle,
    Climbing,
    /// Reached the oldest turn
    Done,
    /// Stopped on a cancellation request
    Cancelled,
    /// Hit the iteration safety bound
    Exhausted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClimbReport {
    pub chat_id: Option<ChatId>,
    pub state: ClimbState,
    pub transcript: Transcript,
    /// Turn nodes visited, skipped ones included
    pub visited: usize,
}

impl ClimbReport {
    fn idle(chat_id: Option<ChatId>) -> Self {
        Self {
            chat_id,
            state: ClimbState::Idle,
            transcript: Vec::new(),
            visited: 0,
        }
    }
}

pub struct HistoryClimber {
    tree: LiveTree,
    resolver: LocationResolver,
    profile: Arc<CompiledProfile>,
    waiter: ContentWaiter,
    thinking: ThinkingFilter,
    roles: RoleClassifier,
    max_iterations: usize,
    step_delay: Duration,
}

impl HistoryClimber {
    pub fn new(tree: LiveTree, config: &ClimbConfig) -> Result<Self> {
        let profile = Arc::new(config.profile.compile()?);
        let normalizer = Arc::new(MarkupNormalizer::new());
        Ok(Self {
            resolver: LocationResolver::new(config)?,
            waiter: ContentWaiter::new(
                tree.clone(),
                profile.clone(),
                normalizer,
                config.wait_timeout(),
                config.poll_interval(),
            ),
            thinking: ThinkingFilter::new(profile.clone()),
            roles: RoleClassifier::new(profile.clone()),
            tree,
            profile,
            max_iterations: config.max_iterations,
            step_delay: config.step_delay(),
        })
    }

    pub fn resolver(&self) -> &LocationResolver {
        &self.resolver
    }

    /// Turn nodes matching the turn selector right now.
    pub async fn turn_nodes(&self) -> Vec<NodeId> {
        let doc = self.tree.read().await;
        doc.query_all(doc.root(), &self.profile.turn)
    }

    /// Extract the transcript of the conversation at `location`.
    pub async fn climb(&self, location: &str, ctx: &RunContext) -> ClimbReport {
        let Some(chat_id) = self.resolver.resolve(location) else {
            debug!("No conversation id in {:?}, nothing to climb", location);
            return ClimbReport::idle(None);
        };

        let (nodes, side_index) = {
            let doc = self.tree.read().await;
            (
                doc.query_all(doc.root(), &self.profile.turn),
                harvest_side_index(&doc, &self.profile),
            )
        };
        let total = nodes.len();
        let Some(mut cursor) = nodes.last().copied() else {
            debug!(
                "No turns matching {:?} found for {}",
                self.profile.turn.as_str(),
                chat_id
            );
            return ClimbReport::idle(Some(chat_id));
        };

        info!("Climbing {} turn nodes for {}", total, chat_id);
        let mut collected: Vec<Turn> = Vec::new();
        let mut seen = HashSet::new();
        let mut visited = 0;
        let mut state = ClimbState::Climbing;

        while state == ClimbState::Climbing {
            if visited >= self.max_iterations {
                warn!(
                    "Safety bound of {} iterations reached for {}, returning partial transcript",
                    self.max_iterations, chat_id
                );
                state = ClimbState::Exhausted;
                break;
            }

            ctx.progress()
                .report(visited.min(total), total, ProgressPhase::Climbing);
            if ctx.is_cancelled() {
                info!("Climb cancelled after {} turn nodes", visited);
                state = ClimbState::Cancelled;
                break;
            }
            visited += 1;

            if let Some(turn) = self.read_turn(cursor, &side_index).await {
                if seen.insert(turn.id.clone()) {
                    collected.push(turn);
                    ctx.progress().count(collected.len());
                } else {
                    debug!("Skipping duplicate turn id {}", turn.id);
                }
            }

            let previous = {
                let doc = self.tree.read().await;
                doc.previous_sibling_matching(cursor, &self.profile.turn)
            };
            match previous {
                Some(prev) => {
                    cursor = prev;
                    tokio::time::sleep(self.step_delay).await;
                }
                None => state = ClimbState::Done,
            }
        }

        collected.reverse();
        info!(
            "Climb finished ({:?}): {} turns from {} nodes",
            state,
            collected.len(),
            visited
        );
        ClimbReport {
            chat_id: Some(chat_id),
            state,
            transcript: collected,
            visited,
        }
    }

    /// One iteration body: skip reasoning-only nodes, wait for content,
    /// classify, and fall back to the side index label.
    async fn read_turn(
        &self,
        cursor: NodeId,
        side_index: &HashMap<String, String>,
    ) -> Option<Turn> {
        let (thinking_only, id) = {
            let doc = self.tree.read().await;
            (
                self.thinking.is_thinking_only(&doc, cursor),
                doc.stable_id(cursor),
            )
        };
        if thinking_only {
            debug!("Skipping reasoning-only turn {}", id);
            return None;
        }

        match self.waiter.wait(cursor).await {
            Some(content) => {
                let decision = {
                    let doc = self.tree.read().await;
                    self.roles.classify(&doc, cursor)
                };
                debug!(
                    "Turn {} is {} ({})",
                    id,
                    decision.role,
                    decision.rule.map(|r| r.name()).unwrap_or("default")
                );
                Some(Turn {
                    id,
                    role: decision.role,
                    rich_content: content.rich_content,
                    text_content: content.text_content,
                    attachments: content.attachments,
                    is_thinking_only: false,
                })
            }
            None => {
                let label = side_index.get(&id)?;
                debug!("Turn {} recovered from side index", id);
                Some(Turn {
                    id,
                    role: Role::User,
                    rich_content: label.clone(),
                    text_content: label.clone(),
                    attachments: Vec::new(),
                    is_thinking_only: false,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Document, NodeSpec};

    const LOCATION: &str = "https://chat.example.com/app/3f9a2b7c1d0e";

    fn turn(id: &str, role: &str, text: &str) -> NodeSpec {
        NodeSpec::new("div")
            .id(id)
            .class("conversation-turn")
            .attr("data-role", role)
            .child(NodeSpec::new("div").class("markdown").text(text))
    }

    fn climber(tree: &LiveTree) -> HistoryClimber {
        let config = ClimbConfig::default()
            .with_wait_timeout(Duration::from_millis(300))
            .with_step_delay(Duration::from_millis(5));
        HistoryClimber::new(tree.clone(), &config).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_chat_id_is_idle() {
        let tree = LiveTree::new(Document::from_specs([turn("a", "user", "hi")]));
        let report = climber(&tree)
            .climb("https://chat.example.com/app/new", &RunContext::detached())
            .await;
        assert_eq!(report.state, ClimbState::Idle);
        assert!(report.transcript.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_turns_is_idle() {
        let tree = LiveTree::new(Document::new());
        let report = climber(&tree).climb(LOCATION, &RunContext::detached()).await;
        assert_eq!(report.state, ClimbState::Idle);
        assert!(report.chat_id.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_safety_bound_returns_partial() {
        let tree = LiveTree::new(Document::from_specs([NodeSpec::new("main").children([
            turn("a", "user", "one"),
            turn("b", "model", "two"),
            turn("c", "user", "three"),
        ])]));
        let config = ClimbConfig::default().with_max_iterations(2);
        let report = HistoryClimber::new(tree, &config)
            .unwrap()
            .climb(LOCATION, &RunContext::detached())
            .await;
        assert_eq!(report.state, ClimbState::Exhausted);
        let ids: Vec<&str> = report.transcript.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreadable_turn_recovers_from_side_index() {
        let tree = LiveTree::new(Document::from_specs([
            NodeSpec::new("nav").child(
                NodeSpec::new("a")
                    .class("side-index-item")
                    .attr("href", "#a")
                    .text("What is TOML?"),
            ),
            NodeSpec::new("main").children([
                NodeSpec::new("div").id("a").class("conversation-turn"),
                NodeSpec::new("div").id("b").class("conversation-turn"),
                turn("c", "model", "TOML is a config format"),
            ]),
        ]));
        let report = climber(&tree).climb(LOCATION, &RunContext::detached()).await;
        assert_eq!(report.state, ClimbState::Done);
        assert_eq!(report.visited, 3);
        assert_eq!(report.transcript.len(), 2);
        assert_eq!(report.transcript[0].id, "a");
        assert_eq!(report.transcript[0].role, Role::User);
        assert_eq!(report.transcript[0].text_content, "What is TOML?");
        assert_eq!(report.transcript[1].role, Role::Model);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start_returns_empty() {
        let tree = LiveTree::new(Document::from_specs([turn("a", "user", "hi")]));
        let ctx = RunContext::detached();
        ctx.cancel();
        let report = climber(&tree).climb(LOCATION, &ctx).await;
        assert_eq!(report.state, ClimbState::Cancelled);
        assert!(report.transcript.is_empty());
        assert_eq!(report.visited, 0);
    }
}
