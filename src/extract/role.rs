//! Turn role classification by ordered named rules
//!
//! Rules are evaluated top-down and the first rule that decides wins; a turn
//! no rule decides is a model turn.

use crate::profile::CompiledProfile;
use crate::tree::{Document, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "User"),
            Role::Model => write!(f, "Model"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRule {
    /// A role attribute on the turn or any descendant
    ExplicitAttribute,
    /// An author label whose text is exactly the user marker
    UserAuthorLabel,
    /// Structural user/model markers (tags, classes)
    StructuralMarker,
}

impl RoleRule {
    pub const ORDER: [RoleRule; 3] = [
        RoleRule::ExplicitAttribute,
        RoleRule::UserAuthorLabel,
        RoleRule::StructuralMarker,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RoleRule::ExplicitAttribute => "explicit-attribute",
            RoleRule::UserAuthorLabel => "user-author-label",
            RoleRule::StructuralMarker => "structural-marker",
        }
    }

    fn decide(&self, doc: &Document, turn: NodeId, profile: &CompiledProfile) -> Option<Role> {
        let subtree = || std::iter::once(turn).chain(doc.descendants(turn));
        match self {
            RoleRule::ExplicitAttribute => subtree().find_map(|id| {
                let element = doc.node(id)?;
                profile
                    .role_attributes
                    .iter()
                    .filter_map(|a| element.attr(a))
                    .find_map(parse_role)
            }),
            RoleRule::UserAuthorLabel => doc
                .query_all(turn, &profile.author_label)
                .into_iter()
                .any(|label| doc.text_content(label).trim() == profile.user_marker)
                .then_some(Role::User),
            RoleRule::StructuralMarker => {
                if subtree().any(|id| doc.matches(id, &profile.user_structure)) {
                    Some(Role::User)
                } else if subtree().any(|id| doc.matches(id, &profile.model_structure)) {
                    Some(Role::Model)
                } else {
                    None
                }
            }
        }
    }
}

fn parse_role(value: &str) -> Option<Role> {
    match value.trim().to_ascii_lowercase().as_str() {
        "user" | "human" => Some(Role::User),
        "model" | "assistant" | "bot" | "ai" => Some(Role::Model),
        _ => None,
    }
}

/// Outcome of classification, with the rule that decided it (`None` for the
/// default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleDecision {
    pub role: Role,
    pub rule: Option<RoleRule>,
}

pub struct RoleClassifier {
    profile: Arc<CompiledProfile>,
    rules: Vec<RoleRule>,
}

impl RoleClassifier {
    pub fn new(profile: Arc<CompiledProfile>) -> Self {
        Self {
            profile,
            rules: RoleRule::ORDER.to_vec(),
        }
    }

    /// Replace the rule order, e.g. to test one rule in isolation.
    pub fn with_rules(mut self, rules: Vec<RoleRule>) -> Self {
        self.rules = rules;
        self
    }

    pub fn classify(&self, doc: &Document, turn: NodeId) -> RoleDecision {
        self.rules
            .iter()
            .find_map(|rule| {
                rule.decide(doc, turn, &self.profile).map(|role| RoleDecision {
                    role,
                    rule: Some(*rule),
                })
            })
            .unwrap_or(RoleDecision {
                role: Role::Model,
                rule: None,
            })
    }
}
