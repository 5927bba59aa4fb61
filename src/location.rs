//! Conversation identifier resolution from the host location

use crate::{ClimbConfig, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Identifier of one conversation, used to namespace persisted data.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(String);

impl ChatId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ChatId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives a [`ChatId`] from a location string. Without an identifier every
/// downstream operation short-circuits to an empty result.
#[derive(Debug, Clone)]
pub struct LocationResolver {
    pattern: Regex,
    placeholders: Vec<String>,
    min_len: usize,
}

impl LocationResolver {
    pub fn new(config: &ClimbConfig) -> Result<Self> {
        Ok(Self {
            pattern: Regex::new(&config.location_pattern)?,
            placeholders: config
                .placeholder_ids
                .iter()
                .map(|p| p.to_ascii_lowercase())
                .collect(),
            min_len: config.min_chat_id_len,
        })
    }

    /// Resolve the conversation identifier, or `None` for non-conversation
    /// addresses and placeholder routes. Deterministic for a given input.
    pub fn resolve(&self, location: &str) -> Option<ChatId> {
        let path = location
            .split(['#', '?'])
            .next()
            .unwrap_or_default();
        let candidate = self.pattern.captures(path)?.get(1)?.as_str();

        if candidate.len() < self.min_len {
            return None;
        }
        if self
            .placeholders
            .iter()
            .any(|p| *p == candidate.to_ascii_lowercase())
        {
            return None;
        }
        Some(ChatId(candidate.to_string()))
    }
}
