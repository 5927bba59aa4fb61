//! Turn to thread assignments delivered by the response watcher

use crate::climber::Turn;
use crate::{ClimbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Mapping of turn key to thread name. Keys are turn ids or 1-based turn
/// numbers as used in the analysis prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ThreadMap(BTreeMap<String, String>);

impl ThreadMap {
    /// Parse a fenced payload. It must be a non-empty JSON object whose
    /// values are strings (numbers are accepted and stringified).
    pub fn parse(payload: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(payload.trim())?;
        let Value::Object(object) = value else {
            return Err(ClimbError::Payload("expected a JSON object".to_string()));
        };

        let mut map = BTreeMap::new();
        for (key, value) in object {
            let name = match value {
                Value::String(s) => s.trim().to_string(),
                Value::Number(n) => n.to_string(),
                other => {
                    return Err(ClimbError::Payload(format!(
                        "thread name for '{}' is not a string: {}",
                        key, other
                    )))
                }
            };
            if !name.is_empty() {
                map.insert(key.trim().to_string(), name);
            }
        }
        if map.is_empty() {
            return Err(ClimbError::Payload("no thread assignments".to_string()));
        }
        Ok(Self(map))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Distinct thread names, sorted.
    pub fn threads(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.0.values().map(String::as_str).collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Thread assigned to the `index`-th (0-based) turn of `transcript`.
    pub fn thread_of(&self, index: usize, turn: &Turn) -> Option<&str> {
        self.get(&turn.id)
            .or_else(|| self.get(&(index + 1).to_string()))
    }

    /// Ids of the turns assigned to `thread`, in transcript order.
    pub fn turn_ids_for(&self, thread: &str, transcript: &[Turn]) -> Vec<String> {
        transcript
            .iter()
            .enumerate()
            .filter(|(i, turn)| self.thread_of(*i, turn) == Some(thread))
            .map(|(_, turn)| turn.id.clone())
            .collect()
    }
}
