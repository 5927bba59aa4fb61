//! Chatclimb - conversation history extraction from live chat trees
//!
//! Climbs an incrementally rendered chat transcript from the newest turn to
//! the oldest and produces an ordered, deduplicated transcript:
//! - Waits (bounded) for each turn's content to finish rendering
//! - Skips reasoning-only turns and classifies roles by ordered rules
//! - Extracts attachment metadata and normalizes rich markup to markdown
//! - Watches a single answer node for a fenced thread-map payload

pub mod analysis;
pub mod climber;
pub mod commands;
pub mod extract;
pub mod location;
pub mod markup;
pub mod profile;
pub mod progress;
pub mod store;
pub mod thread_map;
pub mod tree;
pub mod watcher;

pub use climber::{ClimbReport, ClimbState, HistoryClimber, Role, Transcript, Turn};
pub use commands::{Command, Dispatcher};
pub use extract::Attachment;
pub use location::{ChatId, LocationResolver};
pub use markup::MarkupNormalizer;
pub use progress::{HostEvent, ProgressPhase, ProgressReporter, RunContext};
pub use store::ChatStore;
pub use thread_map::ThreadMap;
pub use tree::{Document, LiveTree, NodeId, NodeSpec};
pub use watcher::{ResponseWatcher, WatchState};

use profile::MarkupProfile;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for Chatclimb
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClimbConfig {
    /// Hard cap on climber iterations (safety break)
    pub max_iterations: usize,

    /// How long to wait for one turn's content before giving up
    pub wait_timeout_ms: u64,

    /// Interval between content polls
    pub poll_interval_ms: u64,

    /// Pause between climber iterations so the host can keep rendering
    pub step_delay_ms: u64,

    /// Regex whose first capture group is the conversation identifier
    pub location_pattern: String,

    /// Identifiers that are route placeholders rather than real chats
    pub placeholder_ids: Vec<String>,

    /// Identifiers shorter than this are rejected
    pub min_chat_id_len: usize,

    /// Directory backing the key-value store
    pub store_dir: PathBuf,

    /// Fence info strings the response watcher accepts
    pub fence_tags: Vec<String>,

    /// Selectors describing the host markup
    pub profile: MarkupProfile,

    /// Whether to log at debug level
    pub verbose: bool,
}

impl Default for ClimbConfig {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            wait_timeout_ms: 3000,
            poll_interval_ms: 100,
            step_delay_ms: 50,
            location_pattern: r"/(?:app|chat|c)/([A-Za-z0-9_-]+)".to_string(),
            placeholder_ids: ["new", "app", "chat", "undefined", "null", "placeholder"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_chat_id_len: 8,
            store_dir: default_home().join("store"),
            fence_tags: vec!["thread-map".to_string(), "json".to_string()],
            profile: MarkupProfile::default(),
            verbose: false,
        }
    }
}

impl ClimbConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file; missing keys keep their defaults.
    pub async fn load(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config = toml::from_str::<ClimbConfig>(&content)?;
        Ok(config)
    }

    /// Load `~/.chatclimb/config.toml` if it exists, defaults otherwise.
    pub async fn load_default() -> Result<Self> {
        let path = default_home().join("config.toml");
        if path.exists() {
            Self::load(&path).await
        } else {
            Ok(Self::default())
        }
    }

    pub fn with_store_dir(mut self, dir: PathBuf) -> Self {
        self.store_dir = dir;
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn step_delay(&self) -> Duration {
        Duration::from_millis(self.step_delay_ms)
    }
}

/// `~/.chatclimb`, or `./.chatclimb` when no home directory is known.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".chatclimb")
}

/// Result type for Chatclimb operations
pub type Result<T> = std::result::Result<T, ClimbError>;

/// Errors that can occur in Chatclimb
#[derive(Debug, thiserror::Error)]
pub enum ClimbError {
    #[error("Invalid selector '{selector}': {reason}")]
    Selector { selector: String, reason: String },

    #[error("Invalid location pattern: {0}")]
    LocationPattern(#[from] regex::Error),

    #[error("Markup conversion failed: {0}")]
    Markup(String),

    #[error("Invalid payload: {0}")]
    Payload(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),
}
