//! Key-value persistence for transcripts and thread maps
//!
//! Every key is one JSON file in the store directory:
//!   {store_dir}/{key}.json

use crate::climber::Transcript;
use crate::thread_map::ThreadMap;
use crate::{ClimbError, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Global key holding the most recent thread map, whatever the chat.
pub const LEGACY_THREAD_MAP: &str = "thread_map";
/// Chat id the legacy global map was written for.
pub const LEGACY_THREAD_MAP_OWNER: &str = "thread_map_chat_id";
pub const CURRENT_CHAT_ID: &str = "current_chat_id";

pub fn chat_history_key(chat_id: &str) -> String {
    format!("chat_history_{}", chat_id)
}

pub fn thread_map_key(chat_id: &str) -> String {
    format!("thread_map_{}", chat_id)
}

pub fn data_created_key(chat_id: &str) -> String {
    format!("data_created_{}", chat_id)
}

pub struct ChatStore {
    dir: PathBuf,
}

impl ChatStore {
    /// Open a store rooted at `dir`, creating it if needed.
    pub async fn new(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).await?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read a value. A missing key is `None`; an unreadable value is logged
    /// and also treated as missing.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path).await?;
        match serde_json::from_str::<T>(&content) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!("Failed to parse stored value for {}: {}", key, e);
                Ok(None)
            }
        }
    }

    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let content = serde_json::to_string_pretty(value)?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.key_path(key))
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        debug!("Stored {}", key);
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).await?;
        Ok(true)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.key_path(key).exists()
    }

    /// All keys currently stored, sorted.
    pub async fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if let Some(key) = name.strip_suffix(".json") {
                    keys.push(key.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Persist a finished climb and mark the chat as current. Switching to
    /// another chat drops the legacy global map of the previous one.
    pub async fn save_history(&self, chat_id: &str, transcript: &Transcript) -> Result<()> {
        let owner = self.get::<String>(LEGACY_THREAD_MAP_OWNER).await?;
        if owner.as_deref() != Some(chat_id) && self.remove(LEGACY_THREAD_MAP).await? {
            self.remove(LEGACY_THREAD_MAP_OWNER).await?;
            debug!("Dropped legacy thread map of {:?}", owner);
        }
        self.set(&chat_history_key(chat_id), transcript).await?;
        self.set(&data_created_key(chat_id), &Utc::now().to_rfc3339())
            .await?;
        self.set(CURRENT_CHAT_ID, chat_id).await?;
        info!("Saved {} turns for {}", transcript.len(), chat_id);
        Ok(())
    }

    pub async fn load_history(&self, chat_id: &str) -> Result<Option<Transcript>> {
        self.get(&chat_history_key(chat_id)).await
    }

    /// When the stored history for `chat_id` was written.
    pub async fn created_at(&self, chat_id: &str) -> Result<Option<DateTime<Utc>>> {
        let Some(raw) = self.get::<String>(&data_created_key(chat_id)).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| ClimbError::Store(format!("bad timestamp for {}: {}", chat_id, e)))
    }

    pub async fn save_thread_map(&self, chat_id: &str, map: &ThreadMap) -> Result<()> {
        self.set(&thread_map_key(chat_id), map).await?;
        self.set(LEGACY_THREAD_MAP, map).await?;
        self.set(LEGACY_THREAD_MAP_OWNER, chat_id).await?;
        info!("Saved thread map with {} entries for {}", map.len(), chat_id);
        Ok(())
    }

    /// Thread map for `chat_id`. The legacy global key is used only when it
    /// was written for this chat.
    pub async fn load_thread_map(&self, chat_id: &str) -> Result<Option<ThreadMap>> {
        if let Some(map) = self.get(&thread_map_key(chat_id)).await? {
            return Ok(Some(map));
        }
        let owner = self.get::<String>(LEGACY_THREAD_MAP_OWNER).await?;
        if owner.as_deref() == Some(chat_id) {
            return self.get(LEGACY_THREAD_MAP).await;
        }
        Ok(None)
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe_key: String = key
            .chars()
            .map(|c| {
                if c.is_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", safe_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::climber::{Role, Turn};
    use tempfile::TempDir;

    fn transcript() -> Transcript {
        vec![Turn {
            id: "t1".to_string(),
            role: Role::User,
            rich_content: "hi".to_string(),
            text_content: "hi".to_string(),
            attachments: Vec::new(),
            is_thinking_only: false,
        }]
    }

    #[tokio::test]
    async fn test_get_set_remove() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();

        assert_eq!(store.get::<String>("missing").await.unwrap(), None);
        store.set("greeting", "hello").await.unwrap();
        assert!(store.contains("greeting"));
        assert_eq!(
            store.get::<String>("greeting").await.unwrap().as_deref(),
            Some("hello")
        );
        assert!(store.remove("greeting").await.unwrap());
        assert!(!store.remove("greeting").await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_are_sanitized() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        store.set("../escape/key", &1).await.unwrap();
        assert!(dir.path().join("___escape_key.json").exists());
        assert_eq!(store.keys().await.unwrap(), vec!["___escape_key"]);
    }

    #[tokio::test]
    async fn test_history_round_trip_sets_current_chat() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        store.save_history("abc12345", &transcript()).await.unwrap();

        assert_eq!(
            store.load_history("abc12345").await.unwrap(),
            Some(transcript())
        );
        assert!(store.created_at("abc12345").await.unwrap().is_some());
        assert_eq!(
            store.get::<String>(CURRENT_CHAT_ID).await.unwrap().as_deref(),
            Some("abc12345")
        );
    }

    #[tokio::test]
    async fn test_legacy_thread_map_only_for_owning_chat() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        let map = ThreadMap::parse(r#"{"1": "Alpha"}"#).unwrap();
        store.set(CURRENT_CHAT_ID, "zzz99999").await.unwrap();
        store.set(LEGACY_THREAD_MAP, &map).await.unwrap();
        store.set(LEGACY_THREAD_MAP_OWNER, "abc12345").await.unwrap();

        assert_eq!(store.load_thread_map("abc12345").await.unwrap(), Some(map));
        assert_eq!(store.load_thread_map("zzz99999").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_new_chat_history_does_not_inherit_previous_map() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        let map = ThreadMap::parse(r#"{"1": "Alpha"}"#).unwrap();

        store.save_history("aaaa1111", &transcript()).await.unwrap();
        store.save_thread_map("aaaa1111", &map).await.unwrap();
        store.save_history("bbbb2222", &transcript()).await.unwrap();

        assert_eq!(store.load_thread_map("bbbb2222").await.unwrap(), None);
        assert!(!store.contains(LEGACY_THREAD_MAP));
    }

    #[tokio::test]
    async fn test_map_saved_for_other_chat_is_not_current_chats() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        let map = ThreadMap::parse(r#"{"1": "Alpha"}"#).unwrap();

        store.save_history("bbbb2222", &transcript()).await.unwrap();
        store.save_thread_map("aaaa1111", &map).await.unwrap();
        store.remove(&thread_map_key("aaaa1111")).await.unwrap();

        assert_eq!(store.load_thread_map("bbbb2222").await.unwrap(), None);
        assert_eq!(store.load_thread_map("aaaa1111").await.unwrap(), Some(map));
    }

    #[tokio::test]
    async fn test_corrupt_value_reads_as_missing() {
        let dir = TempDir::new().unwrap();
        let store = ChatStore::new(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("thread_map_x.json"), "{not json").unwrap();
        assert_eq!(store.load_thread_map("x").await.unwrap(), None);
    }
}
