//! Selectors describing the host chat markup
//!
//! `MarkupProfile` is the TOML-facing form (plain selector strings);
//! `CompiledProfile` holds the parsed selectors the extractors use.

use crate::tree::Selector;
use crate::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkupProfile {
    /// One node per conversation turn
    pub turn: String,
    /// Containers holding intermediate reasoning
    pub reasoning: String,
    /// Collapsible panels that wrap reasoning containers
    pub reasoning_panel: String,
    /// Content containers, tried first (must sit outside reasoning)
    pub primary_content: String,
    /// Structured text nodes, tried second
    pub structured_text: String,
    /// Older layouts, tried last
    pub legacy_content: String,
    /// Attributes carrying an explicit role
    pub role_attributes: Vec<String>,
    /// Node whose text names the author
    pub author_label: String,
    /// Author label text identifying the user
    pub user_marker: String,
    /// Structural markers of user turns
    pub user_structure: String,
    /// Structural markers of model turns
    pub model_structure: String,
    /// Dedicated file reference nodes
    pub file_reference: String,
    pub file_name: String,
    pub file_size: String,
    /// Broader attachment containers
    pub attachment_container: String,
    /// Attributes that hold an attachment timestamp
    pub timestamp_attributes: Vec<String>,
    /// Items of the navigation side index
    pub side_index_item: String,
    /// Attributes on side index items pointing at a turn id
    pub side_index_target_attributes: Vec<String>,
    /// Labels of UI actions that are never turn labels
    pub ui_action_labels: Vec<String>,
}

impl Default for MarkupProfile {
    fn default() -> Self {
        let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            turn: ".conversation-turn".to_string(),
            reasoning: ".thoughts-container, model-thoughts, [data-thinking]".to_string(),
            reasoning_panel: "details, .thoughts-panel, .expansion-panel".to_string(),
            primary_content: "message-content, .query-text".to_string(),
            structured_text: ".markdown, [data-structured-text]".to_string(),
            legacy_content: ".message-body, .model-response-text, .query-content".to_string(),
            role_attributes: strings(&["data-role", "data-message-author-role"]),
            author_label: ".author-label".to_string(),
            user_marker: "You".to_string(),
            user_structure: "user-query, .user-query, [data-author=user]".to_string(),
            model_structure: "model-response, .model-response, [data-author=model]".to_string(),
            file_reference: ".file-reference, [data-file-name]".to_string(),
            file_name: ".file-name".to_string(),
            file_size: ".file-size, .token-count".to_string(),
            attachment_container: ".file-preview-container, .attachment, .uploaded-file"
                .to_string(),
            timestamp_attributes: strings(&[
                "data-timestamp",
                "datetime",
                "data-created",
                "data-uploaded-at",
            ]),
            side_index_item: ".side-index-item, [data-nav-target]".to_string(),
            side_index_target_attributes: strings(&["data-nav-target", "href"]),
            ui_action_labels: strings(&[
                "copy", "edit", "share", "delete", "retry", "more", "show more", "show less",
                "like", "dislike", "export", "regenerate", "listen",
            ]),
        }
    }
}

/// Parsed form of [`MarkupProfile`].
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    pub turn: Selector,
    pub reasoning: Selector,
    pub reasoning_panel: Selector,
    pub primary_content: Selector,
    pub structured_text: Selector,
    pub legacy_content: Selector,
    pub role_attributes: Vec<String>,
    pub author_label: Selector,
    pub user_marker: String,
    pub user_structure: Selector,
    pub model_structure: Selector,
    pub file_reference: Selector,
    pub file_name: Selector,
    pub file_size: Selector,
    pub attachment_container: Selector,
    pub timestamp_attributes: Vec<String>,
    pub side_index_item: Selector,
    pub side_index_target_attributes: Vec<String>,
    pub ui_action_labels: Vec<String>,
}

impl MarkupProfile {
    pub fn compile(&self) -> Result<CompiledProfile> {
        Ok(CompiledProfile {
            turn: Selector::parse(&self.turn)?,
            reasoning: Selector::parse(&self.reasoning)?,
            reasoning_panel: Selector::parse(&self.reasoning_panel)?,
            primary_content: Selector::parse(&self.primary_content)?,
            structured_text: Selector::parse(&self.structured_text)?,
            legacy_content: Selector::parse(&self.legacy_content)?,
            role_attributes: self.role_attributes.clone(),
            author_label: Selector::parse(&self.author_label)?,
            user_marker: self.user_marker.trim().to_string(),
            user_structure: Selector::parse(&self.user_structure)?,
            model_structure: Selector::parse(&self.model_structure)?,
            file_reference: Selector::parse(&self.file_reference)?,
            file_name: Selector::parse(&self.file_name)?,
            file_size: Selector::parse(&self.file_size)?,
            attachment_container: Selector::parse(&self.attachment_container)?,
            timestamp_attributes: self.timestamp_attributes.clone(),
            side_index_item: Selector::parse(&self.side_index_item)?,
            side_index_target_attributes: self.side_index_target_attributes.clone(),
            ui_action_labels: self
                .ui_action_labels
                .iter()
                .map(|l| l.trim().to_lowercase())
                .collect(),
        })
    }
}
