//! Attachment metadata discovery
//!
//! Three passes over one turn, deduplicated by name across all of them:
//! 1. dedicated file reference nodes (name, size label, timestamp)
//! 2. broader attachment containers not already captured
//! 3. filename-looking aria labels, titles and text

use super::{inside_reasoning, Attachment};
use crate::profile::CompiledProfile;
use crate::tree::{Document, NodeId};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

const FILE_EXTENSIONS: &str = "pdf|docx?|xlsx?|pptx?|csv|tsv|txt|md|json|xml|ya?ml|html?|rtf|odt|png|jpe?g|gif|webp|svg|heic|mp3|wav|mp4|mov|zip|py|rs|js|ts|java|c|cpp|go|rb|sh|ipynb";

const NAME_ATTRIBUTES: &[&str] = &["data-file-name", "title", "aria-label"];

const SIZE_ATTRIBUTES: &[&str] = &["data-token-count", "data-size"];

pub struct AttachmentExtractor {
    profile: Arc<CompiledProfile>,
    filename_in_label: Regex,
    filename_only: Regex,
    iso_8601: Regex,
    sql_datetime: Regex,
    slash_date: Regex,
    epoch: Regex,
    time_of_day: Regex,
}

impl AttachmentExtractor {
    pub fn new(profile: Arc<CompiledProfile>) -> Self {
        Self {
            profile,
            filename_in_label: Regex::new(&format!(
                r"(?i)([^\s/\\:]+\.(?:{}))(?:$|[\s,;)])",
                FILE_EXTENSIONS
            ))
            .unwrap(),
            filename_only: Regex::new(&format!(r"(?i)^[^\s/\\:]+\.(?:{})$", FILE_EXTENSIONS))
                .unwrap(),
            iso_8601: Regex::new(
                r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(?::\d{2}(?:\.\d+)?)?(?:Z|[+-]\d{2}:?\d{2})?$",
            )
            .unwrap(),
            sql_datetime: Regex::new(r"^\d{4}-\d{2}-\d{2} \d{2}:\d{2}(?::\d{2})?$").unwrap(),
            slash_date: Regex::new(
                r"^\d{1,2}/\d{1,2}/\d{2,4}(?:,?\s+\d{1,2}:\d{2}(?::\d{2})?(?:\s*[AaPp][Mm])?)?$",
            )
            .unwrap(),
            epoch: Regex::new(r"^\d{10,13}$").unwrap(),
            time_of_day: Regex::new(r"\b(?:[01]?\d|2[0-3]):[0-5]\d(?::[0-5]\d)?\b").unwrap(),
        }
    }

    /// Attachments of one turn. Finding nothing gives an empty list.
    pub fn extract(&self, doc: &Document, turn: NodeId) -> Vec<Attachment> {
        let profile = &self.profile;
        let mut found = Vec::new();
        let mut seen = HashSet::new();

        for reference in doc.query_all(turn, &profile.file_reference) {
            if inside_reasoning(doc, reference, turn, profile) {
                continue;
            }
            let Some(name) = self.reference_name(doc, reference) else {
                continue;
            };
            let size = doc
                .query_first(reference, &profile.file_size)
                .map(|s| doc.text_content(s).trim().to_string())
                .filter(|s| !s.is_empty())
                .or_else(|| first_attr(doc, reference, SIZE_ATTRIBUTES))
                .unwrap_or_default();
            let timestamp = self.resolve_timestamp(doc, reference, turn);
            push_unique(&mut found, &mut seen, name, size, timestamp);
        }

        for container in doc.query_all(turn, &profile.attachment_container) {
            if inside_reasoning(doc, container, turn, profile) {
                continue;
            }
            let name = NAME_ATTRIBUTES
                .iter()
                .filter_map(|a| doc.node(container)?.attr(a))
                .find_map(|v| self.filename_from_label(v))
                .or_else(|| {
                    doc.query_first(container, &profile.file_name)
                        .and_then(|n| self.filename_from_label(&doc.text_content(n)))
                });
            let Some(name) = name else {
                continue;
            };
            let timestamp = self.resolve_timestamp(doc, container, turn);
            push_unique(&mut found, &mut seen, name, String::new(), timestamp);
        }

        for node in doc.descendants(turn) {
            if inside_reasoning(doc, node, turn, profile) {
                continue;
            }
            let Some(element) = doc.node(node) else {
                continue;
            };
            let name = ["aria-label", "title"]
                .iter()
                .filter_map(|a| element.attr(a))
                .find_map(|v| self.filename_from_label(v))
                .or_else(|| {
                    let text = element.text.trim();
                    self.filename_only
                        .is_match(text)
                        .then(|| text.to_string())
                });
            let Some(name) = name else {
                continue;
            };
            let timestamp = self.resolve_timestamp(doc, node, turn);
            push_unique(&mut found, &mut seen, name, String::new(), timestamp);
        }

        found
    }

    fn reference_name(&self, doc: &Document, reference: NodeId) -> Option<String> {
        let element = doc.node(reference)?;
        if let Some(name) = element.attr("data-file-name").map(str::trim).filter(|n| !n.is_empty()) {
            return Some(name.to_string());
        }
        for attr in ["title", "aria-label"] {
            if let Some(value) = element.attr(attr) {
                if let Some(name) = self.filename_from_label(value) {
                    return Some(name);
                }
            }
        }
        if let Some(label) = doc.query_first(reference, &self.profile.file_name) {
            let text = doc.text_content(label).trim().to_string();
            if !text.is_empty() {
                return Some(text);
            }
        }
        doc.text_content(reference)
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(str::to_string)
    }

    fn filename_from_label(&self, label: &str) -> Option<String> {
        self.filename_in_label
            .captures(label.trim())
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }

    /// Timestamp cascade; each step runs only when the previous found nothing.
    fn resolve_timestamp(&self, doc: &Document, node: NodeId, turn: NodeId) -> Option<String> {
        self.known_timestamp_attribute(doc, node, turn)
            .or_else(|| self.time_like_attribute(doc, node, turn))
            .or_else(|| {
                let text = doc.text_content(turn);
                self.time_of_day.find(&text).map(|m| m.as_str().to_string())
            })
    }

    fn known_timestamp_attribute(&self, doc: &Document, node: NodeId, turn: NodeId) -> Option<String> {
        let chain = std::iter::once(node).chain(
            doc.ancestors(node)
                .into_iter()
                .take_while(move |a| *a != turn)
                .chain(std::iter::once(turn)),
        );
        for id in chain {
            let Some(element) = doc.node(id) else {
                continue;
            };
            for attr in &self.profile.timestamp_attributes {
                if let Some(value) = element.attr(attr).map(str::trim).filter(|v| !v.is_empty()) {
                    return Some(self.normalize_timestamp(value));
                }
            }
        }
        None
    }

    fn time_like_attribute(&self, doc: &Document, node: NodeId, turn: NodeId) -> Option<String> {
        let container = doc
            .closest(node, &self.profile.attachment_container)
            .filter(|c| doc.is_within(*c, turn));
        let candidates = [Some(node), container, Some(turn)];
        for id in candidates.into_iter().flatten() {
            let Some(element) = doc.node(id) else {
                continue;
            };
            for (name, value) in &element.attrs {
                let name = name.to_ascii_lowercase();
                if !(name.contains("time") || name.contains("date")) {
                    continue;
                }
                let value = value.trim();
                if self.is_timestamp_value(value) {
                    return Some(self.normalize_timestamp(value));
                }
            }
        }
        None
    }

    fn is_timestamp_value(&self, value: &str) -> bool {
        self.iso_8601.is_match(value)
            || self.sql_datetime.is_match(value)
            || self.slash_date.is_match(value)
            || self.epoch.is_match(value)
    }

    /// Epoch values become RFC 3339; everything else is kept verbatim.
    fn normalize_timestamp(&self, value: &str) -> String {
        if !self.epoch.is_match(value) {
            return value.to_string();
        }
        let Ok(number) = value.parse::<i64>() else {
            return value.to_string();
        };
        let parsed = if value.len() >= 13 {
            DateTime::<Utc>::from_timestamp_millis(number)
        } else {
            DateTime::<Utc>::from_timestamp(number, 0)
        };
        parsed
            .map(|dt| dt.to_rfc3339())
            .unwrap_or_else(|| value.to_string())
    }
}

fn first_attr(doc: &Document, id: NodeId, names: &[&str]) -> Option<String> {
    let element = doc.node(id)?;
    names
        .iter()
        .filter_map(|n| element.attr(n))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

fn file_kind(name: &str) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && ext.len() <= 8 => {
            ext.to_ascii_lowercase()
        }
        _ => "file".to_string(),
    }
}

fn push_unique(
    found: &mut Vec<Attachment>,
    seen: &mut HashSet<String>,
    name: String,
    token_count_label: String,
    timestamp: Option<String>,
) {
    if !seen.insert(name.clone()) {
        return;
    }
    found.push(Attachment {
        kind: file_kind(&name),
        name,
        token_count_label,
        timestamp,
    });
}
