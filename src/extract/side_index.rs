//! Short turn labels harvested from the navigation side index
//!
//! Used as a last resort when a turn's own content never became readable.

use crate::analysis;
use crate::profile::CompiledProfile;
use crate::tree::Document;
use std::collections::HashMap;

/// Map of turn id to label, first label per turn wins.
pub fn harvest_side_index(doc: &Document, profile: &CompiledProfile) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    for item in doc.query_all(doc.root(), &profile.side_index_item) {
        let Some(element) = doc.node(item) else {
            continue;
        };
        let Some(target) = profile
            .side_index_target_attributes
            .iter()
            .filter_map(|a| element.attr(a))
            .map(|t| t.trim().trim_start_matches('#'))
            .find(|t| !t.is_empty())
        else {
            continue;
        };

        let label = doc
            .text_content(item)
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if label.is_empty()
            || profile.ui_action_labels.contains(&label.to_lowercase())
            || analysis::looks_like_analysis_prompt(&label)
        {
            continue;
        }
        labels.entry(target.to_string()).or_insert(label);
    }
    labels
}
