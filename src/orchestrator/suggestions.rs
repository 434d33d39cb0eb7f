//! Menu suggestions derived from the waiter's reply.
//!
//! The heuristic is deliberately plain: an item is suggested when its name
//! or its category occurs, case-insensitively, as a substring of the reply.
//! At most [`MAX_SUGGESTIONS`] items are returned, in catalog order.

use aho_corasick::AhoCorasick;
use serde::Serialize;

use crate::store::CatalogItem;

pub const MAX_SUGGESTIONS: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Suggestion {
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price: Option<f64>,
}

impl From<&CatalogItem> for Suggestion {
    fn from(item: &CatalogItem) -> Self {
        let description = item
            .description
            .clone()
            .filter(|d| !d.trim().is_empty())
            .or_else(|| item.category.clone())
            .unwrap_or_default();
        Suggestion {
            kind: "menu_item",
            item_id: Some(item.id.clone()).filter(|id| !id.is_empty()),
            title: item.name.clone(),
            description,
            price: item.price,
        }
    }
}

pub fn extract_suggestions(catalog: &[CatalogItem], reply: &str) -> Vec<Suggestion> {
    let haystack = reply.to_lowercase();

    // one pattern per non-empty name/category, remembering which item owns it
    let mut patterns: Vec<String> = Vec::new();
    let mut owners: Vec<usize> = Vec::new();
    for (idx, item) in catalog.iter().enumerate() {
        for field in std::iter::once(Some(&item.name))
            .chain(std::iter::once(item.category.as_ref()))
            .flatten()
        {
            let pattern = field.to_lowercase();
            if !pattern.is_empty() {
                patterns.push(pattern);
                owners.push(idx);
            }
        }
    }
    if patterns.is_empty() {
        return Vec::new();
    }

    let mut matched = vec![false; catalog.len()];
    match AhoCorasick::new(&patterns) {
        Ok(ac) => {
            for m in ac.find_overlapping_iter(&haystack) {
                matched[owners[m.pattern().as_usize()]] = true;
            }
        }
        Err(err) => {
            tracing::debug!(error = %err, "suggestion matcher unavailable, scanning directly");
            for (pattern, owner) in patterns.iter().zip(&owners) {
                if haystack.contains(pattern.as_str()) {
                    matched[*owner] = true;
                }
            }
        }
    }

    catalog
        .iter()
        .zip(matched)
        .filter(|(_, hit)| *hit)
        .take(MAX_SUGGESTIONS)
        .map(|(item, _)| Suggestion::from(item))
        .collect()
}
