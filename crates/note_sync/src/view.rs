use std::collections::BTreeSet;

use core_types::{Note, NoteId};
use serde::{Deserialize, Serialize};

pub const ALL_CATEGORIES: &str = "All";

/// Pinned notes first, then most recently updated. Stable, so equal keys
/// keep the order the store delivered them in.
pub fn sort_notes(notes: &mut [Note]) {
    notes.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.updated_at.cmp(&a.updated_at))
    });
}

/// Every distinct tag across `notes`, lexicographically sorted.
pub fn collect_tags(notes: &[Note]) -> Vec<String> {
    notes
        .iter()
        .flat_map(|note| note.tags.iter().cloned())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `All` followed by the sorted union of note categories, user-added
/// categories and the default category.
pub fn collect_categories(
    notes: &[Note],
    custom: &BTreeSet<String>,
    default_category: &str,
) -> Vec<String> {
    let mut names: BTreeSet<String> = notes
        .iter()
        .filter_map(|note| note.category.clone())
        .collect();
    names.extend(custom.iter().cloned());
    names.insert(default_category.to_string());
    names.remove(ALL_CATEGORIES);

    let mut categories = Vec::with_capacity(names.len() + 1);
    categories.push(ALL_CATEGORIES.to_string());
    categories.extend(names);
    categories
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewFilter {
    pub category: String,
    pub tags: BTreeSet<String>,
}

impl Default for ViewFilter {
    fn default() -> Self {
        Self {
            category: ALL_CATEGORIES.to_string(),
            tags: BTreeSet::new(),
        }
    }
}

impl ViewFilter {
    pub fn matches(&self, note: &Note) -> bool {
        let category_ok = self.category == ALL_CATEGORIES
            || note.category.as_deref() == Some(self.category.as_str());
        let tags_ok = self.tags.is_subset(&note.tags);
        category_ok && tags_ok
    }

    pub fn toggle_tag(&mut self, tag: &str) {
        if !self.tags.remove(tag) {
            self.tags.insert(tag.to_string());
        }
    }

    pub fn is_active(&self) -> bool {
        self.category != ALL_CATEGORIES || !self.tags.is_empty()
    }
}

pub fn apply_filter(sorted: &[Note], filter: &ViewFilter) -> Vec<Note> {
    sorted
        .iter()
        .filter(|note| filter.matches(note))
        .cloned()
        .collect()
}

/// Free-text search over a full note set. Ignores category and tag filters.
pub fn search_notes(notes: Vec<Note>, query: &str) -> Vec<Note> {
    let mut hits: Vec<Note> = notes
        .into_iter()
        .filter(|note| note.matches_text(query))
        .collect();
    sort_notes(&mut hits);
    hits
}

/// Picks the active note after a recompute: keep the current one while it is
/// still in view, otherwise fall back to the first note of the view.
pub fn reselect_active<'a>(current: Option<&NoteId>, view: &'a [Note]) -> Option<&'a Note> {
    match current {
        Some(id) => view
            .iter()
            .find(|note| &note.id == id)
            .or_else(|| view.first()),
        None => view.first(),
    }
}
