//! Editor settings served to extensions as serialized JSON.

use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("unknown settings category {category:?}")]
    UnknownCategory { category: String },

    #[error("settings category {category:?} has no key {key:?}")]
    UnknownKey { category: String, key: String },

    #[error("failed to serialize settings")]
    Serialize(#[source] serde_json::Error),
}

/// Scopes a settings query to a file within one worktree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsLocation {
    pub worktree_id: u64,
    pub path: String,
}

/// An immutable view of the editor's settings at one point in time.
///
/// Values are grouped into named categories. A worktree can shadow
/// individual keys; queries carrying a [`SettingsLocation`] see the
/// base values with that worktree's overrides applied on top.
#[derive(Debug, Clone, Default)]
pub struct SettingsSnapshot {
    categories: BTreeMap<String, BTreeMap<String, Value>>,
    overrides: BTreeMap<u64, BTreeMap<String, BTreeMap<String, Value>>>,
}

impl SettingsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, category: &str, key: &str, value: Value) {
        self.categories
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    pub fn insert_override(&mut self, worktree_id: u64, category: &str, key: &str, value: Value) {
        self.overrides
            .entry(worktree_id)
            .or_default()
            .entry(category.to_string())
            .or_default()
            .insert(key.to_string(), value);
    }

    /// Serializes one key (or, with `key` absent, the whole category)
    /// to a JSON string, applying the location's worktree overrides.
    pub fn lookup(
        &self,
        location: Option<&SettingsLocation>,
        category: &str,
        key: Option<&str>,
    ) -> Result<String, SettingsError> {
        let mut merged: BTreeMap<&str, &Value> = BTreeMap::new();
        let mut found = false;

        if let Some(base) = self.categories.get(category) {
            found = true;
            merged.extend(base.iter().map(|(key, value)| (key.as_str(), value)));
        }
        if let Some(location) = location {
            if let Some(overlay) = self
                .overrides
                .get(&location.worktree_id)
                .and_then(|per_tree| per_tree.get(category))
            {
                found = true;
                merged.extend(overlay.iter().map(|(key, value)| (key.as_str(), value)));
            }
        }
        if !found {
            return Err(SettingsError::UnknownCategory {
                category: category.to_string(),
            });
        }

        match key {
            Some(key) => match merged.get(key) {
                Some(value) => serde_json::to_string(value).map_err(SettingsError::Serialize),
                None => Err(SettingsError::UnknownKey {
                    category: category.to_string(),
                    key: key.to_string(),
                }),
            },
            None => serde_json::to_string(&merged).map_err(SettingsError::Serialize),
        }
    }
}
