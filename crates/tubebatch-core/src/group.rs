//! Download groups.
//!
//! A group is a named bundle of entries sharing one override configuration.
//! Group settings are seeded from the global settings at creation time and
//! are independently editable afterwards; they fully supersede per-entry and
//! global settings for members.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{AppConfig, DownloadMode};
use crate::entry::EntryStore;
use crate::error::{Error, Result};

/// Override configuration carried by a group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GroupSettings {
    /// Video quality preset.
    pub quality_spec: String,
    /// Audio quality token.
    pub audio_quality_spec: String,
    /// Video or audio download.
    pub download_mode: DownloadMode,
    /// Container format for merged video output.
    pub container_format: String,
}

impl GroupSettings {
    /// Seed settings from the global defaults.
    #[must_use]
    pub fn from_global(config: &AppConfig) -> Self {
        Self {
            quality_spec: config.quality_spec.clone(),
            audio_quality_spec: config.audio_quality_spec.clone(),
            download_mode: config.download_mode,
            container_format: config.container_format.clone(),
        }
    }
}

/// A named download group.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Group {
    /// Unique name.
    pub name: String,
    /// Presentation hint only.
    pub color: String,
    /// Override configuration for members.
    pub settings: GroupSettings,
}

/// Registry of groups, keyed by name.
#[derive(Debug, Default)]
pub struct GroupRegistry {
    groups: BTreeMap<String, Group>,
}

impl GroupRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a group seeded from the global settings.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an empty or duplicate name.
    pub fn create(&mut self, name: &str, color: &str, config: &AppConfig) -> Result<&Group> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::Configuration("group name cannot be empty".to_string()));
        }
        if self.groups.contains_key(name) {
            return Err(Error::Configuration(format!(
                "a group named '{name}' already exists"
            )));
        }
        let group = Group {
            name: name.to_string(),
            color: color.to_string(),
            settings: GroupSettings::from_global(config),
        };
        info!(name, "created group");
        Ok(self.groups.entry(name.to_string()).or_insert(group))
    }

    /// Delete a group, clearing membership on all its entries.
    ///
    /// Other entry state is untouched.
    pub fn delete(&mut self, name: &str, store: &mut EntryStore) -> bool {
        if self.groups.remove(name).is_none() {
            return false;
        }
        store.for_each_state(|_, state| {
            if state.group.as_deref() == Some(name) {
                state.group = None;
            }
        });
        info!(name, "deleted group");
        true
    }

    /// Look up a group by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    /// Mutable access for editing a group's settings.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Group> {
        self.groups.get_mut(name)
    }

    /// Whether a group exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.groups.contains_key(name)
    }

    /// All group names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Number of groups.
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    /// Whether the registry has no groups.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EntryDescriptor;
    use serde_json::json;

    fn seeded_store() -> EntryStore {
        let mut store = EntryStore::new();
        for id in ["a", "b"] {
            store.append(EntryDescriptor {
                id: id.to_string(),
                url: None,
                title: None,
                raw: json!({ "id": id }),
            });
        }
        store
    }

    #[test]
    fn test_create_seeds_settings_from_global() {
        let config = AppConfig {
            quality_spec: "720p".to_string(),
            ..Default::default()
        };
        let mut registry = GroupRegistry::new();
        let group = registry.create("music", "#3498DB", &config).expect("create");
        assert_eq!(group.settings.quality_spec, "720p");
        assert_eq!(group.settings.download_mode, DownloadMode::Video);
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let config = AppConfig::default();
        let mut registry = GroupRegistry::new();
        registry.create("music", "#fff", &config).expect("create");
        assert!(matches!(
            registry.create("music", "#000", &config),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_settings_editable_after_creation() {
        let config = AppConfig::default();
        let mut registry = GroupRegistry::new();
        registry.create("music", "#fff", &config).expect("create");
        registry
            .get_mut("music")
            .expect("group")
            .settings
            .quality_spec = "480p".to_string();
        assert_eq!(
            registry.get("music").expect("group").settings.quality_spec,
            "480p"
        );
    }

    #[test]
    fn test_delete_clears_membership_only() {
        let config = AppConfig::default();
        let mut registry = GroupRegistry::new();
        registry.create("music", "#fff", &config).expect("create");

        let mut store = seeded_store();
        store.update_state("a", |s| {
            s.group = Some("music".to_string());
            s.selected = false;
        });

        assert!(registry.delete("music", &mut store));
        let state = store.state("a").expect("state");
        assert_eq!(state.group, None);
        // Other state is untouched.
        assert!(!state.selected);
    }

    #[test]
    fn test_delete_unknown_group() {
        let mut registry = GroupRegistry::new();
        let mut store = seeded_store();
        assert!(!registry.delete("nope", &mut store));
    }
}
