//! The authoritative in-memory collection of discovered items.
//!
//! `EntryStore` owns every `Entry` streamed in by a fetch together with its
//! mutable UI-facing `EntryState`. Lookup by identity is O(1) through an
//! index; positional operations (reorder, renumber) are O(n).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::backend::EntryDescriptor;

/// Per-entry lifecycle during a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    /// Discovered, nothing happened yet.
    #[default]
    Pending,
    /// Deep metadata/quality analysis in flight.
    Analyzing,
    /// Scheduled for download in the current batch.
    Queued,
    /// Download in flight.
    Downloading,
    /// Download finished successfully.
    Complete,
    /// Download failed; reason recorded in the batch report.
    Failed,
    /// Skipped without network I/O (user skip flag).
    Skipped,
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Analyzing => write!(f, "analyzing"),
            Self::Queued => write!(f, "queued"),
            Self::Downloading => write!(f, "downloading"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One discoverable media item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    /// Stable external id, unique within a collection.
    pub identity: String,
    /// Canonical URL for the item.
    pub source_locator: String,
    /// Opaque metadata bag from the extraction backend.
    ///
    /// The core reads only the fields it needs for filtering/sorting
    /// (duration, upload date, title, uploader, counts); everything else is
    /// pass-through for the presentation layer.
    pub raw_metadata: Value,
    /// Current 1-based ordinal position, recomputed on every reorder/sort.
    pub display_index: usize,
}

impl Entry {
    /// Read a string field from the raw metadata bag.
    #[must_use]
    pub fn field_str(&self, key: &str) -> Option<&str> {
        self.raw_metadata.get(key).and_then(Value::as_str)
    }

    /// Read a numeric field from the raw metadata bag.
    ///
    /// Degraded flat descriptors sometimes carry numbers as display strings
    /// ("1.2M"); those are expanded here so filter and sort behave the same
    /// regardless of which fetch phase produced the entry.
    #[must_use]
    pub fn field_f64(&self, key: &str) -> Option<f64> {
        match self.raw_metadata.get(key)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => parse_suffixed_count(s),
            _ => None,
        }
    }

    /// Title, if the backend supplied one.
    #[must_use]
    pub fn title(&self) -> &str {
        self.field_str("title").unwrap_or("Unknown")
    }

    /// Uploader/channel name, if known.
    #[must_use]
    pub fn uploader(&self) -> Option<&str> {
        self.field_str("uploader").or_else(|| self.field_str("channel"))
    }

    /// Upload date in `YYYYMMDD` form, if known (enriched entries only).
    #[must_use]
    pub fn upload_date(&self) -> Option<&str> {
        self.field_str("upload_date").filter(|d| d.len() >= 8)
    }

    /// Duration in seconds, if known.
    #[must_use]
    pub fn duration_secs(&self) -> Option<f64> {
        self.field_f64("duration")
    }
}

/// Expand a possibly K/M-suffixed count ("1.2M", "500K", "42").
fn parse_suffixed_count(s: &str) -> Option<f64> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix(['M', 'm']) {
        return stripped.trim().parse::<f64>().ok().map(|v| v * 1_000_000.0);
    }
    if let Some(stripped) = s.strip_suffix(['K', 'k']) {
        return stripped.trim().parse::<f64>().ok().map(|v| v * 1_000.0);
    }
    s.parse::<f64>().ok()
}

/// Mutable UI-facing state, 1:1 with an `Entry`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryState {
    /// Whether the entry participates in the next batch.
    pub selected: bool,
    /// Per-entry quality preset; only effective in advanced mode.
    pub quality_spec: String,
    /// Group membership, by group name.
    pub group: Option<String>,
    /// Current lifecycle stage.
    pub lifecycle: Lifecycle,
    /// Download progress for the current/last attempt, 0-100.
    pub progress_percent: f64,
    /// Momentary download speed, bytes per second.
    pub speed_bytes_per_sec: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_seconds: Option<u64>,
    /// Explicit user skip flag, independent of lifecycle.
    pub skip: bool,
    /// Whether the entry is in the current working view (not filtered out).
    pub visible: bool,
}

impl Default for EntryState {
    fn default() -> Self {
        Self {
            selected: true,
            quality_spec: "best".to_string(),
            group: None,
            lifecycle: Lifecycle::Pending,
            progress_percent: 0.0,
            speed_bytes_per_sec: None,
            eta_seconds: None,
            skip: false,
            visible: true,
        }
    }
}

impl EntryState {
    /// Reset per-attempt progress fields before a new download.
    pub fn reset_progress(&mut self) {
        self.progress_percent = 0.0;
        self.speed_bytes_per_sec = None;
        self.eta_seconds = None;
    }
}

/// Outcome of appending a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// A new entry was created at this position.
    Added(usize),
    /// An entry with this identity already existed; its metadata was
    /// replaced in place and ordering/state were left untouched.
    Replaced(usize),
}

/// One record in the store.
#[derive(Debug, Clone)]
struct EntryRecord {
    entry: Entry,
    state: EntryState,
}

/// Ordered collection of entries with an identity index.
#[derive(Debug, Default)]
pub struct EntryStore {
    records: Vec<EntryRecord>,
    index: HashMap<String, usize>,
}

impl EntryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Append a descriptor, creating an entry with default state.
    ///
    /// Appending an identity already present replaces the prior entry's
    /// metadata in place (the flat-then-enrich pattern) without creating a
    /// second entry or disturbing ordering and state.
    pub fn append(&mut self, descriptor: EntryDescriptor) -> AppendOutcome {
        let url = descriptor.watch_url();
        if let Some(&pos) = self.index.get(&descriptor.id) {
            debug!(identity = %descriptor.id, "replacing metadata for existing entry");
            let record = &mut self.records[pos];
            record.entry.raw_metadata = descriptor.raw;
            record.entry.source_locator = url;
            return AppendOutcome::Replaced(pos);
        }

        let pos = self.records.len();
        self.index.insert(descriptor.id.clone(), pos);
        self.records.push(EntryRecord {
            entry: Entry {
                identity: descriptor.id,
                source_locator: url,
                raw_metadata: descriptor.raw,
                display_index: pos + 1,
            },
            state: EntryState::default(),
        });
        AppendOutcome::Added(pos)
    }

    /// Empty the collection and the index.
    pub fn clear(&mut self) {
        self.records.clear();
        self.index.clear();
    }

    /// Remove one entry by identity (explicit user removal).
    pub fn remove(&mut self, identity: &str) -> bool {
        let Some(pos) = self.index.remove(identity) else {
            return false;
        };
        self.records.remove(pos);
        self.reindex();
        true
    }

    /// Entry and state by identity.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<(&Entry, &EntryState)> {
        let &pos = self.index.get(identity)?;
        let record = &self.records[pos];
        Some((&record.entry, &record.state))
    }

    /// State by identity.
    #[must_use]
    pub fn state(&self, identity: &str) -> Option<&EntryState> {
        self.get(identity).map(|(_, state)| state)
    }

    /// Apply a partial state update by identity.
    ///
    /// Returns false if the identity is unknown.
    pub fn update_state(&mut self, identity: &str, update: impl FnOnce(&mut EntryState)) -> bool {
        let Some(&pos) = self.index.get(identity) else {
            return false;
        };
        update(&mut self.records[pos].state);
        true
    }

    /// Move one entry to an absolute position, shifting the rest.
    pub fn reorder(&mut self, identity: &str, target_position: usize) -> bool {
        let Some(&pos) = self.index.get(identity) else {
            return false;
        };
        let record = self.records.remove(pos);
        let target = target_position.min(self.records.len());
        self.records.insert(target, record);
        self.reindex();
        true
    }

    /// All entries in display order.
    pub fn all(&self) -> impl Iterator<Item = (&Entry, &EntryState)> {
        self.records.iter().map(|r| (&r.entry, &r.state))
    }

    /// Entries in the current working view (not filtered out).
    pub fn visible(&self) -> impl Iterator<Item = (&Entry, &EntryState)> {
        self.all().filter(|(_, state)| state.visible)
    }

    /// Identities of entries eligible for the next batch, in display order.
    #[must_use]
    pub fn selected_identities(&self) -> Vec<String> {
        self.all()
            .filter(|(_, state)| state.selected && !state.skip)
            .map(|(entry, _)| entry.identity.clone())
            .collect()
    }

    /// Mutate the state of every entry matching a predicate on visibility.
    pub(crate) fn for_each_state(&mut self, mut apply: impl FnMut(&Entry, &mut EntryState)) {
        for record in &mut self.records {
            apply(&record.entry, &mut record.state);
        }
    }

    /// Reorder the visible subset to match `ordered_ids`, leaving hidden
    /// entries at their current positions. Used by sort.
    pub(crate) fn apply_visible_order(&mut self, ordered_ids: &[String]) {
        let visible_slots: Vec<usize> = self
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state.visible)
            .map(|(i, _)| i)
            .collect();
        if visible_slots.len() != ordered_ids.len() {
            return;
        }

        let mut reordered: Vec<EntryRecord> = Vec::with_capacity(visible_slots.len());
        for id in ordered_ids {
            let Some(&pos) = self.index.get(id) else {
                return;
            };
            reordered.push(self.records[pos].clone());
        }
        for (slot, record) in visible_slots.into_iter().zip(reordered) {
            self.records[slot] = record;
        }
        self.reindex();
    }

    /// Recompute the index map and display indices after a structural change.
    pub(crate) fn reindex(&mut self) {
        self.index.clear();
        for (pos, record) in self.records.iter_mut().enumerate() {
            record.entry.display_index = pos + 1;
            self.index.insert(record.entry.identity.clone(), pos);
        }
    }
}
