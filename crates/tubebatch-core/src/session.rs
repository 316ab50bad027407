//! Session context and event channel.
//!
//! All mutable session state lives in one explicit context object passed to
//! each component: the entry store, the group registry, the configuration,
//! and the event sender. Background workers publish typed events onto the
//! channel; the presentation layer drains the receiver. No ambient globals.

use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::info;

use crate::config::AppConfig;
use crate::entry::EntryStore;
use crate::error::Result;
use crate::group::GroupRegistry;

/// Typed events published by background components.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SessionEvent {
    /// A fetch began for a collection URL.
    FetchStarted {
        /// Collection being fetched.
        collection_url: String,
    },
    /// An entry was appended (or enriched in place) into the store.
    EntryAppended {
        /// Entry identity.
        identity: String,
        /// 1-based position in the stream.
        position: usize,
        /// Total expected entries.
        total: usize,
    },
    /// An entry's metadata was refreshed in place (single-item analyze).
    EntryUpdated {
        /// Entry identity.
        identity: String,
    },
    /// A fetch finished; counts for the summary line.
    FetchCompleted {
        /// Entries the flat listing produced after limiting.
        requested: usize,
        /// Entries delivered into the store.
        delivered: usize,
        /// Entries delivered with degraded (flat) metadata.
        fallback: usize,
        /// Entries dropped by the date cutoff.
        dropped_by_date: usize,
        /// Items the backend could not resolve at all.
        unavailable: usize,
    },
    /// A fetch aborted during the flat listing.
    FetchFailed {
        /// Human-readable reason.
        message: String,
    },
    /// A batch run began.
    BatchStarted {
        /// Number of entries in the batch.
        total: usize,
    },
    /// One entry's download began.
    EntryStarted {
        /// Entry identity.
        identity: String,
        /// 1-based position within the batch.
        position: usize,
        /// Batch size.
        total: usize,
    },
    /// Live progress for the entry currently downloading.
    ProgressUpdated {
        /// Entry identity.
        identity: String,
        /// Completion percentage, 0-100.
        percent: f64,
        /// Momentary speed, bytes per second.
        speed_bps: Option<f64>,
        /// Estimated seconds remaining.
        eta_secs: Option<u64>,
    },
    /// One entry finished successfully.
    EntryCompleted {
        /// Entry identity.
        identity: String,
    },
    /// One entry failed; the batch continues.
    EntryFailed {
        /// Entry identity.
        identity: String,
        /// Failure reason.
        reason: String,
    },
    /// One entry was skipped without network I/O.
    EntrySkipped {
        /// Entry identity.
        identity: String,
    },
    /// A batch run finished.
    BatchCompleted {
        /// Successful downloads.
        completed: usize,
        /// Failed downloads.
        failed: usize,
    },
    /// A batch run stopped early on cancellation.
    BatchCancelled {
        /// Entries never attempted.
        remaining: usize,
    },
    /// Non-fatal notice for the user (configuration conflicts, degradations).
    Notice {
        /// Human-readable message.
        message: String,
    },
}

/// Shared session state passed to every component.
#[derive(Clone)]
pub struct SessionContext {
    store: Arc<RwLock<EntryStore>>,
    groups: Arc<RwLock<GroupRegistry>>,
    config: Arc<RwLock<AppConfig>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl SessionContext {
    /// Create a context and the event receiver the presentation layer drains.
    #[must_use]
    pub fn new(mut config: AppConfig) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        config.validate();
        let (events, receiver) = mpsc::unbounded_channel();
        (
            Self {
                store: Arc::new(RwLock::new(EntryStore::new())),
                groups: Arc::new(RwLock::new(GroupRegistry::new())),
                config: Arc::new(RwLock::new(config)),
                events,
            },
            receiver,
        )
    }

    /// Read access to the entry store.
    pub fn store(&self) -> RwLockReadGuard<'_, EntryStore> {
        self.store.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the entry store.
    pub fn store_mut(&self) -> RwLockWriteGuard<'_, EntryStore> {
        self.store.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read access to the group registry.
    pub fn groups(&self) -> RwLockReadGuard<'_, GroupRegistry> {
        self.groups.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write access to the group registry.
    pub fn groups_mut(&self) -> RwLockWriteGuard<'_, GroupRegistry> {
        self.groups.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current configuration.
    #[must_use]
    pub fn config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the configuration (validated).
    pub fn set_config(&self, mut config: AppConfig) {
        config.validate();
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = config;
    }

    /// Publish an event; silently dropped once the receiver is gone.
    pub(crate) fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    /// Export the currently selected entries as a JSON list.
    ///
    /// Output-only side channel; the core never reads this file back.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn export_selected(&self, path: &Path) -> Result<usize> {
        #[derive(Serialize)]
        struct ExportedEntry<'a> {
            id: &'a str,
            title: &'a str,
            duration: Option<f64>,
            url: &'a str,
        }

        let store = self.store();
        let exported: Vec<ExportedEntry<'_>> = store
            .all()
            .filter(|(_, state)| state.selected && !state.skip)
            .map(|(entry, _)| ExportedEntry {
                id: &entry.identity,
                title: entry.title(),
                duration: entry.duration_secs(),
                url: &entry.source_locator,
            })
            .collect();
        let count = exported.len();
        std::fs::write(path, serde_json::to_string_pretty(&exported)?)?;
        info!(count, path = %path.display(), "exported selected entries");
        Ok(count)
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext").finish_non_exhaustive()
    }
}
