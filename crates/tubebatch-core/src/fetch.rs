//! Incremental playlist/channel fetching.
//!
//! Drives a two-phase fetch on a background worker: a fast flat listing,
//! then optional per-item enrichment. Each resolved item is streamed into
//! the entry store immediately so the presentation layer can show it while
//! the rest of the batch is still resolving.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::Date;
use tracing::{debug, info, warn};

use crate::backend::ExtractionBackend;
use crate::backoff::BackoffPolicy;
use crate::entry::Lifecycle;
use crate::error::{Error, Result};
use crate::select::parse_upload_date;
use crate::session::{SessionContext, SessionEvent};

/// Pause between per-item enrichment calls, to stay under the backend's
/// rate limits.
const ENRICH_PACE: Duration = Duration::from_millis(100);

/// Fetch state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FetchPhase {
    /// No fetch in flight.
    #[default]
    Idle,
    /// Flat listing in flight.
    Listing,
    /// Per-item enrichment in flight.
    Enriching,
}

/// Options for one fetch.
#[derive(Debug, Clone, Copy, Default)]
pub struct FetchOptions {
    /// Keep only the first N entries of the listing.
    pub limit: Option<usize>,
    /// Drop entries uploaded strictly before this date.
    ///
    /// Requires `full_metadata`; without it the cutoff is ignored with a
    /// notice (flat listings carry no dates).
    pub date_cutoff: Option<Date>,
    /// Enrich every entry with full metadata (slow, adds upload dates).
    pub full_metadata: bool,
}

/// Final counts for one fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchReport {
    /// Entries requested after applying the limit.
    pub requested: usize,
    /// Entries delivered into the store.
    pub delivered: usize,
    /// Entries delivered with degraded flat metadata (enrichment failed).
    pub fallback: usize,
    /// Entries dropped by the date cutoff.
    pub dropped_by_date: usize,
    /// Items the backend could not resolve at all.
    pub unavailable: usize,
}

/// Drives incremental fetches against the extraction backend.
pub struct FetchController {
    backend: Arc<dyn ExtractionBackend>,
    phase: Arc<Mutex<FetchPhase>>,
    enrich_pace: Duration,
}

impl FetchController {
    /// Create a controller with the default enrichment pacing.
    #[must_use]
    pub fn new(backend: Arc<dyn ExtractionBackend>) -> Self {
        Self::with_pace(backend, ENRICH_PACE)
    }

    /// Create a controller with explicit pacing (tests use zero).
    #[must_use]
    pub fn with_pace(backend: Arc<dyn ExtractionBackend>, enrich_pace: Duration) -> Self {
        Self {
            backend,
            phase: Arc::new(Mutex::new(FetchPhase::Idle)),
            enrich_pace,
        }
    }

    /// Current fetch phase.
    #[must_use]
    pub fn phase(&self) -> FetchPhase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a fetch to completion.
    ///
    /// Re-entrant calls while a fetch is in flight are rejected. A failure of
    /// the flat listing aborts the whole fetch; per-item enrichment failures
    /// are contained (the flat descriptor is delivered as a degraded
    /// fallback) and never abort the batch. An in-flight fetch is not
    /// preemptible; `start` can be invoked again once it returns.
    ///
    /// # Errors
    ///
    /// Returns an error when a fetch is already in flight or the listing
    /// fails.
    pub async fn start(
        &self,
        ctx: &SessionContext,
        collection_url: String,
        options: FetchOptions,
    ) -> Result<FetchReport> {
        {
            let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
            if *phase != FetchPhase::Idle {
                warn!("fetch already in progress; ignoring start request");
                return Err(Error::Configuration(
                    "a fetch is already in progress".to_string(),
                ));
            }
            *phase = FetchPhase::Listing;
        }
        ctx.emit(SessionEvent::FetchStarted {
            collection_url: collection_url.clone(),
        });

        let backend = Arc::clone(&self.backend);
        let phase = Arc::clone(&self.phase);
        let ctx = ctx.clone();
        let pace = self.enrich_pace;

        let outcome = tokio::task::spawn_blocking(move || {
            let result = run_fetch(&backend, &phase, &ctx, &collection_url, options, pace);
            *phase.lock().unwrap_or_else(PoisonError::into_inner) = FetchPhase::Idle;
            if let Err(err) = &result {
                ctx.emit(SessionEvent::FetchFailed {
                    message: err.to_string(),
                });
            }
            result
        })
        .await;

        match outcome {
            Ok(report) => report,
            Err(join_err) => Err(Error::BackendInternal(format!(
                "fetch worker panicked: {join_err}"
            ))),
        }
    }

    /// Refresh one entry's metadata on demand.
    ///
    /// Marks the entry `Analyzing` while the backend call is in flight and
    /// replaces its metadata in place on success. Independent of the batch
    /// fetch; may run while the store is otherwise idle.
    ///
    /// # Errors
    ///
    /// Returns an error when the entry is unknown or the backend call fails;
    /// the entry's metadata is left untouched in that case.
    pub async fn analyze_entry(&self, ctx: &SessionContext, identity: &str) -> Result<()> {
        let item_url = {
            let store = ctx.store();
            let Some((entry, _)) = store.get(identity) else {
                return Err(Error::NotFound(format!("no entry with id {identity}")));
            };
            entry.source_locator.clone()
        };

        let previous = {
            let mut store = ctx.store_mut();
            let mut previous = Lifecycle::Pending;
            store.update_state(identity, |state| {
                previous = state.lifecycle;
                state.lifecycle = Lifecycle::Analyzing;
            });
            previous
        };

        let backend = Arc::clone(&self.backend);
        let fetch_url = item_url.clone();
        let backoff = BackoffPolicy::permissive(&ctx.config().backoff);
        let outcome = tokio::task::spawn_blocking(move || {
            backoff.run(|| backend.fetch_full_metadata(&fetch_url))
        })
        .await
        .map_err(|join_err| Error::BackendInternal(format!("analyze worker panicked: {join_err}")))?;

        let mut store = ctx.store_mut();
        store.update_state(identity, |state| state.lifecycle = previous);
        match outcome {
            Ok(full) => {
                debug!(identity, "refreshed entry metadata");
                store.append(full);
                drop(store);
                ctx.emit(SessionEvent::EntryUpdated {
                    identity: identity.to_string(),
                });
                Ok(())
            }
            Err(err) => {
                warn!(identity, error = %err, "analyze failed");
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for FetchController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchController")
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// The blocking fetch body. Runs on a worker thread.
fn run_fetch(
    backend: &Arc<dyn ExtractionBackend>,
    phase: &Arc<Mutex<FetchPhase>>,
    ctx: &SessionContext,
    collection_url: &str,
    options: FetchOptions,
    pace: Duration,
) -> Result<FetchReport> {
    let listing = backend.list_entries(collection_url, true)?;
    let mut report = FetchReport {
        unavailable: listing.unavailable,
        ..Default::default()
    };
    if listing.unavailable > 0 {
        ctx.emit(SessionEvent::Notice {
            message: format!(
                "skipped {} unavailable/deleted items",
                listing.unavailable
            ),
        });
    }

    let mut flat_entries = listing.entries;
    if let Some(limit) = options.limit {
        if flat_entries.len() > limit {
            info!(limit, total = flat_entries.len(), "limiting fetched entries");
            flat_entries.truncate(limit);
        }
    }
    report.requested = flat_entries.len();

    let date_cutoff = if options.date_cutoff.is_some() && !options.full_metadata {
        ctx.emit(SessionEvent::Notice {
            message: "date filtering requires full metadata; proceeding without it".to_string(),
        });
        warn!("date cutoff ignored: flat listings carry no upload dates");
        None
    } else {
        options.date_cutoff
    };

    ctx.store_mut().clear();

    if options.full_metadata {
        *phase.lock().unwrap_or_else(PoisonError::into_inner) = FetchPhase::Enriching;
        let backoff = BackoffPolicy::permissive(&ctx.config().backoff);
        let total = flat_entries.len();

        for (idx, flat) in flat_entries.into_iter().enumerate() {
            let item_url = flat.watch_url();
            match backoff.run(|| backend.fetch_full_metadata(&item_url)) {
                Ok(full) => {
                    if let Some(cutoff) = date_cutoff {
                        let uploaded = full
                            .raw
                            .get("upload_date")
                            .and_then(serde_json::Value::as_str)
                            .and_then(parse_upload_date);
                        // Unparsable dates keep the entry.
                        if let Some(date) = uploaded {
                            if date < cutoff {
                                debug!(identity = %full.id, %date, "dropped by date cutoff");
                                report.dropped_by_date += 1;
                                continue;
                            }
                        }
                    }
                    let identity = full.id.clone();
                    ctx.store_mut().append(full);
                    report.delivered += 1;
                    ctx.emit(SessionEvent::EntryAppended {
                        identity,
                        position: idx + 1,
                        total,
                    });
                }
                Err(err) => {
                    warn!(identity = %flat.id, error = %err, "enrichment failed; using flat metadata");
                    let identity = flat.id.clone();
                    ctx.store_mut().append(flat);
                    report.delivered += 1;
                    report.fallback += 1;
                    ctx.emit(SessionEvent::EntryAppended {
                        identity,
                        position: idx + 1,
                        total,
                    });
                }
            }
            if !pace.is_zero() {
                std::thread::sleep(pace);
            }
        }
    } else {
        let total = flat_entries.len();
        for (idx, flat) in flat_entries.into_iter().enumerate() {
            let identity = flat.id.clone();
            ctx.store_mut().append(flat);
            report.delivered += 1;
            ctx.emit(SessionEvent::EntryAppended {
                identity,
                position: idx + 1,
                total,
            });
        }
    }

    info!(
        requested = report.requested,
        delivered = report.delivered,
        fallback = report.fallback,
        dropped_by_date = report.dropped_by_date,
        "fetch complete"
    );
    ctx.emit(SessionEvent::FetchCompleted {
        requested: report.requested,
        delivered: report.delivered,
        fallback: report.fallback,
        dropped_by_date: report.dropped_by_date,
        unavailable: report.unavailable,
    });
    Ok(report)
}
