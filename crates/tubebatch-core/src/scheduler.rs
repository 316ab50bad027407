//! Batch download scheduling.
//!
//! Consumes an ordered list of entry identities, resolves each entry's
//! effective configuration, and executes downloads one at a time against the
//! extraction backend. Single-item failures never abort the batch;
//! cancellation is cooperative and checked before each new entry.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, info, warn};

use crate::backend::{DownloadRequest, ExtractionBackend, ProgressCallback, ffmpeg_available};
use crate::backoff::BackoffPolicy;
use crate::entry::Lifecycle;
use crate::error::{Error, Result};
use crate::format::{UNRESTRICTED_SELECTOR, derive_format_plan};
use crate::select::{EffectiveConfig, resolve_effective_config};
use crate::session::{SessionContext, SessionEvent};
use crate::template::to_backend_template;

/// Cooperative cancellation token for a batch run.
///
/// Cancellation is observed before each new entry begins; an in-flight
/// single download is not interrupted mid-transfer.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Create a fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// One failed entry with its reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    /// Entry identity.
    pub identity: String,
    /// Human-readable failure reason.
    pub reason: String,
}

/// Outcome of one batch run.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Identities downloaded successfully, in processing order.
    pub completed: Vec<String>,
    /// Failures with per-entry reasons, in processing order.
    pub failed: Vec<BatchFailure>,
    /// Identities skipped via the user skip flag.
    pub skipped: Vec<String>,
    /// Whether the run stopped early on cancellation.
    pub cancelled: bool,
}

impl BatchReport {
    /// Number of successful downloads.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    /// Number of failed downloads.
    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    /// Identities of the failed entries, for a retry run.
    #[must_use]
    pub fn failed_identities(&self) -> Vec<String> {
        self.failed.iter().map(|f| f.identity.clone()).collect()
    }

    /// Human-readable summary line, e.g. "14 succeeded, 2 failed".
    #[must_use]
    pub fn summary(&self) -> String {
        let mut line = format!(
            "{} succeeded, {} failed",
            self.completed_count(),
            self.failed_count()
        );
        if !self.skipped.is_empty() {
            line.push_str(&format!(", {} skipped", self.skipped.len()));
        }
        if self.cancelled {
            line.push_str(" (cancelled)");
        }
        line
    }
}

/// Outcome of a single download attempt sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The download finished.
    Success,
    /// The download failed with this reason.
    Failed(String),
    /// The job never ran because the batch was cancelled.
    Cancelled,
}

/// Ephemeral record of one scheduled download.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    /// Entry identity.
    pub entry_identity: String,
    /// Configuration the job ran with.
    pub effective_config: EffectiveConfig,
    /// Backend invocations performed (includes the format fallback).
    pub attempt_count: u32,
    /// Final outcome.
    pub outcome: JobOutcome,
}

/// Executes batch downloads strictly sequentially.
///
/// The "parallel downloads" configuration value is validated and surfaced
/// but not honored here; entries are processed in exactly the order handed
/// to [`DownloadScheduler::start`].
pub struct DownloadScheduler {
    backend: Arc<dyn ExtractionBackend>,
    running: Arc<AtomicBool>,
    toolchain_available: bool,
}

impl DownloadScheduler {
    /// Create a scheduler, probing the media toolchain once.
    #[must_use]
    pub fn new(backend: Arc<dyn ExtractionBackend>) -> Self {
        Self::with_toolchain(backend, ffmpeg_available())
    }

    /// Create a scheduler with an explicit toolchain flag (tests).
    #[must_use]
    pub fn with_toolchain(backend: Arc<dyn ExtractionBackend>, toolchain_available: bool) -> Self {
        Self {
            backend,
            running: Arc::new(AtomicBool::new(false)),
            toolchain_available,
        }
    }

    /// Whether a batch is currently running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a batch over the currently selected entries.
    ///
    /// # Errors
    ///
    /// Same guards as [`DownloadScheduler::start`].
    pub async fn start_selected(
        &self,
        ctx: &SessionContext,
        cancel: CancelToken,
    ) -> Result<BatchReport> {
        let identities = ctx.store().selected_identities();
        self.start(ctx, identities, cancel).await
    }

    /// Start a batch over an explicit, ordered list of identities.
    ///
    /// Entries are processed strictly sequentially in the given order. A
    /// single entry's failure is recorded and processing continues; only the
    /// guards below abort the whole run.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a batch is already running or the
    /// destination directory does not exist.
    pub async fn start(
        &self,
        ctx: &SessionContext,
        identities: Vec<String>,
        cancel: CancelToken,
    ) -> Result<BatchReport> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Configuration(
                "a download batch is already running".to_string(),
            ));
        }

        let config = ctx.config();
        if let Err(err) = config.check_destination() {
            self.running.store(false, Ordering::SeqCst);
            return Err(err);
        }
        if config.parallel_downloads > 1 {
            warn!(
                parallel_downloads = config.parallel_downloads,
                "parallel downloads configured but not honored; processing sequentially"
            );
        }

        info!(total = identities.len(), "starting download batch");
        ctx.emit(SessionEvent::BatchStarted {
            total: identities.len(),
        });

        let backend = Arc::clone(&self.backend);
        let running = Arc::clone(&self.running);
        let ctx = ctx.clone();
        let toolchain = self.toolchain_available;

        let outcome = tokio::task::spawn_blocking(move || {
            let report = run_batch(&backend, &ctx, &config, &identities, &cancel, toolchain);
            running.store(false, Ordering::SeqCst);
            ctx.emit(SessionEvent::BatchCompleted {
                completed: report.completed_count(),
                failed: report.failed_count(),
            });
            info!(summary = %report.summary(), "batch finished");
            report
        })
        .await;

        match outcome {
            Ok(report) => Ok(report),
            Err(join_err) => {
                self.running.store(false, Ordering::SeqCst);
                Err(Error::BackendInternal(format!(
                    "batch worker panicked: {join_err}"
                )))
            }
        }
    }
}

impl std::fmt::Debug for DownloadScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadScheduler")
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The blocking batch body. Runs on a worker thread.
fn run_batch(
    backend: &Arc<dyn ExtractionBackend>,
    ctx: &SessionContext,
    config: &crate::config::AppConfig,
    identities: &[String],
    cancel: &CancelToken,
    toolchain: bool,
) -> BatchReport {
    let mut report = BatchReport::default();
    let total = identities.len();
    let output_template = to_backend_template(&config.filename_template);

    {
        let mut store = ctx.store_mut();
        for identity in identities {
            store.update_state(identity, |s| {
                if !s.skip {
                    s.lifecycle = Lifecycle::Queued;
                }
            });
        }
    }

    for (pos, identity) in identities.iter().enumerate() {
        // Cooperative cancellation: checked before each new entry only.
        // Entries never attempted go back to their pre-batch lifecycle,
        // never to Failed or Skipped.
        if cancel.is_cancelled() {
            report.cancelled = true;
            let remaining = total - pos;
            let mut store = ctx.store_mut();
            for identity in &identities[pos..] {
                store.update_state(identity, |s| {
                    if s.lifecycle == Lifecycle::Queued {
                        s.lifecycle = Lifecycle::Pending;
                    }
                });
            }
            drop(store);
            warn!(remaining, "batch cancelled");
            ctx.emit(SessionEvent::BatchCancelled { remaining });
            break;
        }

        let snapshot = {
            let store = ctx.store();
            store
                .get(identity)
                .map(|(entry, state)| (entry.source_locator.clone(), state.clone()))
        };
        let Some((url, state)) = snapshot else {
            report.failed.push(BatchFailure {
                identity: identity.clone(),
                reason: "entry no longer present".to_string(),
            });
            continue;
        };

        if state.skip {
            debug!(identity, "entry skipped by user flag");
            ctx.store_mut()
                .update_state(identity, |s| s.lifecycle = Lifecycle::Skipped);
            ctx.emit(SessionEvent::EntrySkipped {
                identity: identity.clone(),
            });
            report.skipped.push(identity.clone());
            continue;
        }

        let effective = {
            let groups = ctx.groups();
            resolve_effective_config(&state, &groups, config)
        };
        let plan = derive_format_plan(&effective, toolchain);

        ctx.store_mut().update_state(identity, |s| {
            s.lifecycle = Lifecycle::Downloading;
            s.reset_progress();
        });
        ctx.emit(SessionEvent::EntryStarted {
            identity: identity.clone(),
            position: pos + 1,
            total,
        });
        info!(identity, position = pos + 1, total, "downloading entry");

        let request = DownloadRequest {
            url,
            format_selector: plan.selector,
            output_template: output_template.clone(),
            destination: config.destination_dir.clone(),
            transcode: plan.transcode,
            merge_container: plan.merge_container,
        };

        let mut job = DownloadJob {
            entry_identity: identity.clone(),
            effective_config: effective,
            attempt_count: 0,
            outcome: JobOutcome::Cancelled,
        };
        let result = execute_download(backend, ctx, identity, &request, &mut job.attempt_count);

        match result {
            Ok(()) => {
                job.outcome = JobOutcome::Success;
                ctx.store_mut().update_state(identity, |s| {
                    s.lifecycle = Lifecycle::Complete;
                    s.progress_percent = 100.0;
                });
                ctx.emit(SessionEvent::EntryCompleted {
                    identity: identity.clone(),
                });
                report.completed.push(identity.clone());
            }
            Err(err) => {
                let reason = err.to_string();
                job.outcome = JobOutcome::Failed(reason.clone());
                error!(identity, error = %reason, "entry failed; continuing batch");
                ctx.store_mut()
                    .update_state(identity, |s| s.lifecycle = Lifecycle::Failed);
                ctx.emit(SessionEvent::EntryFailed {
                    identity: identity.clone(),
                    reason: reason.clone(),
                });
                report.failed.push(BatchFailure {
                    identity: identity.clone(),
                    reason,
                });
            }
        }
        debug!(?job, "download job finished");
    }

    report
}

/// One entry's download with minimal backoff and the unsupported-format
/// fallback.
fn execute_download(
    backend: &Arc<dyn ExtractionBackend>,
    ctx: &SessionContext,
    identity: &str,
    request: &DownloadRequest,
    attempts: &mut u32,
) -> Result<()> {
    let policy = BackoffPolicy::minimal();
    let result = policy.run(|| {
        *attempts += 1;
        backend.download(request, Some(progress_sink(ctx, identity)))
    });

    match result {
        Err(Error::UnsupportedFormat(_)) if request.format_selector != UNRESTRICTED_SELECTOR => {
            warn!(
                identity,
                selector = %request.format_selector,
                "requested format unavailable; retrying with unrestricted selector"
            );
            ctx.emit(SessionEvent::Notice {
                message: format!("{identity}: requested quality unavailable, using best"),
            });
            let fallback = DownloadRequest {
                format_selector: UNRESTRICTED_SELECTOR.to_string(),
                ..request.clone()
            };
            policy.run(|| {
                *attempts += 1;
                backend.download(&fallback, Some(progress_sink(ctx, identity)))
            })
        }
        other => other,
    }
}

/// Progress callback writing live state back into the store and the event
/// channel.
fn progress_sink(ctx: &SessionContext, identity: &str) -> ProgressCallback {
    let ctx = ctx.clone();
    let identity = identity.to_string();
    Box::new(move |tick| {
        ctx.store_mut().update_state(&identity, |s| {
            s.progress_percent = tick.percent.clamp(0.0, 100.0);
            s.speed_bytes_per_sec = tick.speed_bps;
            s.eta_seconds = tick.eta_secs;
        });
        ctx.emit(SessionEvent::ProgressUpdated {
            identity: identity.clone(),
            percent: tick.percent,
            speed_bps: tick.speed_bps,
            eta_secs: tick.eta_secs,
        });
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EntryDescriptor, MockExtractionBackend, ProgressTick};
    use crate::config::AppConfig;
    use serde_json::json;
    use std::path::PathBuf;

    fn seeded_context(ids: &[&str], destination: PathBuf) -> SessionContext {
        let config = AppConfig {
            destination_dir: destination,
            ..Default::default()
        };
        let (ctx, _rx) = SessionContext::new(config);
        {
            let mut store = ctx.store_mut();
            for id in ids {
                store.append(EntryDescriptor {
                    id: (*id).to_string(),
                    url: None,
                    title: Some(format!("Title {id}")),
                    raw: json!({ "id": id, "title": format!("Title {id}") }),
                });
            }
        }
        ctx
    }

    fn identities(ids: &[&str]) -> Vec<String> {
        ids.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn test_missing_destination_rejects_batch() {
        let mock = MockExtractionBackend::new();
        let ctx = seeded_context(&["a"], PathBuf::from("/definitely/not/here"));
        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);

        let result = scheduler
            .start(&ctx, identities(&["a"]), CancelToken::new())
            .await;
        assert!(matches!(result, Err(Error::Configuration(_))));
        assert!(!scheduler.is_running());
    }

    #[tokio::test]
    async fn test_single_failure_does_not_abort_batch() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = seeded_context(&["v1", "v2", "v3", "v4", "v5"], dir.path().to_path_buf());

        let mut mock = MockExtractionBackend::new();
        mock.expect_download().times(5).returning(|request, _| {
            if request.url.contains("v3") {
                Err(Error::BackendInternal("exploded".to_string()))
            } else {
                Ok(())
            }
        });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        let report = scheduler
            .start(
                &ctx,
                identities(&["v1", "v2", "v3", "v4", "v5"]),
                CancelToken::new(),
            )
            .await
            .expect("batch");

        assert_eq!(report.completed_count(), 4);
        assert_eq!(report.failed_count(), 1);
        assert_eq!(report.failed[0].identity, "v3");

        let store = ctx.store();
        assert_eq!(store.state("v3").expect("v3").lifecycle, Lifecycle::Failed);
        assert_eq!(
            store.state("v5").expect("v5").lifecycle,
            Lifecycle::Complete
        );
        assert_eq!(report.summary(), "4 succeeded, 1 failed");
    }

    #[tokio::test]
    async fn test_skip_flag_avoids_network() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = seeded_context(&["a", "b"], dir.path().to_path_buf());
        ctx.store_mut().update_state("a", |s| s.skip = true);

        let mut mock = MockExtractionBackend::new();
        mock.expect_download()
            .times(1)
            .returning(|request, _| {
                assert!(request.url.contains("b"));
                Ok(())
            });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        let report = scheduler
            .start(&ctx, identities(&["a", "b"]), CancelToken::new())
            .await
            .expect("batch");

        assert_eq!(report.skipped, ["a"]);
        assert_eq!(report.completed, ["b"]);
        assert_eq!(
            ctx.store().state("a").expect("a").lifecycle,
            Lifecycle::Skipped
        );
    }

    #[tokio::test]
    async fn test_cancellation_between_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = seeded_context(&["a", "b", "c"], dir.path().to_path_buf());

        let cancel = CancelToken::new();
        let observer = cancel.clone();
        let mut mock = MockExtractionBackend::new();
        mock.expect_download().times(1).returning(move |_, _| {
            // Cancel while the first download is in flight; it must still
            // finish, and the rest must never start.
            observer.cancel();
            Ok(())
        });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        let report = scheduler
            .start(&ctx, identities(&["a", "b", "c"]), cancel)
            .await
            .expect("batch");

        assert!(report.cancelled);
        assert_eq!(report.completed, ["a"]);
        let store = ctx.store();
        assert_eq!(store.state("b").expect("b").lifecycle, Lifecycle::Pending);
        assert_eq!(store.state("c").expect("c").lifecycle, Lifecycle::Pending);
    }

    #[tokio::test]
    async fn test_unsupported_format_falls_back_to_unrestricted() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig {
            destination_dir: dir.path().to_path_buf(),
            quality_spec: "720p".to_string(),
            ..Default::default()
        };
        let (ctx, _rx) = SessionContext::new(config);
        ctx.store_mut().append(EntryDescriptor {
            id: "a".to_string(),
            url: None,
            title: None,
            raw: json!({ "id": "a" }),
        });

        let mut mock = MockExtractionBackend::new();
        mock.expect_download().times(2).returning(|request, _| {
            if request.format_selector.contains("height<=720") {
                Err(Error::UnsupportedFormat("no 720p".to_string()))
            } else {
                assert_eq!(request.format_selector, UNRESTRICTED_SELECTOR);
                Ok(())
            }
        });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        let report = scheduler
            .start(&ctx, identities(&["a"]), CancelToken::new())
            .await
            .expect("batch");

        assert_eq!(report.completed, ["a"]);
        assert_eq!(
            ctx.store().state("a").expect("a").lifecycle,
            Lifecycle::Complete
        );
    }

    #[tokio::test]
    async fn test_progress_ticks_reach_store_and_events() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig {
            destination_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let (ctx, mut rx) = SessionContext::new(config);
        ctx.store_mut().append(EntryDescriptor {
            id: "a".to_string(),
            url: None,
            title: None,
            raw: json!({ "id": "a" }),
        });

        let mut mock = MockExtractionBackend::new();
        mock.expect_download().returning(|_, progress| {
            if let Some(callback) = progress {
                callback(ProgressTick {
                    downloaded_bytes: 512,
                    total_bytes: Some(1024),
                    percent: 50.0,
                    speed_bps: Some(2048.0),
                    eta_secs: Some(3),
                });
            }
            Ok(())
        });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        scheduler
            .start(&ctx, identities(&["a"]), CancelToken::new())
            .await
            .expect("batch");

        // Final state reflects completion, not the mid-flight tick.
        let state = ctx.store().state("a").expect("a").clone();
        assert_eq!(state.progress_percent, 100.0);
        assert_eq!(state.speed_bytes_per_sec, Some(2048.0));
        assert_eq!(state.eta_seconds, Some(3));

        let mut saw_progress = false;
        while let Ok(event) = rx.try_recv() {
            if let SessionEvent::ProgressUpdated { percent, .. } = event {
                assert_eq!(percent, 50.0);
                saw_progress = true;
            }
        }
        assert!(saw_progress);
    }

    #[tokio::test]
    async fn test_retry_run_over_failed_subset() {
        let dir = tempfile::tempdir().expect("tempdir");
        let ctx = seeded_context(&["a", "b"], dir.path().to_path_buf());

        let mut mock = MockExtractionBackend::new();
        let mut first_round = true;
        mock.expect_download().times(3).returning(move |request, _| {
            if request.url.contains("b") && std::mem::take(&mut first_round) {
                Err(Error::BackendInternal("flaky".to_string()))
            } else {
                Ok(())
            }
        });

        let scheduler = DownloadScheduler::with_toolchain(Arc::new(mock), true);
        let report = scheduler
            .start(&ctx, identities(&["a", "b"]), CancelToken::new())
            .await
            .expect("batch");
        assert_eq!(report.failed_identities(), ["b"]);

        // Fresh run over just the failed subset.
        let retry = scheduler
            .start(&ctx, report.failed_identities(), CancelToken::new())
            .await
            .expect("retry batch");
        assert_eq!(retry.completed, ["b"]);
        assert_eq!(retry.failed_count(), 0);
    }
}
