//! Integration tests for the Tubebatch core workflow.
//!
//! These tests drive the full fetch → select → group → download pipeline
//! against a scripted in-memory backend, verifying the end-to-end contract:
//! entries streamed into the store, group settings winning configuration
//! resolution, and the batch report reflecting exactly what ran.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;
use tempfile::TempDir;

use tubebatch_core::backend::{
    DownloadRequest, EntryDescriptor, ExtractionBackend, Listing, ProgressCallback, ProgressTick,
};
use tubebatch_core::config::AppConfig;
use tubebatch_core::entry::Lifecycle;
use tubebatch_core::error::{Error, Result};
use tubebatch_core::fetch::{FetchController, FetchOptions};
use tubebatch_core::scheduler::{CancelToken, DownloadScheduler};
use tubebatch_core::select;
use tubebatch_core::session::{SessionContext, SessionEvent};

// =============================================================================
// Scripted backend
// =============================================================================

/// In-memory backend that serves a fixed listing and records download
/// requests instead of touching the network.
struct ScriptedBackend {
    listing: Vec<EntryDescriptor>,
    downloads: Mutex<Vec<DownloadRequest>>,
}

impl ScriptedBackend {
    fn new(ids: &[&str]) -> Self {
        Self {
            listing: ids
                .iter()
                .map(|id| EntryDescriptor {
                    id: (*id).to_string(),
                    url: None,
                    title: Some(format!("Video {id}")),
                    raw: json!({ "id": id, "title": format!("Video {id}"), "duration": 120 }),
                })
                .collect(),
            downloads: Mutex::new(Vec::new()),
        }
    }

    fn recorded_downloads(&self) -> Vec<DownloadRequest> {
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExtractionBackend for ScriptedBackend {
    fn list_entries(&self, _collection_url: &str, _flat: bool) -> Result<Listing> {
        Ok(Listing {
            entries: self.listing.clone(),
            unavailable: 0,
        })
    }

    fn fetch_full_metadata(&self, item_url: &str) -> Result<EntryDescriptor> {
        Err(Error::NotFound(format!("not scripted: {item_url}")))
    }

    fn download(
        &self,
        request: &DownloadRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        if let Some(callback) = progress {
            callback(ProgressTick {
                downloaded_bytes: 1024,
                total_bytes: Some(2048),
                percent: 50.0,
                speed_bps: Some(1024.0),
                eta_secs: Some(1),
            });
        }
        self.downloads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());
        Ok(())
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// =============================================================================
// End-to-end scenario
// =============================================================================

#[tokio::test]
async fn test_fetch_select_group_download_flow() {
    let destination = TempDir::new().expect("tempdir");
    let config = AppConfig {
        destination_dir: destination.path().to_path_buf(),
        quality_spec: "best".to_string(),
        ..Default::default()
    };
    let (ctx, mut rx) = SessionContext::new(config);

    let backend = Arc::new(ScriptedBackend::new(&["v1", "v2", "v3"]));

    // Phase 1: flat fetch of a 3-item listing.
    let fetcher = FetchController::new(Arc::clone(&backend) as Arc<dyn ExtractionBackend>);
    let report = fetcher
        .start(
            &ctx,
            "https://www.youtube.com/playlist?list=PLtest".to_string(),
            FetchOptions::default(),
        )
        .await
        .expect("fetch");
    assert_eq!(report.delivered, 3);

    {
        let store = ctx.store();
        assert_eq!(store.len(), 3);
        for (_, state) in store.all() {
            assert!(state.selected);
            assert_eq!(state.lifecycle, Lifecycle::Pending);
        }
    }

    // Phase 2: select only item 2 and put it in a fresh 480p group.
    {
        let mut store = ctx.store_mut();
        select::select_none(&mut store);
        store.update_state("v2", |s| s.selected = true);
    }
    {
        let config = ctx.config();
        let mut groups = ctx.groups_mut();
        groups.create("lowres", "#3498DB", &config).expect("group");
        groups.get_mut("lowres").expect("group").settings.quality_spec = "480p".to_string();
    }
    {
        let mut store = ctx.store_mut();
        let groups = ctx.groups();
        select::assign_group(&mut store, &groups, &["v2".to_string()], "lowres")
            .expect("assign");
    }

    // Phase 3: download the selection.
    let scheduler = DownloadScheduler::with_toolchain(
        Arc::clone(&backend) as Arc<dyn ExtractionBackend>,
        true,
    );
    let report = scheduler
        .start_selected(&ctx, CancelToken::new())
        .await
        .expect("batch");

    assert_eq!(report.completed, ["v2"]);
    assert_eq!(report.failed_count(), 0);

    // Exactly one download ran, with the group's 480p selector.
    let downloads = backend.recorded_downloads();
    assert_eq!(downloads.len(), 1);
    assert!(downloads[0].url.contains("v2"));
    assert_eq!(
        downloads[0].format_selector,
        "bestvideo[height<=480]+bestaudio/best[height<=480]"
    );
    assert_eq!(downloads[0].destination, destination.path());

    {
        let store = ctx.store();
        assert_eq!(store.state("v2").expect("v2").lifecycle, Lifecycle::Complete);
        assert_eq!(store.state("v1").expect("v1").lifecycle, Lifecycle::Pending);
        assert_eq!(store.state("v3").expect("v3").lifecycle, Lifecycle::Pending);
    }

    // The event stream tells the same story to the presentation layer.
    let events = drain(&mut rx);
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::FetchCompleted { delivered: 3, .. }))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::EntryStarted { identity, .. } if identity == "v2"))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::ProgressUpdated { percent, .. } if *percent == 50.0))
    );
    assert!(
        events
            .iter()
            .any(|e| matches!(e, SessionEvent::BatchCompleted { completed: 1, failed: 0 }))
    );
}

#[tokio::test]
async fn test_filter_narrows_batch_to_visible_selection() {
    let destination = TempDir::new().expect("tempdir");
    let config = AppConfig {
        destination_dir: destination.path().to_path_buf(),
        ..Default::default()
    };
    let (ctx, _rx) = SessionContext::new(config);

    let backend = Arc::new(ScriptedBackend::new(&["keep1", "drop1", "keep2"]));
    let fetcher = FetchController::new(Arc::clone(&backend) as Arc<dyn ExtractionBackend>);
    fetcher
        .start(&ctx, "url".to_string(), FetchOptions::default())
        .await
        .expect("fetch");

    // Hide everything, deselect, then re-select only the visible subset.
    {
        let mut store = ctx.store_mut();
        select::select_none(&mut store);
        let spec = select::FilterSpec {
            title_contains: Some("keep".to_string()),
            ..Default::default()
        };
        assert_eq!(select::apply_filter(&mut store, &spec), 2);
        select::select_all(&mut store);
    }

    let scheduler = DownloadScheduler::with_toolchain(
        Arc::clone(&backend) as Arc<dyn ExtractionBackend>,
        true,
    );
    let report = scheduler
        .start_selected(&ctx, CancelToken::new())
        .await
        .expect("batch");

    assert_eq!(report.completed, ["keep1", "keep2"]);
    assert_eq!(
        ctx.store().state("drop1").expect("drop1").lifecycle,
        Lifecycle::Pending
    );
}

#[tokio::test]
async fn test_export_reflects_current_selection() {
    let destination = TempDir::new().expect("tempdir");
    let (ctx, _rx) = SessionContext::new(AppConfig {
        destination_dir: destination.path().to_path_buf(),
        ..Default::default()
    });

    let backend = Arc::new(ScriptedBackend::new(&["a", "b"]));
    let fetcher = FetchController::new(backend as Arc<dyn ExtractionBackend>);
    fetcher
        .start(&ctx, "url".to_string(), FetchOptions::default())
        .await
        .expect("fetch");

    ctx.store_mut().update_state("a", |s| s.selected = false);

    let out = destination.path().join("selection.json");
    let count = ctx.export_selected(&out).expect("export");
    assert_eq!(count, 1);

    let parsed: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&out).expect("read")).expect("json");
    assert_eq!(parsed[0]["id"], "b");
}
