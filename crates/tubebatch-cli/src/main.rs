//! Command-line surface for Tubebatch.
//!
//! Targets a channel (handle or URL) or playlist and either lists or
//! downloads its items, with the same filter predicates and format
//! derivation the desktop surface uses. The core library does all the work;
//! this binary is argument parsing plus terminal output.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use time::{Duration as TimeDuration, OffsetDateTime};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tubebatch_core::backend::ExtractionBackend;
use tubebatch_core::config::{AppConfig, DownloadMode};
use tubebatch_core::fetch::{FetchController, FetchOptions};
use tubebatch_core::scheduler::{CancelToken, DownloadScheduler};
use tubebatch_core::select;
use tubebatch_core::session::{SessionContext, SessionEvent};
use tubebatch_core::{Result, YtDlpBackend};

/// Channel tab to target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ContentType {
    /// Long-form uploads.
    Videos,
    /// Shorts.
    Shorts,
    /// Live streams and premieres.
    Streams,
}

impl ContentType {
    const fn tab(self) -> &'static str {
        match self {
            Self::Videos => "videos",
            Self::Shorts => "shorts",
            Self::Streams => "streams",
        }
    }
}

/// What to do with the resolved items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Print the items and exit.
    List,
    /// Download the items.
    Download,
}

/// Download as video or audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DownloadKind {
    /// Merged video download.
    Video,
    /// Audio-only download.
    Audio,
}

/// List or download specific content from a channel or playlist.
#[derive(Debug, Parser)]
#[command(name = "tubebatch", version, about)]
struct Cli {
    /// Channel handle (@name), channel URL, or playlist URL.
    target: String,

    /// Content type tab to target for channels.
    #[arg(long = "type", value_enum, default_value = "videos")]
    content_type: ContentType,

    /// List items or download them.
    #[arg(long, value_enum, default_value = "list")]
    mode: Mode,

    /// Max number of items to process (0 = no limit).
    #[arg(long, default_value_t = 0)]
    limit: usize,

    /// Regex to include by title (case-insensitive).
    #[arg(long)]
    include: Option<String>,

    /// Regex to exclude by title (case-insensitive).
    #[arg(long)]
    exclude: Option<String>,

    /// Minimum duration in seconds (0 = no minimum).
    #[arg(long = "min-duration", default_value_t = 0)]
    min_duration: u64,

    /// Maximum duration in seconds (0 = no maximum).
    #[arg(long = "max-duration", default_value_t = 0)]
    max_duration: u64,

    /// Only include uploads within the last N days (0 = no filter).
    ///
    /// Implies per-item metadata enrichment, which is slower.
    #[arg(long = "since-days", default_value_t = 0)]
    since_days: i64,

    /// Download as video or audio.
    #[arg(long = "download", value_enum, default_value = "video")]
    download: DownloadKind,

    /// Video quality: "best" or a height token like 1080p / 720p / 480p.
    #[arg(long, default_value = "best")]
    quality: String,

    /// Audio mode: "best" (original container) or mp3-320 / mp3-192 / mp3-128.
    #[arg(long, default_value = "best")]
    audio: String,

    /// Output directory (defaults to the configured download directory).
    #[arg(long = "out")]
    output: Option<PathBuf>,

    /// Show what would download without downloading.
    #[arg(long = "dry-run")]
    dry_run: bool,
}

/// Normalize user input (handle or URL) to a fetchable collection URL.
fn normalize_target(target: &str, content_type: ContentType) -> String {
    let target = target.trim();
    if target.contains("playlist?list=") {
        return target.to_string();
    }
    if let Some(handle) = target.strip_prefix('@') {
        return format!("https://www.youtube.com/@{handle}/{}", content_type.tab());
    }
    if target.starts_with("http://") || target.starts_with("https://") {
        let mut url = target.trim_end_matches('/').to_string();
        for tab in ["/videos", "/shorts", "/streams"] {
            if let Some(stripped) = url.strip_suffix(tab) {
                url = stripped.to_string();
                break;
            }
        }
        return format!("{url}/{}", content_type.tab());
    }
    // Bare channel path like channel/UC... or c/Name.
    format!(
        "https://www.youtube.com/{}/{}",
        target.trim_matches('/'),
        content_type.tab()
    )
}

/// Pretty-print a duration in seconds as m:ss.
fn format_duration(secs: Option<f64>) -> String {
    secs.map_or_else(
        || "?".to_string(),
        |s| {
            let total = s as u64;
            format!("{}:{:02}", total / 60, total % 60)
        },
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();

    let mut config = AppConfig::load().unwrap_or_else(|err| {
        warn!(error = %err, "could not load config; using defaults");
        AppConfig::default()
    });
    if let Some(out) = &cli.output {
        config.destination_dir.clone_from(out);
    }
    config.quality_spec.clone_from(&cli.quality);
    config.audio_quality_spec.clone_from(&cli.audio);
    config.download_mode = match cli.download {
        DownloadKind::Video => DownloadMode::Video,
        DownloadKind::Audio => DownloadMode::Audio,
    };
    config.validate();

    let (ctx, mut events) = SessionContext::new(config);
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::EntryStarted {
                    identity,
                    position,
                    total,
                } => println!("[{position}/{total}] downloading {identity}"),
                SessionEvent::EntryFailed { identity, reason } => {
                    eprintln!("failed {identity}: {reason}");
                }
                SessionEvent::Notice { message } => eprintln!("note: {message}"),
                _ => {}
            }
        }
    });

    let backend: Arc<dyn ExtractionBackend> = Arc::new(YtDlpBackend::discover()?);
    let collection_url = normalize_target(&cli.target, cli.content_type);
    info!(url = %collection_url, "fetching collection");

    let date_cutoff = (cli.since_days > 0)
        .then(|| OffsetDateTime::now_utc().date() - TimeDuration::days(cli.since_days));
    let options = FetchOptions {
        limit: (cli.limit > 0).then_some(cli.limit),
        date_cutoff,
        full_metadata: date_cutoff.is_some(),
    };

    let fetcher = FetchController::new(Arc::clone(&backend));
    let report = fetcher
        .start(&ctx, collection_url, options)
        .await?;
    println!(
        "{} items resolved ({} unavailable, {} degraded)",
        report.delivered, report.unavailable, report.fallback
    );

    // Narrow the working view, then select exactly the visible subset.
    let spec = select::FilterSpec {
        min_duration_secs: (cli.min_duration > 0).then_some(cli.min_duration),
        max_duration_secs: (cli.max_duration > 0).then_some(cli.max_duration),
        ..Default::default()
    }
    .with_regexes(cli.include.as_deref(), cli.exclude.as_deref())?;
    {
        let mut store = ctx.store_mut();
        select::select_none(&mut store);
        let visible = select::apply_filter(&mut store, &spec);
        select::select_all(&mut store);
        println!("{visible} items match the filters");
    }

    let mut exit_code = 0;
    match cli.mode {
        Mode::List => {
            let store = ctx.store();
            for (entry, _) in store.visible() {
                println!(
                    "{:>4}  {:<14} {:>8}  {}",
                    entry.display_index,
                    entry.identity,
                    format_duration(entry.duration_secs()),
                    entry.title()
                );
            }
        }
        Mode::Download => {
            let selected = ctx.store().selected_identities();
            if selected.is_empty() {
                println!("nothing to download");
            } else if cli.dry_run {
                println!("dry run: would download {} items", selected.len());
                for identity in &selected {
                    println!("  {identity}");
                }
            } else {
                let cancel = CancelToken::new();
                let cancel_on_signal = cancel.clone();
                tokio::spawn(async move {
                    if tokio::signal::ctrl_c().await.is_ok() {
                        eprintln!("cancelling after the current item...");
                        cancel_on_signal.cancel();
                    }
                });

                let scheduler = DownloadScheduler::new(backend);
                let report = scheduler.start_selected(&ctx, cancel).await?;
                println!("{}", report.summary());
                for failure in &report.failed {
                    eprintln!("  {}: {}", failure.identity, failure.reason);
                }
                if report.failed_count() > 0 {
                    exit_code = 1;
                }
            }
        }
    }

    drop(ctx);
    let _ = printer.await;
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_handle() {
        assert_eq!(
            normalize_target("@SomeChannel", ContentType::Videos),
            "https://www.youtube.com/@SomeChannel/videos"
        );
        assert_eq!(
            normalize_target("@SomeChannel", ContentType::Shorts),
            "https://www.youtube.com/@SomeChannel/shorts"
        );
    }

    #[test]
    fn test_normalize_url_replaces_tab() {
        assert_eq!(
            normalize_target("https://www.youtube.com/@x/videos", ContentType::Streams),
            "https://www.youtube.com/@x/streams"
        );
    }

    #[test]
    fn test_normalize_playlist_untouched() {
        let url = "https://www.youtube.com/playlist?list=PLabc";
        assert_eq!(normalize_target(url, ContentType::Videos), url);
    }

    #[test]
    fn test_normalize_bare_channel_path() {
        assert_eq!(
            normalize_target("channel/UCabc", ContentType::Videos),
            "https://www.youtube.com/channel/UCabc/videos"
        );
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Some(125.0)), "2:05");
        assert_eq!(format_duration(None), "?");
    }
}
