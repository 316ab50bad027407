//! Extraction backend gateway.
//!
//! Thin synchronous wrapper around the external extraction/download tool
//! (yt-dlp). All calls are blocking from the caller's perspective and must be
//! run off the foreground task; the fetch controller and the scheduler wrap
//! them in `spawn_blocking`.
//!
//! The `ExtractionBackend` trait is the seam for testing: unit tests mock it,
//! integration tests script it.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::format::AudioTranscode;

/// Process timeout for metadata calls, seconds.
const METADATA_TIMEOUT_SECS: u64 = 60;

/// Socket timeout passed to the backend tool, seconds.
const SOCKET_TIMEOUT_SECS: u64 = 30;

/// Raw descriptor for one item as returned by the backend.
#[derive(Debug, Clone)]
pub struct EntryDescriptor {
    /// Stable external id.
    pub id: String,
    /// Direct URL, when the backend supplied one.
    pub url: Option<String>,
    /// Title, when known (flat listings may omit it).
    pub title: Option<String>,
    /// The full metadata record, passed through opaquely.
    pub raw: Value,
}

impl EntryDescriptor {
    /// Build a descriptor from one backend JSON record.
    ///
    /// Returns `None` when the record carries neither an id nor a URL
    /// (deleted/unavailable items in flat listings).
    #[must_use]
    pub fn from_json(raw: Value) -> Option<Self> {
        let id = raw
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| raw.get("url").and_then(Value::as_str))?
            .to_string();
        let url = raw
            .get("webpage_url")
            .or_else(|| raw.get("url"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let title = raw
            .get("title")
            .and_then(Value::as_str)
            .map(ToString::to_string);
        Some(Self { id, url, title, raw })
    }

    /// Canonical watchable URL for this item.
    #[must_use]
    pub fn watch_url(&self) -> String {
        if let Some(url) = &self.url {
            if url.starts_with("http") {
                return url.clone();
            }
        }
        if self.id.starts_with("http") {
            return self.id.clone();
        }
        format!("https://www.youtube.com/watch?v={}", self.id)
    }
}

/// Result of a collection listing.
#[derive(Debug, Clone, Default)]
pub struct Listing {
    /// Resolved descriptors in backend order.
    pub entries: Vec<EntryDescriptor>,
    /// Count of items the backend could not resolve (omitted, not fatal).
    pub unavailable: usize,
}

/// One progress report during a download.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressTick {
    /// Bytes downloaded so far.
    pub downloaded_bytes: u64,
    /// Total size, or the backend's estimate when known.
    pub total_bytes: Option<u64>,
    /// Completion percentage, 0-100.
    pub percent: f64,
    /// Momentary speed, bytes per second.
    pub speed_bps: Option<f64>,
    /// Estimated seconds remaining.
    pub eta_secs: Option<u64>,
}

/// Progress callback for download operations.
pub type ProgressCallback = Box<dyn Fn(ProgressTick) + Send + Sync>;

/// Fully resolved download request.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// Item URL.
    pub url: String,
    /// Backend format selector string.
    pub format_selector: String,
    /// Output template in backend (`%(token)s`) form, extension included.
    pub output_template: String,
    /// Destination directory (must exist).
    pub destination: PathBuf,
    /// Optional audio re-encode step.
    pub transcode: Option<AudioTranscode>,
    /// Container to merge video output into, when requested.
    pub merge_container: Option<String>,
}

/// Synchronous gateway to the extraction/download backend.
#[cfg_attr(test, mockall::automock)]
pub trait ExtractionBackend: Send + Sync {
    /// Enumerate a collection.
    ///
    /// Flat mode returns quickly with shallow per-item records and tolerates
    /// individually unresolvable items by omitting them (counted in the
    /// listing), never failing the whole call for one bad item.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection itself cannot be listed.
    fn list_entries(&self, collection_url: &str, flat: bool) -> Result<Listing>;

    /// Fetch the full metadata record for a single item.
    ///
    /// # Errors
    ///
    /// Returns an error if the item cannot be resolved.
    fn fetch_full_metadata(&self, item_url: &str) -> Result<EntryDescriptor>;

    /// Download one item, reporting progress through the callback.
    ///
    /// Blocking; writes files under `request.destination` and has no other
    /// observable state.
    ///
    /// # Errors
    ///
    /// Returns a typed error classified from the backend's output.
    fn download(&self, request: &DownloadRequest, progress: Option<ProgressCallback>)
    -> Result<()>;
}

/// Whether the media postprocessing toolchain (ffmpeg) is present.
///
/// Probed once and cached; absence degrades audio re-encodes to the original
/// container instead of raising an error.
pub fn ffmpeg_available() -> bool {
    static PROBE: OnceLock<bool> = OnceLock::new();
    *PROBE.get_or_init(|| {
        let found = Command::new("ffmpeg")
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !found {
            warn!("ffmpeg not found; audio re-encode requests will fall back to original container");
        }
        found
    })
}

/// Backend implementation shelling out to the yt-dlp binary.
#[derive(Debug, Clone)]
pub struct YtDlpBackend {
    binary: PathBuf,
}

impl YtDlpBackend {
    /// Locate the backend binary in common install locations or PATH.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when the tool cannot be found.
    pub fn discover() -> Result<Self> {
        let candidates = [
            "/opt/homebrew/bin/yt-dlp",
            "/usr/local/bin/yt-dlp",
            "/usr/bin/yt-dlp",
        ];
        for path in candidates {
            if Path::new(path).exists() {
                debug!(path, "found backend binary");
                return Ok(Self {
                    binary: PathBuf::from(path),
                });
            }
        }
        if let Ok(output) = Command::new("which").arg("yt-dlp").output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    debug!(path, "found backend binary on PATH");
                    return Ok(Self {
                        binary: PathBuf::from(path),
                    });
                }
            }
        }
        Err(Error::Configuration(
            "yt-dlp not found; install it or put it on PATH".to_string(),
        ))
    }

    /// Build a backend with an explicit binary path.
    #[must_use]
    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run the binary with a whole-process deadline, collecting output.
    fn run_with_timeout(&self, args: &[String], timeout: Duration) -> Result<Output> {
        let mut child = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BackendInternal(format!("failed to start backend: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendInternal("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::BackendInternal("failed to capture stderr".to_string()))?;

        let stdout_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(stdout);
            let _ = std::io::Read::read_to_end(&mut reader, &mut buf);
            buf
        });
        let stderr_handle = std::thread::spawn(move || {
            let mut buf = Vec::new();
            let mut reader = BufReader::new(stderr);
            let _ = std::io::Read::read_to_end(&mut reader, &mut buf);
            buf
        });

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(Error::Network(format!(
                            "backend call timed out after {}s",
                            timeout.as_secs()
                        )));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    return Err(Error::BackendInternal(format!(
                        "failed to wait for backend: {e}"
                    )));
                }
            }
        };

        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();
        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }
}

impl ExtractionBackend for YtDlpBackend {
    fn list_entries(&self, collection_url: &str, flat: bool) -> Result<Listing> {
        let mut args = vec![
            "-J".to_string(),
            "--no-warnings".to_string(),
            "--ignore-errors".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECS.to_string(),
        ];
        if flat {
            args.push("--flat-playlist".to_string());
        }
        args.push(collection_url.to_string());

        let timeout = if flat {
            Duration::from_secs(METADATA_TIMEOUT_SECS)
        } else {
            // Deep listing resolves every item in one call.
            Duration::from_secs(METADATA_TIMEOUT_SECS * 10)
        };
        let output = self.run_with_timeout(&args, timeout)?;
        if !output.status.success() && output.stdout.is_empty() {
            return Err(Error::classify_backend_output(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        let json: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::BackendInternal(format!("unparsable listing output: {e}")))?;

        let mut listing = Listing::default();
        if json.get("_type").and_then(Value::as_str) == Some("playlist") {
            let raw_entries = match json.get("entries") {
                Some(Value::Array(entries)) => entries.clone(),
                _ => Vec::new(),
            };
            for raw in raw_entries {
                if raw.is_null() {
                    listing.unavailable += 1;
                    continue;
                }
                match EntryDescriptor::from_json(raw) {
                    Some(descriptor) => listing.entries.push(descriptor),
                    None => listing.unavailable += 1,
                }
            }
        } else if let Some(descriptor) = EntryDescriptor::from_json(json) {
            // A bare single item; treat it as a one-entry collection.
            listing.entries.push(descriptor);
        }

        info!(
            url = collection_url,
            resolved = listing.entries.len(),
            unavailable = listing.unavailable,
            "listed collection"
        );
        Ok(listing)
    }

    fn fetch_full_metadata(&self, item_url: &str) -> Result<EntryDescriptor> {
        let args = vec![
            "--dump-json".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--skip-download".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECS.to_string(),
            item_url.to_string(),
        ];

        let output = self.run_with_timeout(&args, Duration::from_secs(METADATA_TIMEOUT_SECS))?;
        if !output.status.success() {
            return Err(Error::classify_backend_output(&String::from_utf8_lossy(
                &output.stderr,
            )));
        }

        let json: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| Error::BackendInternal(format!("unparsable metadata output: {e}")))?;
        EntryDescriptor::from_json(json)
            .ok_or_else(|| Error::NotFound(format!("no usable metadata for {item_url}")))
    }

    fn download(
        &self,
        request: &DownloadRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let mut args = vec![
            "-f".to_string(),
            request.format_selector.clone(),
            "--newline".to_string(),
            "--no-playlist".to_string(),
            "--no-warnings".to_string(),
            "--socket-timeout".to_string(),
            SOCKET_TIMEOUT_SECS.to_string(),
            "-P".to_string(),
            request.destination.display().to_string(),
            "-o".to_string(),
            request.output_template.clone(),
        ];
        if let Some(container) = &request.merge_container {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        if let Some(transcode) = &request.transcode {
            args.push("-x".to_string());
            args.push("--audio-format".to_string());
            args.push(transcode.codec.clone());
            args.push("--audio-quality".to_string());
            args.push(format!("{}K", transcode.bitrate_kbps));
        }
        args.push(request.url.clone());

        debug!(url = %request.url, selector = %request.format_selector, "starting backend download");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::BackendInternal(format!("failed to start backend: {e}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::BackendInternal("failed to capture stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::BackendInternal("failed to capture stderr".to_string()))?;

        let stderr_handle = std::thread::spawn(move || {
            let reader = BufReader::new(stderr);
            let mut lines = Vec::new();
            for line in reader.lines().map_while(std::result::Result::ok) {
                lines.push(line);
            }
            lines.join("\n")
        });

        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(std::result::Result::ok) {
            if let Some(tick) = parse_progress_line(&line) {
                if let Some(callback) = &progress {
                    callback(tick);
                }
            }
        }

        let status = child
            .wait()
            .map_err(|e| Error::BackendInternal(format!("failed to wait for backend: {e}")))?;
        let stderr_output = stderr_handle.join().unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            Err(Error::classify_backend_output(&stderr_output))
        }
    }
}

lazy_static! {
    static ref PROGRESS_RE: Regex = Regex::new(
        r"\[download\]\s+(\d+\.?\d*)%\s+of\s+~?\s*(\d+\.?\d*)\s*([KMGT]i?B)\s+at\s+(\d+\.?\d*)\s*([KMGT]i?B)/s(?:\s+ETA\s+(\S+))?"
    )
    .expect("progress regex is valid");
}

/// Parse one backend progress line like
/// `[download]   6.2% of ~ 343.72MiB at  420.30KiB/s ETA 12:32`.
#[must_use]
pub fn parse_progress_line(line: &str) -> Option<ProgressTick> {
    let caps = PROGRESS_RE.captures(line)?;
    let percent: f64 = caps.get(1)?.as_str().parse().ok()?;
    let total = caps
        .get(2)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .zip(caps.get(3).map(|m| unit_multiplier(m.as_str())))
        .map(|(value, unit)| value * unit);
    let speed = caps
        .get(4)
        .and_then(|m| m.as_str().parse::<f64>().ok())
        .zip(caps.get(5).map(|m| unit_multiplier(m.as_str())))
        .map(|(value, unit)| value * unit);
    let eta = caps.get(6).and_then(|m| parse_clock(m.as_str()));

    let total_bytes = total.map(|t| t as u64);
    let downloaded = total.map_or(0, |t| (t * percent / 100.0) as u64);
    Some(ProgressTick {
        downloaded_bytes: downloaded,
        total_bytes,
        percent,
        speed_bps: speed,
        eta_secs: eta,
    })
}

fn unit_multiplier(unit: &str) -> f64 {
    match unit {
        "KiB" | "KB" => 1024.0,
        "MiB" | "MB" => 1024.0 * 1024.0,
        "GiB" | "GB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" | "TB" => 1024.0_f64.powi(4),
        _ => 1.0,
    }
}

/// Parse an `MM:SS` or `HH:MM:SS` clock into seconds.
fn parse_clock(clock: &str) -> Option<u64> {
    let parts: Vec<&str> = clock.split(':').collect();
    let nums: Vec<u64> = parts.iter().map(|p| p.parse().ok()).collect::<Option<_>>()?;
    match nums.as_slice() {
        [m, s] => Some(m * 60 + s),
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}
