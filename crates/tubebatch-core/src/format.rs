//! Format-selector derivation.
//!
//! Turns an effective download configuration into the backend's format
//! selector string plus an optional audio re-encode step. Shared by the
//! download scheduler and the CLI surface so both derive identical selectors.

use tracing::warn;

use crate::config::DownloadMode;
use crate::select::EffectiveConfig;

/// Selector used when a requested quality has no match.
pub const UNRESTRICTED_SELECTOR: &str = "bestvideo+bestaudio/best";

/// Audio re-encode step handed to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioTranscode {
    /// Target codec, e.g. "mp3".
    pub codec: String,
    /// Target bitrate in kbps.
    pub bitrate_kbps: u32,
}

/// Fully derived download format plan.
#[derive(Debug, Clone, PartialEq)]
pub struct FormatPlan {
    /// Backend format selector string.
    pub selector: String,
    /// Audio re-encode step, when requested and the toolchain is present.
    pub transcode: Option<AudioTranscode>,
    /// Container to merge video output into.
    pub merge_container: Option<String>,
}

/// Derive a format plan from an effective configuration.
///
/// Video mode yields either the unrestricted best selector or a height-capped
/// dual-stream selector. Audio mode yields the best-audio selector; when the
/// audio quality token requests a bitrate-targeted re-encode and the media
/// toolchain is unavailable, the plan silently falls back to the original
/// container and logs the degradation.
#[must_use]
pub fn derive_format_plan(config: &EffectiveConfig, toolchain_available: bool) -> FormatPlan {
    match config.download_mode {
        DownloadMode::Video => FormatPlan {
            selector: video_selector(&config.quality_spec),
            transcode: None,
            merge_container: Some(config.container_format.clone()),
        },
        DownloadMode::Audio => {
            let requested = parse_audio_bitrate(&config.audio_quality_spec);
            let transcode = match requested {
                Some(bitrate_kbps) if toolchain_available => Some(AudioTranscode {
                    codec: "mp3".to_string(),
                    bitrate_kbps,
                }),
                Some(bitrate_kbps) => {
                    warn!(
                        bitrate_kbps,
                        "media toolchain unavailable; keeping original audio container"
                    );
                    None
                }
                None => None,
            };
            FormatPlan {
                selector: "bestaudio/best".to_string(),
                transcode,
                merge_container: None,
            }
        }
    }
}

/// Selector for video mode: unrestricted best, or height-capped dual-stream.
#[must_use]
pub fn video_selector(quality_spec: &str) -> String {
    match parse_height(quality_spec) {
        Some(height) => {
            format!("bestvideo[height<={height}]+bestaudio/best[height<={height}]")
        }
        None => UNRESTRICTED_SELECTOR.to_string(),
    }
}

/// Extract a height cap from a quality preset token.
///
/// Accepts "720p", "720p (HD)", "1080p60" and similar; "best"/"Best
/// Available" and anything unparsable yield `None` (unrestricted).
#[must_use]
pub fn parse_height(quality_spec: &str) -> Option<u32> {
    let token = quality_spec.split(['(', ' ']).next()?.trim();
    let digits: String = token.chars().take_while(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Extract a target bitrate from an audio quality token.
///
/// Accepts "mp3-320", "mp3-192", "192 kbps" and similar; "best" yields `None`
/// (keep original container).
#[must_use]
pub fn parse_audio_bitrate(audio_quality_spec: &str) -> Option<u32> {
    let token = audio_quality_spec.trim().to_lowercase();
    if token.is_empty() || token == "best" {
        return None;
    }
    if let Some(rest) = token.strip_prefix("mp3-") {
        return rest.parse().ok();
    }
    if let Some(rest) = token.strip_suffix("kbps") {
        return rest.trim().parse().ok();
    }
    None
}
