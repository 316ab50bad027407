//! Application configuration management.
//!
//! Handles loading, saving, and managing application-wide settings: the
//! download destination, global quality/mode defaults, the filename template,
//! and the rate-limit backoff tuning knobs.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Default maximum number of parallel downloads exposed in settings.
pub const MAX_PARALLEL_DOWNLOADS: usize = 4;

/// Whether a batch downloads merged video or audio only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DownloadMode {
    /// Video with audio merged in (default).
    #[default]
    Video,
    /// Audio-only download, optionally re-encoded.
    Audio,
}

impl std::fmt::Display for DownloadMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Video => write!(f, "video"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Tuning for the permissive rate-limit backoff profile.
///
/// Bulk metadata calls are prone to HTTP 429; these knobs control how hard
/// the executor pushes back. Ordinary downloads use a fixed minimal profile
/// and ignore these values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffTuning {
    /// Maximum attempts before giving up.
    #[serde(default = "default_backoff_attempts")]
    pub max_attempts: u32,
    /// Base delay in seconds before the first retry.
    #[serde(default = "default_backoff_base")]
    pub base_delay_secs: f64,
    /// Hard cap on any single delay, in seconds.
    #[serde(default = "default_backoff_cap")]
    pub max_delay_secs: f64,
}

const fn default_backoff_attempts() -> u32 {
    5
}

const fn default_backoff_base() -> f64 {
    2.0
}

const fn default_backoff_cap() -> f64 {
    20.0
}

impl Default for BackoffTuning {
    fn default() -> Self {
        Self {
            max_attempts: default_backoff_attempts(),
            base_delay_secs: default_backoff_base(),
            max_delay_secs: default_backoff_cap(),
        }
    }
}

impl BackoffTuning {
    /// Clamp values to their supported ranges.
    pub fn validate(&mut self) {
        self.max_attempts = self.max_attempts.clamp(2, 10);
        self.base_delay_secs = self.base_delay_secs.clamp(0.5, 5.0);
        self.max_delay_secs = self.max_delay_secs.clamp(5.0, 60.0);
    }
}

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    /// Directory downloads are written to. Must exist before a batch starts.
    pub destination_dir: PathBuf,
    /// Global download mode default.
    #[serde(default)]
    pub download_mode: DownloadMode,
    /// Global video quality preset ("best" or a height token like "720p").
    #[serde(default = "default_quality")]
    pub quality_spec: String,
    /// Global audio quality token ("best" or a bitrate token like "mp3-192").
    #[serde(default = "default_quality")]
    pub audio_quality_spec: String,
    /// Container format requested for merged video output.
    #[serde(default = "default_container")]
    pub container_format: String,
    /// Output filename template using `{token}` placeholders.
    #[serde(default = "default_template")]
    pub filename_template: String,
    /// Parallel download count shown in settings.
    ///
    /// The scheduler currently processes entries strictly sequentially; this
    /// value is validated and kept so existing configs round-trip, and a
    /// warning is logged when it is above 1.
    #[serde(default = "default_parallel")]
    pub parallel_downloads: usize,
    /// Offer to re-run failed entries after a batch finishes.
    #[serde(default = "default_true")]
    pub auto_retry_failed: bool,
    /// Advanced mode: per-entry quality overrides take effect.
    #[serde(default)]
    pub advanced_mode: bool,
    /// Backoff tuning for bulk calls prone to rate limiting.
    #[serde(default)]
    pub backoff: BackoffTuning,
}

fn default_quality() -> String {
    "best".to_string()
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_template() -> String {
    "{title}".to_string()
}

const fn default_parallel() -> usize {
    1
}

const fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            destination_dir: default_destination_dir(),
            download_mode: DownloadMode::default(),
            quality_spec: default_quality(),
            audio_quality_spec: default_quality(),
            container_format: default_container(),
            filename_template: default_template(),
            parallel_downloads: default_parallel(),
            auto_retry_failed: true,
            advanced_mode: false,
            backoff: BackoffTuning::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from disk, or create default if not found.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file_path())
    }

    /// Load configuration from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&contents)?;
        config.validate();
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Save configuration to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the config directory cannot be created or the file
    /// cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file_path())
    }

    /// Save configuration to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        debug!(path = %path.display(), "saved configuration");
        Ok(())
    }

    /// Clamp all values to their supported ranges.
    pub fn validate(&mut self) {
        let clamped = self.parallel_downloads.clamp(1, MAX_PARALLEL_DOWNLOADS);
        if clamped != self.parallel_downloads {
            warn!(
                requested = self.parallel_downloads,
                clamped, "parallel download count out of range"
            );
            self.parallel_downloads = clamped;
        }
        if self.quality_spec.trim().is_empty() {
            self.quality_spec = default_quality();
        }
        if self.audio_quality_spec.trim().is_empty() {
            self.audio_quality_spec = default_quality();
        }
        if self.filename_template.trim().is_empty() {
            self.filename_template = default_template();
        }
        self.backoff.validate();
    }

    /// Verify the destination directory exists and is a directory.
    pub fn check_destination(&self) -> Result<()> {
        if !self.destination_dir.is_dir() {
            return Err(Error::Configuration(format!(
                "download destination does not exist: {}",
                self.destination_dir.display()
            )));
        }
        Ok(())
    }
}

/// Default destination for downloads.
fn default_destination_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Path of the persisted config file.
fn config_file_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tubebatch")
        .join("config.json")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let mut config = AppConfig::default();
        let before = config.clone();
        config.validate();
        assert_eq!(config, before);
    }

    #[test]
    fn test_validate_clamps_parallel_downloads() {
        let mut config = AppConfig {
            parallel_downloads: 99,
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.parallel_downloads, MAX_PARALLEL_DOWNLOADS);
    }

    #[test]
    fn test_validate_restores_empty_quality() {
        let mut config = AppConfig {
            quality_spec: "  ".to_string(),
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.quality_spec, "best");
    }

    #[test]
    fn test_backoff_tuning_clamps() {
        let mut tuning = BackoffTuning {
            max_attempts: 50,
            base_delay_secs: 0.0,
            max_delay_secs: 500.0,
        };
        tuning.validate();
        assert_eq!(tuning.max_attempts, 10);
        assert_eq!(tuning.base_delay_secs, 0.5);
        assert_eq!(tuning.max_delay_secs, 60.0);
    }

    #[test]
    fn test_config_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.json");

        let mut config = AppConfig::default();
        config.quality_spec = "720p".to_string();
        config.download_mode = DownloadMode::Audio;
        config.save_to(&path).expect("save");

        let loaded = AppConfig::load_from(&path).expect("load");
        assert_eq!(loaded.quality_spec, "720p");
        assert_eq!(loaded.download_mode, DownloadMode::Audio);
    }

    #[test]
    fn test_missing_config_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = AppConfig::load_from(&dir.path().join("nope.json")).expect("load");
        assert_eq!(loaded, AppConfig::default());
    }

    #[test]
    fn test_check_destination_missing() {
        let config = AppConfig {
            destination_dir: PathBuf::from("/definitely/not/a/real/dir"),
            ..Default::default()
        };
        assert!(matches!(
            config.check_destination(),
            Err(Error::Configuration(_))
        ));
    }
}
