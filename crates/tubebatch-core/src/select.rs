//! Selection, filtering, sorting, and configuration resolution.
//!
//! Pure logic over the entry store and the group registry. Nothing here does
//! I/O; the scheduler and both surfaces (desktop, CLI) lean on these
//! functions so filter and precedence semantics exist exactly once.

use regex::Regex;
use time::{Date, Month, OffsetDateTime};
use tracing::debug;

use crate::config::{AppConfig, DownloadMode};
use crate::entry::{Entry, EntryState, EntryStore};
use crate::group::GroupRegistry;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Selection bulk ops
// ---------------------------------------------------------------------------

/// Select every entry in the current working view.
///
/// Entries hidden by an active filter are left untouched.
pub fn select_all(store: &mut EntryStore) {
    store.for_each_state(|_, state| {
        if state.visible {
            state.selected = true;
        }
    });
}

/// Deselect every entry in the current working view.
pub fn select_none(store: &mut EntryStore) {
    store.for_each_state(|_, state| {
        if state.visible {
            state.selected = false;
        }
    });
}

/// Invert the selection of the current working view.
pub fn invert_selection(store: &mut EntryStore) {
    store.for_each_state(|_, state| {
        if state.visible {
            state.selected = !state.selected;
        }
    });
}

// ---------------------------------------------------------------------------
// Filtering
// ---------------------------------------------------------------------------

/// Composable visibility predicate over entry metadata.
///
/// Missing or unparsable fields pass a clause, except where a numeric bound
/// explicitly targets the field, in which case a missing value excludes the
/// entry.
#[derive(Debug, Clone, Default)]
pub struct FilterSpec {
    /// Title must contain this text.
    pub title_contains: Option<String>,
    /// Title must not contain this text.
    pub title_excludes: Option<String>,
    /// Title must match this pattern.
    pub title_include_regex: Option<Regex>,
    /// Title must not match this pattern.
    pub title_exclude_regex: Option<Regex>,
    /// Case-sensitive text matching for the title clauses.
    pub case_sensitive: bool,
    /// Uploader/channel must contain this text (always case-insensitive).
    pub channel_contains: Option<String>,
    /// Language field must contain this text.
    pub language_contains: Option<String>,
    /// Availability must equal this value ("public", "unlisted", ...).
    pub availability: Option<String>,
    /// Duration bounds in seconds.
    pub min_duration_secs: Option<u64>,
    /// See `min_duration_secs`.
    pub max_duration_secs: Option<u64>,
    /// View count bounds.
    pub min_views: Option<u64>,
    /// See `min_views`.
    pub max_views: Option<u64>,
    /// Like count bound.
    pub min_likes: Option<u64>,
    /// See `min_likes`.
    pub max_likes: Option<u64>,
    /// Comment count bound.
    pub min_comments: Option<u64>,
    /// See `min_comments`.
    pub max_comments: Option<u64>,
    /// File size bounds in megabytes.
    pub min_filesize_mb: Option<f64>,
    /// See `min_filesize_mb`.
    pub max_filesize_mb: Option<f64>,
    /// Resolution (height) threshold.
    pub min_resolution: Option<u32>,
    /// See `min_resolution`.
    pub max_resolution: Option<u32>,
    /// Minimum frames per second.
    pub min_fps: Option<u32>,
    /// `Some(true)` keeps only live/upcoming, `Some(false)` only regular.
    pub live: Option<bool>,
    /// `Some(true)` keeps only entries with subtitles, `Some(false)` without.
    pub subtitles: Option<bool>,
    /// `Some(true)` keeps only entries with chapters, `Some(false)` without.
    pub chapters: Option<bool>,
    /// Minimum like ratio, percent of likes/(likes+dislikes).
    pub min_like_ratio_percent: Option<f64>,
    /// Views-per-day bounds (views / days since upload).
    pub min_views_per_day: Option<f64>,
    /// See `min_views_per_day`.
    pub max_views_per_day: Option<f64>,
    /// Playlist position bounds (1-based display index).
    pub min_position: Option<usize>,
    /// See `min_position`.
    pub max_position: Option<usize>,
}

impl FilterSpec {
    /// Build the regex clauses, rejecting malformed patterns.
    ///
    /// # Errors
    ///
    /// Returns a configuration error when a pattern does not compile.
    pub fn with_regexes(mut self, include: Option<&str>, exclude: Option<&str>) -> Result<Self> {
        if let Some(pattern) = include {
            self.title_include_regex = Some(compile_ci(pattern)?);
        }
        if let Some(pattern) = exclude {
            self.title_exclude_regex = Some(compile_ci(pattern)?);
        }
        Ok(self)
    }

    /// Evaluate the predicate for one entry.
    #[must_use]
    pub fn matches(&self, entry: &Entry) -> bool {
        self.matches_text(entry)
            && self.matches_numeric(entry)
            && self.matches_flags(entry)
            && self.matches_derived(entry)
    }

    fn matches_text(&self, entry: &Entry) -> bool {
        let title = entry.title();
        let (title_cmp, contains, excludes) = if self.case_sensitive {
            (
                title.to_string(),
                self.title_contains.clone(),
                self.title_excludes.clone(),
            )
        } else {
            (
                title.to_lowercase(),
                self.title_contains.as_ref().map(|s| s.to_lowercase()),
                self.title_excludes.as_ref().map(|s| s.to_lowercase()),
            )
        };
        if let Some(needle) = contains {
            if !title_cmp.contains(&needle) {
                return false;
            }
        }
        if let Some(needle) = excludes {
            if title_cmp.contains(&needle) {
                return false;
            }
        }
        if let Some(re) = &self.title_include_regex {
            if !re.is_match(title) {
                return false;
            }
        }
        if let Some(re) = &self.title_exclude_regex {
            if re.is_match(title) {
                return false;
            }
        }
        if let Some(needle) = &self.channel_contains {
            // Missing channel passes (text clause).
            if let Some(channel) = entry.uploader() {
                if !channel.to_lowercase().contains(&needle.to_lowercase()) {
                    return false;
                }
            }
        }
        if let Some(needle) = &self.language_contains {
            if let Some(language) = entry.field_str("language") {
                if !language.to_lowercase().contains(&needle.to_lowercase()) {
                    return false;
                }
            }
        }
        if let Some(wanted) = &self.availability {
            if let Some(availability) = entry.field_str("availability") {
                if !availability.eq_ignore_ascii_case(wanted) {
                    return false;
                }
            }
        }
        true
    }

    fn matches_numeric(&self, entry: &Entry) -> bool {
        numeric_clause(
            entry.duration_secs(),
            self.min_duration_secs.map(|v| v as f64),
            self.max_duration_secs.map(|v| v as f64),
        ) && numeric_clause(
            entry.field_f64("view_count"),
            self.min_views.map(|v| v as f64),
            self.max_views.map(|v| v as f64),
        ) && numeric_clause(
            entry.field_f64("like_count"),
            self.min_likes.map(|v| v as f64),
            self.max_likes.map(|v| v as f64),
        ) && numeric_clause(
            entry.field_f64("comment_count"),
            self.min_comments.map(|v| v as f64),
            self.max_comments.map(|v| v as f64),
        ) && numeric_clause(
            entry
                .field_f64("filesize")
                .or_else(|| entry.field_f64("filesize_approx")),
            self.min_filesize_mb.map(|v| v * 1024.0 * 1024.0),
            self.max_filesize_mb.map(|v| v * 1024.0 * 1024.0),
        ) && numeric_clause(
            entry.field_f64("height"),
            self.min_resolution.map(f64::from),
            self.max_resolution.map(f64::from),
        ) && numeric_clause(
            entry.field_f64("fps"),
            self.min_fps.map(f64::from),
            None,
        ) && numeric_clause(
            Some(entry.display_index as f64),
            self.min_position.map(|v| v as f64),
            self.max_position.map(|v| v as f64),
        )
    }

    fn matches_flags(&self, entry: &Entry) -> bool {
        if let Some(want_live) = self.live {
            let is_live = entry.raw_metadata.get("is_live").and_then(|v| v.as_bool())
                == Some(true)
                || entry.field_str("live_status").is_some_and(|s| {
                    matches!(s, "is_live" | "is_upcoming" | "post_live")
                });
            if is_live != want_live {
                return false;
            }
        }
        if let Some(want_subs) = self.subtitles {
            let has_subs = entry
                .raw_metadata
                .get("subtitles")
                .and_then(|v| v.as_object())
                .is_some_and(|m| !m.is_empty());
            if has_subs != want_subs {
                return false;
            }
        }
        if let Some(want_chapters) = self.chapters {
            let has_chapters = entry
                .raw_metadata
                .get("chapters")
                .and_then(|v| v.as_array())
                .is_some_and(|a| !a.is_empty());
            if has_chapters != want_chapters {
                return false;
            }
        }
        true
    }

    fn matches_derived(&self, entry: &Entry) -> bool {
        if let Some(min_ratio) = self.min_like_ratio_percent {
            let ratio = like_ratio_percent(entry);
            if !numeric_clause(ratio, Some(min_ratio), None) {
                return false;
            }
        }
        if self.min_views_per_day.is_some() || self.max_views_per_day.is_some() {
            let vpd = views_per_day(entry);
            if !numeric_clause(vpd, self.min_views_per_day, self.max_views_per_day) {
                return false;
            }
        }
        true
    }
}

/// Numeric clause semantics: no bound passes everything; with a bound, a
/// missing value excludes the entry.
fn numeric_clause(value: Option<f64>, min: Option<f64>, max: Option<f64>) -> bool {
    if min.is_none() && max.is_none() {
        return true;
    }
    let Some(value) = value else {
        return false;
    };
    if let Some(min) = min {
        if value < min {
            return false;
        }
    }
    if let Some(max) = max {
        if value > max {
            return false;
        }
    }
    true
}

/// Likes / (likes + dislikes), percent. `None` when counts are missing.
fn like_ratio_percent(entry: &Entry) -> Option<f64> {
    let likes = entry.field_f64("like_count")?;
    let dislikes = entry.field_f64("dislike_count").unwrap_or(0.0);
    let total = likes + dislikes;
    if total <= 0.0 {
        return None;
    }
    Some(likes / total * 100.0)
}

/// Views / days since upload. `None` when either part is missing.
fn views_per_day(entry: &Entry) -> Option<f64> {
    let views = entry.field_f64("view_count")?;
    let uploaded = parse_upload_date(entry.upload_date()?)?;
    let days = (OffsetDateTime::now_utc().date() - uploaded).whole_days();
    if days <= 0 {
        return None;
    }
    Some(views / days as f64)
}

/// Parse a backend `YYYYMMDD` date string.
#[must_use]
pub fn parse_upload_date(raw: &str) -> Option<Date> {
    if raw.len() < 8 {
        return None;
    }
    let year: i32 = raw.get(0..4)?.parse().ok()?;
    let month: u8 = raw.get(4..6)?.parse().ok()?;
    let day: u8 = raw.get(6..8)?.parse().ok()?;
    Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()
}

fn compile_ci(pattern: &str) -> Result<Regex> {
    Regex::new(&format!("(?i){pattern}"))
        .map_err(|e| Error::Configuration(format!("invalid filter pattern '{pattern}': {e}")))
}

/// Recompute visibility for every entry; returns the visible count.
///
/// Does not mutate selection.
pub fn apply_filter(store: &mut EntryStore, spec: &FilterSpec) -> usize {
    let mut visible = 0;
    store.for_each_state(|entry, state| {
        state.visible = spec.matches(entry);
        if state.visible {
            visible += 1;
        }
    });
    store.reindex();
    debug!(visible, total = store.len(), "filter applied");
    visible
}

/// Reset visibility so every entry is in the working view again.
pub fn clear_filter(store: &mut EntryStore) {
    store.for_each_state(|_, state| state.visible = true);
    store.reindex();
}

// ---------------------------------------------------------------------------
// Sorting
// ---------------------------------------------------------------------------

/// Current sort column and direction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SortOrdering {
    /// Column key, e.g. "duration".
    pub key: String,
    /// Descending direction.
    pub descending: bool,
}

impl SortOrdering {
    /// Apply a header click: same key toggles direction, a new key resets to
    /// ascending.
    #[must_use]
    pub fn clicked(previous: Option<&Self>, key: &str) -> Self {
        match previous {
            Some(prev) if prev.key == key => Self {
                key: key.to_string(),
                descending: !prev.descending,
            },
            _ => Self {
                key: key.to_string(),
                descending: false,
            },
        }
    }
}

/// Resolved sort key for one entry.
#[derive(Debug, Clone, PartialEq)]
enum SortValue {
    Number(f64),
    Text(String),
}

impl SortValue {
    fn compare(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => {
                a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
            }
            (Self::Text(a), Self::Text(b)) => a.cmp(b),
            // Numbers sort before text; mixed keys only happen on degraded data.
            (Self::Number(_), Self::Text(_)) => std::cmp::Ordering::Less,
            (Self::Text(_), Self::Number(_)) => std::cmp::Ordering::Greater,
        }
    }
}

/// Resolve the sort key function for a column.
fn sort_value(entry: &Entry, key: &str) -> SortValue {
    match key {
        "duration" => SortValue::Number(entry.duration_secs().unwrap_or(0.0)),
        "size" | "filesize" => SortValue::Number(
            entry
                .field_f64("filesize")
                .or_else(|| entry.field_f64("filesize_approx"))
                .unwrap_or(0.0),
        ),
        "views" | "view_count" => SortValue::Number(entry.field_f64("view_count").unwrap_or(0.0)),
        "likes" | "like_count" => SortValue::Number(entry.field_f64("like_count").unwrap_or(0.0)),
        "comments" | "comment_count" => {
            SortValue::Number(entry.field_f64("comment_count").unwrap_or(0.0))
        }
        "fps" => SortValue::Number(entry.field_f64("fps").unwrap_or(0.0)),
        "resolution" => SortValue::Number(resolution_height(entry).unwrap_or(0.0)),
        // Zero-padded YYYYMMDD sorts correctly as text.
        "upload_date" | "timestamp" => SortValue::Text(
            entry
                .field_str(key)
                .unwrap_or("00000000")
                .to_string(),
        ),
        other => SortValue::Text(
            entry
                .field_str(other)
                .unwrap_or_default()
                .to_lowercase(),
        ),
    }
}

/// Height component of a resolution, from the raw height field or a
/// `WxH` display string.
fn resolution_height(entry: &Entry) -> Option<f64> {
    if let Some(height) = entry.field_f64("height") {
        return Some(height);
    }
    let resolution = entry.field_str("resolution")?;
    resolution.split('x').nth(1)?.parse().ok()
}

/// Stable-sort the visible subset by a column key.
///
/// Hidden entries keep their positions; display indices are recomputed.
pub fn sort(store: &mut EntryStore, ordering: &SortOrdering) {
    let mut keyed: Vec<(String, SortValue)> = store
        .visible()
        .map(|(entry, _)| (entry.identity.clone(), sort_value(entry, &ordering.key)))
        .collect();
    keyed.sort_by(|a, b| {
        let cmp = a.1.compare(&b.1);
        if ordering.descending { cmp.reverse() } else { cmp }
    });
    let ordered_ids: Vec<String> = keyed.into_iter().map(|(id, _)| id).collect();
    store.apply_visible_order(&ordered_ids);
    debug!(key = %ordering.key, descending = ordering.descending, "sorted working view");
}

// ---------------------------------------------------------------------------
// Group assignment
// ---------------------------------------------------------------------------

/// Assign entries to a pre-existing group.
///
/// # Errors
///
/// Returns a configuration error when the group does not exist.
pub fn assign_group(
    store: &mut EntryStore,
    groups: &GroupRegistry,
    identities: &[String],
    group_name: &str,
) -> Result<usize> {
    if !groups.contains(group_name) {
        return Err(Error::Configuration(format!(
            "group '{group_name}' does not exist"
        )));
    }
    let mut assigned = 0;
    for identity in identities {
        if store.update_state(identity, |state| state.group = Some(group_name.to_string())) {
            assigned += 1;
        }
    }
    Ok(assigned)
}

/// Clear group membership on the given entries.
pub fn clear_group(store: &mut EntryStore, identities: &[String]) -> usize {
    let mut cleared = 0;
    for identity in identities {
        if store.update_state(identity, |state| state.group = None) {
            cleared += 1;
        }
    }
    cleared
}

// ---------------------------------------------------------------------------
// Effective configuration
// ---------------------------------------------------------------------------

/// Which layer supplied the effective configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    /// Global defaults applied.
    NoOverride,
    /// Per-entry override applied (advanced mode).
    PerItem,
    /// Group settings applied.
    Group,
}

/// The fully resolved download configuration for one entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveConfig {
    /// Video or audio download.
    pub download_mode: DownloadMode,
    /// Video quality preset.
    pub quality_spec: String,
    /// Audio quality token.
    pub audio_quality_spec: String,
    /// Container format for merged video output.
    pub container_format: String,
    /// Which layer won the resolution.
    pub source: ConfigSource,
}

/// Resolve the effective configuration for one entry.
///
/// Precedence: group settings > per-entry override (advanced mode only) >
/// global defaults. Every download path must go through this function.
#[must_use]
pub fn resolve_effective_config(
    state: &EntryState,
    groups: &GroupRegistry,
    config: &AppConfig,
) -> EffectiveConfig {
    if let Some(group) = state.group.as_deref().and_then(|name| groups.get(name)) {
        return EffectiveConfig {
            download_mode: group.settings.download_mode,
            quality_spec: group.settings.quality_spec.clone(),
            audio_quality_spec: group.settings.audio_quality_spec.clone(),
            container_format: group.settings.container_format.clone(),
            source: ConfigSource::Group,
        };
    }
    if config.advanced_mode {
        return EffectiveConfig {
            download_mode: config.download_mode,
            quality_spec: state.quality_spec.clone(),
            audio_quality_spec: config.audio_quality_spec.clone(),
            container_format: config.container_format.clone(),
            source: ConfigSource::PerItem,
        };
    }
    EffectiveConfig {
        download_mode: config.download_mode,
        quality_spec: config.quality_spec.clone(),
        audio_quality_spec: config.audio_quality_spec.clone(),
        container_format: config.container_format.clone(),
        source: ConfigSource::NoOverride,
    }
}
