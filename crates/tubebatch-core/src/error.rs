//! Error types for Tubebatch core operations.

use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in Tubebatch core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The identity or URL does not resolve. Per-item, never fatal to a batch.
    #[error("not found: {0}")]
    NotFound(String),

    /// The backend signalled throttling (HTTP 429 or equivalent).
    ///
    /// This is the only error kind that triggers backoff retry.
    #[error("rate limited by backend: {0}")]
    RateLimited(String),

    /// Transient connectivity or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The requested quality/format selector has no match.
    #[error("no matching format: {0}")]
    UnsupportedFormat(String),

    /// Invalid user input (missing destination, malformed filter, empty format).
    ///
    /// Always fatal to the single operation, surfaced immediately, never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Catch-all for unexpected backend failure.
    #[error("backend failure: {0}")]
    BackendInternal(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Whether this error should trigger backoff retry.
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited(_))
    }

    /// Classify raw backend stderr into the error taxonomy.
    ///
    /// The extraction backend reports failures as free text on stderr; this
    /// maps the known failure signatures onto typed errors so that callers can
    /// make retry/fallback decisions without string matching of their own.
    #[must_use]
    pub fn classify_backend_output(stderr: &str) -> Self {
        let text = stderr.trim();
        let lower = text.to_lowercase();
        let summary = first_error_line(text);

        if lower.contains("http error 429") || lower.contains("too many requests") {
            return Self::RateLimited(summary);
        }
        if lower.contains("timed out")
            || lower.contains("timeout")
            || lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("unable to connect")
            || lower.contains("temporary failure in name resolution")
        {
            return Self::Network(summary);
        }
        if lower.contains("requested format is not available")
            || lower.contains("requested format not available")
        {
            return Self::UnsupportedFormat(summary);
        }
        if lower.contains("http error 404")
            || lower.contains("video unavailable")
            || lower.contains("this video is not available")
            || lower.contains("is not a valid url")
            || lower.contains("unsupported url")
            || (lower.contains("unable to extract") && lower.contains("playlist"))
        {
            return Self::NotFound(summary);
        }
        Self::BackendInternal(summary)
    }
}

/// Pick the most informative line of a backend error dump.
fn first_error_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| l.starts_with("ERROR:") || l.contains("HTTP Error"))
        .or_else(|| text.lines().map(str::trim).find(|l| !l.is_empty()))
        .unwrap_or("unknown backend error")
        .chars()
        .take(200)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_rate_limited() {
        let err = Error::classify_backend_output("ERROR: HTTP Error 429: Too Many Requests");
        assert!(matches!(err, Error::RateLimited(_)));
        assert!(err.is_rate_limited());
    }

    #[test]
    fn test_classify_network_timeout() {
        let err = Error::classify_backend_output("ERROR: Connection timed out after 30s");
        assert!(matches!(err, Error::Network(_)));
        assert!(!err.is_rate_limited());
    }

    #[test]
    fn test_classify_unsupported_format() {
        let err = Error::classify_backend_output("ERROR: Requested format is not available");
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }

    #[test]
    fn test_classify_not_found() {
        let err = Error::classify_backend_output("ERROR: Video unavailable");
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn test_classify_unknown_falls_back_to_backend_internal() {
        let err = Error::classify_backend_output("something nobody expected");
        assert!(matches!(err, Error::BackendInternal(_)));
    }

    #[test]
    fn test_classify_picks_error_line_from_noise() {
        let stderr = "WARNING: some warning\nERROR: HTTP Error 429: Too Many Requests\nmore noise";
        let err = Error::classify_backend_output(stderr);
        assert!(err.to_string().contains("429"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
