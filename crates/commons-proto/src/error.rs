//! Error types shared by the playback and metadata paths.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// User-visible message for a stream whose retries are exhausted.
pub const STREAM_UNAVAILABLE: &str = "Stream unavailable";

/// Why an audio source stopped or never started.  Both kinds are retried
/// with backoff; once retries run out they collapse into
/// [`STREAM_UNAVAILABLE`].
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    #[error("network failure")]
    Network,
    #[error("stream could not be decoded")]
    Decode,
}

/// Failures on the now-playing metadata path.  None of these ever reach the
/// playback path; they degrade to "no title available".
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("probe timed out")]
    Timeout,

    #[error("{}", friendly_network_error(.0))]
    Network(#[from] reqwest::Error),

    #[error("upstream returned HTTP {0}")]
    Status(u16),

    #[error("stream does not advertise ICY metadata")]
    Unsupported,

    #[error("malformed metadata block: {0}")]
    Malformed(String),
}

impl ProbeError {
    /// Whether the stream is known to carry in-band metadata despite this error.
    pub fn metadata_supported(&self) -> bool {
        matches!(self, ProbeError::Malformed(_))
    }
}

fn friendly_network_error(e: &reqwest::Error) -> String {
    if e.is_builder() {
        if let Some(url) = e.url() {
            return format!("Invalid URL: {url}");
        }
        return "Invalid URL".to_string();
    }
    if e.is_connect() {
        if let Some(url) = e.url() {
            return format!("Could not connect to {}", url.host_str().unwrap_or("server"));
        }
        return "Could not connect to server".to_string();
    }
    if e.is_timeout() {
        return "Connection timed out".to_string();
    }
    format!("Network error: {e}")
}
