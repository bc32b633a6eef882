//! Now-playing metadata endpoint: payload parsing and the HTTP fetcher.
//!
//! The endpoint answers with a JSON array; only the first element matters:
//!
//! ```text
//! [ { "now_playing": { "song": { "title": "..", "artist": "..", "art": ".." } } }, ... ]
//! ```
//!
//! Missing or empty song fields fall back to the station defaults.  Anything
//! that does not have that shape is `MetadataError::Malformed` and callers keep
//! whatever track they already show.

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{MetadataConfig, StreamConfig};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("metadata request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("metadata endpoint returned status {0}")]
    Status(reqwest::StatusCode),
    #[error("metadata request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed metadata payload: {0}")]
    Malformed(String),
}

impl MetadataError {
    /// Transport hiccups and server errors are worth another attempt; a
    /// payload that does not parse will not parse the second time either.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Http(_) | Self::Timeout(_) => true,
            Self::Status(status) => status.is_server_error(),
            Self::Malformed(_) => false,
        }
    }
}

/// Song data after default-filling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SongMetadata {
    pub title: String,
    pub artist: String,
    pub artwork_url: String,
}

/// Values substituted for absent song fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataDefaults {
    pub title: String,
    pub artist: String,
    pub artwork_url: String,
}

impl MetadataDefaults {
    pub fn from_stream(stream: &StreamConfig) -> Self {
        Self {
            title: stream.station_name.clone(),
            artist: stream.placeholder_artist.clone(),
            artwork_url: stream.default_artwork_url.clone(),
        }
    }

    /// Fill a partial record.  Empty strings count as absent.
    pub fn fill(&self, title: Option<&str>, artist: Option<&str>, art: Option<&str>) -> SongMetadata {
        fn pick(value: Option<&str>, fallback: &str) -> String {
            match value.map(str::trim) {
                Some(v) if !v.is_empty() => v.to_string(),
                _ => fallback.to_string(),
            }
        }
        SongMetadata {
            title: pick(title, &self.title),
            artist: pick(artist, &self.artist),
            artwork_url: pick(art, &self.artwork_url),
        }
    }
}

impl Default for MetadataDefaults {
    fn default() -> Self {
        Self::from_stream(&StreamConfig::default())
    }
}

#[derive(Debug, Deserialize)]
struct NowPlayingEntry {
    now_playing: Option<NowPlaying>,
}

#[derive(Debug, Deserialize)]
struct NowPlaying {
    song: Option<Song>,
}

#[derive(Debug, Deserialize)]
struct Song {
    title: Option<String>,
    artist: Option<String>,
    art: Option<String>,
}

/// Parse a raw response body.
pub fn parse_now_playing(body: &[u8], defaults: &MetadataDefaults) -> Result<SongMetadata, MetadataError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| MetadataError::Malformed(format!("invalid json: {}", e)))?;
    parse_now_playing_value(value, defaults)
}

pub fn parse_now_playing_value(
    value: serde_json::Value,
    defaults: &MetadataDefaults,
) -> Result<SongMetadata, MetadataError> {
    let first = match value {
        serde_json::Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
        serde_json::Value::Array(_) => {
            return Err(MetadataError::Malformed("empty array".to_string()))
        }
        other => {
            return Err(MetadataError::Malformed(format!(
                "expected array, got {}",
                json_kind(&other)
            )))
        }
    };

    let entry: NowPlayingEntry = serde_json::from_value(first)
        .map_err(|e| MetadataError::Malformed(format!("first element: {}", e)))?;
    let song = entry
        .now_playing
        .ok_or_else(|| MetadataError::Malformed("missing now_playing".to_string()))?
        .song
        .ok_or_else(|| MetadataError::Malformed("missing now_playing.song".to_string()))?;

    Ok(defaults.fill(
        song.title.as_deref(),
        song.artist.as_deref(),
        song.art.as_deref(),
    ))
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

/// Anything that can produce the current song.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn fetch(&self) -> Result<SongMetadata, MetadataError>;
}

/// HTTP client for the now-playing endpoint, with a per-request timeout and a
/// bounded retry for transient failures.
pub struct MetadataClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    max_retries: u32,
    backoff: Duration,
    defaults: MetadataDefaults,
}

impl MetadataClient {
    pub fn new(
        metadata: &MetadataConfig,
        stream: &StreamConfig,
    ) -> Result<Self, MetadataError> {
        let client = reqwest::Client::builder()
            .user_agent(stream.user_agent.clone())
            .timeout(metadata.request_timeout())
            .build()?;
        Ok(Self {
            client,
            url: metadata.url.clone(),
            timeout: metadata.request_timeout(),
            max_retries: metadata.max_retries,
            backoff: metadata.retry_backoff(),
            defaults: MetadataDefaults::from_stream(stream),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn fetch_once(&self) -> Result<SongMetadata, MetadataError> {
        let request = self
            .client
            .get(&self.url)
            .header("Accept", "application/json")
            .send();
        let response = tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_| MetadataError::Timeout(self.timeout))??;

        if !response.status().is_success() {
            return Err(MetadataError::Status(response.status()));
        }

        let body = tokio::time::timeout(self.timeout, response.bytes())
            .await
            .map_err(|_| MetadataError::Timeout(self.timeout))??;
        parse_now_playing(&body, &self.defaults)
    }

    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(1u32 << attempt.min(6));
        let jitter_ms = self.backoff.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

#[async_trait]
impl MetadataSource for MetadataClient {
    async fn fetch(&self) -> Result<SongMetadata, MetadataError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once().await {
                Ok(song) => {
                    debug!(
                        "metadata: title={:?} artist={:?} art={:?}",
                        song.title, song.artist, song.artwork_url
                    );
                    return Ok(song);
                }
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = self.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        "metadata: fetch from {} failed ({}), retry {}/{} in {:?}",
                        self.url, e, attempt, self.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> MetadataDefaults {
        MetadataDefaults {
            title: "Balearic FM".into(),
            artist: "Live Stream".into(),
            artwork_url: "https://example.test/generic.jpg".into(),
        }
    }

    #[test]
    fn full_song_is_taken_as_is() {
        let body = json!([{ "now_playing": { "song": {
            "title": "Pacific State", "artist": "808 State", "art": "https://img/1.jpg"
        }}}]);
        let song = parse_now_playing_value(body, &defaults()).unwrap();
        assert_eq!(song.title, "Pacific State");
        assert_eq!(song.artist, "808 State");
        assert_eq!(song.artwork_url, "https://img/1.jpg");
    }

    #[test]
    fn absent_fields_are_default_filled() {
        let body = json!([{ "now_playing": { "song": { "title": "X" } } }]);
        let song = parse_now_playing_value(body, &defaults()).unwrap();
        assert_eq!(
            song,
            SongMetadata {
                title: "X".into(),
                artist: "Live Stream".into(),
                artwork_url: "https://example.test/generic.jpg".into(),
            }
        );
    }

    #[test]
    fn empty_strings_count_as_absent() {
        let body = json!([{ "now_playing": { "song": { "title": "", "artist": "  ", "art": null } } }]);
        let song = parse_now_playing_value(body, &defaults()).unwrap();
        assert_eq!(song.title, "Balearic FM");
        assert_eq!(song.artist, "Live Stream");
    }

    #[test]
    fn only_first_element_is_read() {
        let body = json!([
            { "now_playing": { "song": { "title": "first" } } },
            "not even an object"
        ]);
        let song = parse_now_playing_value(body, &defaults()).unwrap();
        assert_eq!(song.title, "first");
    }

    #[test]
    fn missing_now_playing_is_malformed() {
        let err = parse_now_playing_value(json!([{ "station": {} }]), &defaults()).unwrap_err();
        assert!(matches!(err, MetadataError::Malformed(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_song_is_malformed() {
        let err = parse_now_playing_value(json!([{ "now_playing": {} }]), &defaults()).unwrap_err();
        assert!(matches!(err, MetadataError::Malformed(_)));
    }

    #[test]
    fn non_array_shapes_are_malformed() {
        for body in [json!([]), json!({}), json!(null), json!("text")] {
            let err = parse_now_playing_value(body, &defaults()).unwrap_err();
            assert!(matches!(err, MetadataError::Malformed(_)));
        }
        let err = parse_now_playing(b"<html>", &defaults()).unwrap_err();
        assert!(matches!(err, MetadataError::Malformed(_)));
    }

    #[test]
    fn server_errors_are_retryable() {
        assert!(MetadataError::Status(reqwest::StatusCode::BAD_GATEWAY).is_retryable());
        assert!(!MetadataError::Status(reqwest::StatusCode::NOT_FOUND).is_retryable());
        assert!(MetadataError::Timeout(Duration::from_secs(1)).is_retryable());
    }
}
