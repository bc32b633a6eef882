use serde::{Deserialize, Serialize};

use crate::metadata::SongMetadata;

/// One now-playing record.  Replaced wholesale on every update; nothing
/// holds a mutable reference into a published track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    pub title: String,
    pub artist: String,
    pub artwork_url: Option<String>,
    /// The stream this record describes.
    pub source_url: String,
}

impl Track {
    /// Placeholder shown between play start and the first metadata fetch.
    pub fn placeholder(
        station_name: &str,
        placeholder_artist: &str,
        artwork_url: &str,
        source_url: &str,
    ) -> Self {
        Self {
            title: station_name.to_string(),
            artist: placeholder_artist.to_string(),
            artwork_url: Some(artwork_url.to_string()),
            source_url: source_url.to_string(),
        }
    }

    /// Build the replacement record for fetched metadata, keeping the stream.
    pub fn enriched(&self, song: &SongMetadata) -> Self {
        Self {
            title: song.title.clone(),
            artist: song.artist.clone(),
            artwork_url: Some(song.artwork_url.clone()),
            source_url: self.source_url.clone(),
        }
    }
}

/// The published view of playback state.  `rev` is a monotonic counter
/// bumped on every publish so clients can detect missed updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub is_playing: bool,
    pub is_loading: bool,
    pub current_track: Option<Track>,
}

impl PlaybackSnapshot {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn new(is_playing: bool, is_loading: bool, current_track: Option<Track>) -> Self {
        Self {
            rev: 0,
            is_playing,
            is_loading,
            current_track,
        }
    }

    /// True when both snapshots show the same state, ignoring `rev`.
    pub fn same_state(&self, other: &Self) -> bool {
        self.is_playing == other.is_playing
            && self.is_loading == other.is_loading
            && self.current_track == other.current_track
    }
}
