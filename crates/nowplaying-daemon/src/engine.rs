/// Engine boundary: the playback subsystem the coordinator drives.
///
/// The coordinator only ever talks to `dyn Engine`; the concrete engine
/// (mpv over IPC in production, `mock::MockEngine` in tests) is chosen by
/// whoever builds the coordinator.
use std::time::Duration;

use async_trait::async_trait;
use nowplaying_proto::state::Track;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("engine is not set up")]
    NotReady,
    #[error("engine IPC error: {0}")]
    Ipc(String),
    #[error("engine command '{command}' timed out after {after:?}")]
    Timeout {
        command: &'static str,
        after: Duration,
    },
    #[error("engine rejected command: {0}")]
    Command(String),
    #[error("failed to start engine: {0}")]
    Spawn(String),
}

/// Playback state as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// Nothing queued.
    #[default]
    None,
    /// Queued, not started.
    Ready,
    Buffering,
    Connecting,
    Playing,
    Paused,
    /// Halted with the queue intact.
    Stopped,
    Error,
}

impl EngineState {
    /// Audio is flowing or about to.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::Buffering | Self::Connecting)
    }

    pub fn is_loading(self) -> bool {
        matches!(self, Self::Buffering | Self::Connecting)
    }
}

/// One queue entry as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackDescriptor {
    pub id: String,
    pub url: String,
    pub title: String,
    pub artist: String,
    pub artwork_url: Option<String>,
    pub is_live_stream: bool,
    /// Sent with the stream request.
    pub user_agent: Option<String>,
}

impl TrackDescriptor {
    pub fn to_track(&self) -> Track {
        Track {
            title: self.title.clone(),
            artist: self.artist.clone(),
            artwork_url: self.artwork_url.clone(),
            source_url: self.url.clone(),
        }
    }
}

/// Lock-screen / media-session metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NowPlayingMetadata {
    pub title: String,
    pub artist: String,
    pub artwork_url: Option<String>,
}

impl From<&Track> for NowPlayingMetadata {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.artist.clone(),
            artwork_url: track.artwork_url.clone(),
        }
    }
}

/// Pushed by the engine.  `Remote*` come from the lock screen / media keys.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    PlaybackState(EngineState),
    PlaybackTrackChanged { index: Option<usize> },
    /// Metadata carried by the stream itself (ICY).
    PlaybackMetadataReceived {
        title: Option<String>,
        artist: Option<String>,
    },
    PlaybackError { message: String },
    RemotePlay,
    RemotePause,
    RemoteStop,
    RemoteSeek { position: f64 },
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Bring the engine up.  Calling it again on a running engine is a no-op.
    async fn setup(&self) -> Result<(), EngineError>;
    /// Halt and clear the queue.
    async fn reset(&self) -> Result<(), EngineError>;
    async fn add(&self, track: TrackDescriptor) -> Result<(), EngineError>;
    /// Start or resume the current queue entry.
    async fn play(&self) -> Result<(), EngineError>;
    async fn pause(&self) -> Result<(), EngineError>;
    /// Halt, keeping the queue.
    async fn stop(&self) -> Result<(), EngineError>;
    async fn seek_to(&self, position: f64) -> Result<(), EngineError>;
    async fn state(&self) -> Result<EngineState, EngineError>;
    async fn queue(&self) -> Result<Vec<TrackDescriptor>, EngineError>;
    async fn current_track_index(&self) -> Result<Option<usize>, EngineError>;
    async fn track(&self, index: usize) -> Result<Option<TrackDescriptor>, EngineError>;
    async fn update_now_playing_metadata(
        &self,
        metadata: NowPlayingMetadata,
    ) -> Result<(), EngineError>;
    /// Subscribe to the engine's event stream.
    fn events(&self) -> Result<broadcast::Receiver<EngineEvent>, EngineError>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_states() {
        assert!(EngineState::Playing.is_active());
        assert!(EngineState::Buffering.is_active());
        assert!(!EngineState::Paused.is_active());
        assert!(!EngineState::Stopped.is_active());
        assert!(EngineState::Connecting.is_loading());
        assert!(!EngineState::Playing.is_loading());
    }

    #[test]
    fn descriptor_maps_to_track() {
        let d = TrackDescriptor {
            id: "live".into(),
            url: "http://s/radio.mp3".into(),
            title: "Balearic FM".into(),
            artist: "Live Stream".into(),
            artwork_url: Some("a.jpg".into()),
            is_live_stream: true,
            user_agent: None,
        };
        let t = d.to_track();
        assert_eq!(t.source_url, "http://s/radio.mp3");
        assert_eq!(t.title, "Balearic FM");
        assert_eq!(NowPlayingMetadata::from(&t).artwork_url.as_deref(), Some("a.jpg"));
    }
}
