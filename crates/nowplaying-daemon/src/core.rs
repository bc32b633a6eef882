/// PlaybackCoordinator: single source of truth for playback state.
///
/// Every state change ends in one `publish`: the whole `PlaybackSnapshot` is
/// replaced inside the `watch` channel and `rev` bumped.  Observers only ever
/// see complete snapshots.
///
/// State-changing operations hold the operation ticket, a single-slot
/// `tokio::sync::Mutex<()>`.  `play` and `toggle` only try to take it and
/// return immediately when another operation is in flight; `stop` waits for
/// it so a stop is never lost.
///
/// The metadata poller runs only while a stream is playing.  `stop` cancels
/// it (and waits for the task to exit) before the engine is touched.
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use nowplaying_proto::config::Config;
use nowplaying_proto::metadata::{MetadataDefaults, MetadataSource, SongMetadata};
use nowplaying_proto::state::{PlaybackSnapshot, Track};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, EngineError, EngineState, NowPlayingMetadata, TrackDescriptor};
use crate::poller::{MetadataPoller, MetadataSink};

const LIVE_STREAM_ID: &str = "live-stream";

/// Knobs the coordinator needs, lifted out of `Config`.
#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub stream_url: String,
    pub user_agent: String,
    pub defaults: MetadataDefaults,
    pub poll_interval: Duration,
    pub command_timeout: Duration,
    pub start_retries: u32,
    pub start_backoff: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            stream_url: config.stream.url.clone(),
            user_agent: config.stream.user_agent.clone(),
            defaults: MetadataDefaults::from_stream(&config.stream),
            poll_interval: config.metadata.poll_interval(),
            command_timeout: config.engine.command_timeout(),
            start_retries: config.engine.start_retries,
            start_backoff: Duration::from_millis(500),
        }
    }

    fn live_descriptor(&self) -> TrackDescriptor {
        TrackDescriptor {
            id: LIVE_STREAM_ID.to_string(),
            url: self.stream_url.clone(),
            title: self.defaults.title.clone(),
            artist: self.defaults.artist.clone(),
            artwork_url: Some(self.defaults.artwork_url.clone()),
            is_live_stream: true,
            user_agent: Some(self.user_agent.clone()),
        }
    }
}

/// Media-key / lock-screen command relayed by the bridge.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RemoteCommand {
    Play,
    Pause,
    Stop,
    Seek(f64),
}

/// Cheaply cloneable handle; all clones drive the same state.
#[derive(Clone)]
pub struct PlaybackCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    metadata: Arc<dyn MetadataSource>,
    settings: CoordinatorSettings,
    snapshot_tx: watch::Sender<PlaybackSnapshot>,
    /// Operation ticket.
    ticket: tokio::sync::Mutex<()>,
    ready: AtomicBool,
    /// True between `is_loading=true` and the engine confirming the start.
    starting: AtomicBool,
    poller: Mutex<Option<MetadataPoller>>,
    me: Weak<Inner>,
}

impl PlaybackCoordinator {
    pub fn new(
        engine: Arc<dyn Engine>,
        metadata: Arc<dyn MetadataSource>,
        settings: CoordinatorSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(PlaybackSnapshot::idle());
        let inner = Arc::new_cyclic(|me| Inner {
            engine,
            metadata,
            settings,
            snapshot_tx,
            ticket: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            starting: AtomicBool::new(false),
            poller: Mutex::new(None),
            me: me.clone(),
        });
        Self { inner }
    }

    /// Set the engine up.  On failure the coordinator stays unready and every
    /// command is a no-op until a later call succeeds.
    pub async fn initialize(&self) -> bool {
        if self.is_ready() {
            return true;
        }
        let inner = &self.inner;
        match inner.call("setup", inner.engine.setup()).await {
            Ok(()) => {
                inner.ready.store(true, Ordering::SeqCst);
                info!("coordinator: engine ready");
                inner.refresh().await;
                true
            }
            Err(e) => {
                error!("coordinator: engine setup failed: {}", e);
                false
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Last published snapshot.
    pub fn snapshot(&self) -> PlaybackSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PlaybackSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub(crate) fn engine(&self) -> Arc<dyn Engine> {
        Arc::clone(&self.inner.engine)
    }

    /// Start the live stream from scratch.
    pub async fn play(&self) {
        if !self.check_ready("play") {
            return;
        }
        let Ok(_ticket) = self.inner.ticket.try_lock() else {
            debug!("coordinator: play ignored, operation in flight");
            return;
        };
        self.inner.bootstrap().await;
    }

    pub async fn stop(&self) {
        if !self.check_ready("stop") {
            return;
        }
        let _ticket = self.inner.ticket.lock().await;
        let inner = &self.inner;

        // Poller first: nothing may fetch once the engine starts tearing down.
        inner.cancel_poller().await;

        let already_idle = inner.snapshot_tx.borrow().same_state(&PlaybackSnapshot::idle());
        let engine_idle = matches!(
            inner.call("state", inner.engine.state()).await,
            Ok(EngineState::None)
        );
        if !(already_idle && engine_idle) {
            if let Err(e) = inner.call("stop", inner.engine.stop()).await {
                warn!("coordinator: engine stop failed: {}", e);
            }
        }
        if let Err(e) = inner.call("reset", inner.engine.reset()).await {
            warn!("coordinator: engine reset failed: {}", e);
        }

        inner.publish(PlaybackSnapshot::idle());
        info!("coordinator: stream playback stopped");
    }

    /// Pause when playing, resume a queued stream, or cold-start when the
    /// queue is empty.
    pub async fn toggle(&self) {
        if !self.check_ready("toggle") {
            return;
        }
        let Ok(_ticket) = self.inner.ticket.try_lock() else {
            debug!("coordinator: toggle ignored, operation in flight");
            return;
        };
        let inner = &self.inner;

        let state = match inner.call("state", inner.engine.state()).await {
            Ok(state) => state,
            Err(e) => {
                error!("coordinator: toggle could not read engine state: {}", e);
                inner.publish(PlaybackSnapshot::idle());
                return;
            }
        };

        if state.is_active() {
            if let Err(e) = inner.call("pause", inner.engine.pause()).await {
                error!("coordinator: pause failed: {}", e);
                inner.publish(PlaybackSnapshot::idle());
                return;
            }
            info!("coordinator: paused");
        } else {
            let queue = match inner.call("queue", inner.engine.queue()).await {
                Ok(queue) => queue,
                Err(e) => {
                    error!("coordinator: toggle could not read engine queue: {}", e);
                    inner.publish(PlaybackSnapshot::idle());
                    return;
                }
            };
            if queue.is_empty() {
                debug!("coordinator: queue empty, cold start");
                inner.bootstrap().await;
                return;
            }
            if let Err(e) = inner.start_engine().await {
                error!("coordinator: resume failed: {}", e);
                inner.cancel_poller().await;
                inner.publish(PlaybackSnapshot::idle());
                return;
            }
            inner.ensure_poller();
            info!("coordinator: resumed");
        }

        inner.refresh().await;
    }

    /// Re-derive the snapshot from the engine.
    pub async fn refresh(&self) {
        self.inner.refresh().await;
    }

    /// Relay a lock-screen command to the engine, then resynchronize.
    pub async fn relay_remote(&self, command: RemoteCommand) {
        if !self.check_ready("remote command") {
            return;
        }
        let inner = &self.inner;
        let _ticket = match command {
            RemoteCommand::Stop => inner.ticket.lock().await,
            _ => match inner.ticket.try_lock() {
                Ok(ticket) => ticket,
                Err(_) => {
                    debug!("coordinator: remote {:?} ignored, operation in flight", command);
                    return;
                }
            },
        };

        let result = match command {
            RemoteCommand::Play => {
                let result = inner.call("play", inner.engine.play()).await;
                if result.is_ok() {
                    inner.ensure_poller();
                }
                result
            }
            RemoteCommand::Pause => inner.call("pause", inner.engine.pause()).await,
            RemoteCommand::Stop => {
                inner.cancel_poller().await;
                inner.call("stop", inner.engine.stop()).await
            }
            RemoteCommand::Seek(position) => {
                inner.call("seek_to", inner.engine.seek_to(position)).await
            }
        };
        if let Err(e) = result {
            error!("coordinator: remote {:?} failed: {}", command, e);
        }

        inner.refresh().await;
    }

    /// Merge metadata announced by the stream itself, then ask the poller for
    /// the full record (the stream carries no artwork).
    pub async fn apply_stream_metadata(&self, title: Option<String>, artist: Option<String>) {
        let song = self
            .inner
            .settings
            .defaults
            .fill(title.as_deref(), artist.as_deref(), None);
        self.inner.apply_metadata(song).await;
        self.poke_poller();
    }

    pub fn poke_poller(&self) {
        self.inner.poke_poller();
    }

    pub fn poller_running(&self) -> bool {
        self.inner
            .poller
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|p| !p.is_finished())
    }

    /// Stop everything and leave the idle snapshot behind.
    pub async fn teardown(&self) {
        if self.is_ready() {
            self.stop().await;
        } else {
            self.inner.cancel_poller().await;
            self.inner.publish(PlaybackSnapshot::idle());
        }
        info!("coordinator: torn down");
    }

    fn check_ready(&self, op: &str) -> bool {
        if self.is_ready() {
            true
        } else {
            warn!("coordinator: engine not ready, ignoring {}", op);
            false
        }
    }
}

impl Inner {
    /// Run an engine command under the command timeout.
    async fn call<T, F>(&self, command: &'static str, fut: F) -> Result<T, EngineError>
    where
        F: Future<Output = Result<T, EngineError>>,
    {
        let after = self.settings.command_timeout;
        match tokio::time::timeout(after, fut).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout { command, after }),
        }
    }

    /// Replace the snapshot; no-op when nothing but `rev` would change.
    fn publish(&self, next: PlaybackSnapshot) {
        self.snapshot_tx.send_if_modified(|current| {
            if current.same_state(&next) {
                return false;
            }
            let rev = current.rev + 1;
            *current = PlaybackSnapshot { rev, ..next };
            true
        });
    }

    fn current_track(&self) -> Option<Track> {
        self.snapshot_tx.borrow().current_track.clone()
    }

    /// Full start: reset, enqueue, play, then hand off to the poller.  Caller
    /// holds the ticket.
    async fn bootstrap(&self) {
        self.starting.store(true, Ordering::SeqCst);
        {
            let current = self.snapshot_tx.borrow().clone();
            self.publish(PlaybackSnapshot::new(current.is_playing, true, current.current_track));
        }

        let placeholder = match self.start_stream().await {
            Ok(track) => track,
            Err(e) => {
                self.starting.store(false, Ordering::SeqCst);
                error!("coordinator: error playing stream: {}", e);
                self.cancel_poller().await;
                self.publish(PlaybackSnapshot::idle());
                return;
            }
        };
        self.starting.store(false, Ordering::SeqCst);
        self.publish(PlaybackSnapshot::new(true, false, Some(placeholder)));

        // The first fetch runs on the poller, outside the ticket, so stop can
        // cancel it and toggle is not locked out while it is slow.
        self.ensure_poller();
        self.poke_poller();
        info!("coordinator: stream playback started");
    }

    async fn start_stream(&self) -> Result<Track, EngineError> {
        self.call("reset", self.engine.reset()).await?;
        let descriptor = self.settings.live_descriptor();
        let placeholder = descriptor.to_track();
        self.call("add", self.engine.add(descriptor)).await?;
        self.start_engine().await?;
        Ok(placeholder)
    }

    /// `play` with the bounded retry.
    async fn start_engine(&self) -> Result<(), EngineError> {
        let mut attempt = 0;
        loop {
            match self.call("play", self.engine.play()).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.settings.start_retries => {
                    attempt += 1;
                    let delay = self.settings.start_backoff * attempt;
                    warn!(
                        "coordinator: engine start failed ({}), retry {}/{} in {:?}",
                        e, attempt, self.settings.start_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn refresh(&self) {
        if !self.ready.load(Ordering::SeqCst) {
            return;
        }
        match self.read_engine().await {
            Ok((state, engine_track)) => {
                let is_loading = state.is_loading() || self.starting.load(Ordering::SeqCst);
                // The engine only knows the stream; keep locally merged
                // metadata while it still describes the same stream.
                let track = match (engine_track, self.current_track()) {
                    (Some(engine_track), Some(current))
                        if engine_track.source_url == current.source_url =>
                    {
                        Some(current)
                    }
                    (engine_track, _) => engine_track,
                };
                debug!(
                    "coordinator: refresh state={:?} loading={} track={:?}",
                    state,
                    is_loading,
                    track.as_ref().map(|t| &t.title)
                );
                self.publish(PlaybackSnapshot::new(
                    state == EngineState::Playing,
                    is_loading,
                    track,
                ));
            }
            Err(e) => {
                warn!("coordinator: error getting playback state: {}", e);
                self.publish(PlaybackSnapshot::idle());
            }
        }
    }

    async fn read_engine(&self) -> Result<(EngineState, Option<Track>), EngineError> {
        let state = self.call("state", self.engine.state()).await?;
        let track = match self
            .call("current_track_index", self.engine.current_track_index())
            .await?
        {
            Some(index) => self
                .call("track", self.engine.track(index))
                .await?
                .map(|d| d.to_track()),
            None => None,
        };
        Ok((state, track))
    }

    fn ensure_poller(&self) {
        let mut slot = self.poller.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|p| !p.is_finished()) {
            return;
        }
        let sink: Weak<dyn MetadataSink> = self.me.clone();
        *slot = Some(MetadataPoller::spawn(
            Arc::clone(&self.metadata),
            sink,
            self.settings.poll_interval,
        ));
    }

    fn poke_poller(&self) {
        if let Some(poller) = self.poller.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            poller.poke();
        }
    }

    async fn cancel_poller(&self) {
        let poller = self.poller.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(poller) = poller {
            poller.cancel().await;
        }
    }
}

#[async_trait]
impl MetadataSink for Inner {
    async fn apply_metadata(&self, song: SongMetadata) {
        let mut merged = None;
        self.snapshot_tx.send_if_modified(|current| {
            let Some(track) = current.current_track.as_ref() else {
                return false;
            };
            let next = track.enriched(&song);
            if *track == next {
                return false;
            }
            current.rev += 1;
            current.current_track = Some(next.clone());
            merged = Some(next);
            true
        });

        let Some(track) = merged else {
            debug!("coordinator: metadata unchanged or no current track");
            return;
        };
        info!("coordinator: now playing {} - {}", track.artist, track.title);
        let metadata = NowPlayingMetadata::from(&track);
        if let Err(e) = self
            .call(
                "update_now_playing_metadata",
                self.engine.update_now_playing_metadata(metadata),
            )
            .await
        {
            warn!("coordinator: error updating now playing metadata: {}", e);
        }
    }
}
