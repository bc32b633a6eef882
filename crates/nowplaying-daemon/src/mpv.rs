/// mpv as the playback engine, driven over its JSON IPC socket.
///
/// Architecture:
///
/// ```text
///   MpvDriver::spawn_and_connect()
///         │
///         ├── writer_task      ← receives MpvRequest via mpsc, serialises → socket
///         ├── reader_task      ← reads JSON lines from socket
///         │                        ├── response (has request_id) → matched oneshot::Sender
///         │                        └── event / property-change   → MpvEvent channel
///         └── translator_task  ← MpvEvent → EngineEvent broadcast
/// ```
///
/// mpv has no notion of a queue, so `MpvEngine` keeps it in-process and only
/// hands mpv the URL of the current entry.
///
/// Platform notes:
/// - Unix:    Unix domain sockets
/// - Windows: Named pipes  \\.\pipe\<name>
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use nowplaying_proto::config::EngineConfig;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use crate::engine::{
    Engine, EngineError, EngineEvent, EngineState, NowPlayingMetadata, TrackDescriptor,
};

#[cfg(unix)]
use tokio::net::UnixStream;

#[cfg(windows)]
use tokio::net::windows::named_pipe::ClientOptions;

// ── global request-id counter ─────────────────────────────────────────────────

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

// ── observation property IDs ──────────────────────────────────────────────────

pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSE: u64 = 2;
pub const OBS_ICY_TITLE: u64 = 3;
pub const OBS_IDLE_ACTIVE: u64 = 4;
pub const OBS_CACHE_PAUSED: u64 = 5;
/// Some mpv builds expose the ICY title here instead.
pub const OBS_ICY_TITLE_ALT: u64 = 6;

/// First argument of a `script-message` meant for us, e.g.
/// `script-message nowplaying-remote pause` from an mpv key binding.
pub const REMOTE_MESSAGE: &str = "nowplaying-remote";

// ── internal channel types ────────────────────────────────────────────────────

type Reply = oneshot::Sender<Result<Value, EngineError>>;
type PendingMap = Arc<Mutex<HashMap<u64, Reply>>>;

struct PendingRequest {
    req_id: u64,
    payload: String, // serialised JSON line (already has '\n')
    reply: Reply,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.event_name()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "client-message".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }
}

// ── public handle ─────────────────────────────────────────────────────────────

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
    alive: Arc<AtomicBool>,
    timeout: Duration,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> Result<Value, EngineError> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = msg.to_string();
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::Ipc("mpv writer task gone".into()))?;

        tokio::time::timeout(self.timeout, reply_rx)
            .await
            .map_err(|_| EngineError::Timeout {
                command: "mpv ipc",
                after: self.timeout,
            })?
            .map_err(|_| EngineError::Ipc(format!("mpv reply channel dropped req={}", req_id)))?
    }

    /// False once the reader has seen the connection close.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    pub async fn set_property(&self, name: &str, value: Value) -> Result<(), EngineError> {
        self.send(json!(["set_property", name, value])).await?;
        Ok(())
    }

    /// Boolean property; an unavailable property reads as `false`.
    pub async fn get_flag(&self, name: &str) -> Result<bool, EngineError> {
        match self.send(json!(["get_property", name])).await {
            Ok(resp) => Ok(resp["data"].as_bool().unwrap_or(false)),
            Err(EngineError::Command(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn set_pause(&self, paused: bool) -> Result<(), EngineError> {
        self.set_property("pause", json!(paused)).await
    }

    pub async fn set_volume(&self, vol: f32) -> Result<(), EngineError> {
        let vol_pct = (vol * 100.0).clamp(0.0, 100.0);
        self.set_property("volume", json!(vol_pct)).await
    }

    /// Register observe_property for every property the translator reads.
    /// Must be called after every fresh connection.
    pub async fn observe_all_properties(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSE, "pause"),
            (OBS_ICY_TITLE, "metadata/by-key/icy-title"),
            (OBS_IDLE_ACTIVE, "idle-active"),
            (OBS_CACHE_PAUSED, "paused-for-cache"),
            (OBS_ICY_TITLE_ALT, "icy-title"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

// ── driver ────────────────────────────────────────────────────────────────────

/// Owns the mpv child process and its IPC connection.
pub struct MpvDriver {
    socket_name: String,
    process: Option<tokio::process::Child>,
    volume: f32,
    timeout: Duration,
}

impl MpvDriver {
    pub fn new(volume: f32, timeout: Duration) -> Self {
        Self {
            socket_name: nowplaying_proto::platform::mpv_socket_name(),
            process: None,
            volume,
            timeout,
        }
    }

    fn spawn_process(&mut self) -> Result<(), EngineError> {
        info!("mpv: spawning new process");
        let mpv_binary = nowplaying_proto::platform::find_mpv_binary()
            .ok_or_else(|| EngineError::Spawn("mpv binary not found".into()))?;

        let vol_arg = format!(
            "--volume={}",
            (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
        );
        let child = tokio::process::Command::new(mpv_binary)
            .arg("--no-video")
            .arg("--idle=yes")
            .arg(nowplaying_proto::platform::mpv_socket_arg())
            .arg("--quiet")
            .arg(vol_arg)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| EngineError::Spawn(e.to_string()))?;
        self.process = Some(child);
        Ok(())
    }

    async fn kill(&mut self) {
        if let Some(mut p) = self.process.take() {
            let _ = p.kill().await;
        }
    }

    #[cfg(unix)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, EngineError> {
        self.kill().await;

        let socket_path = std::path::PathBuf::from(&self.socket_name);
        let _ = tokio::fs::remove_file(&socket_path).await;
        self.spawn_process()?;

        // Wait for socket to appear
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if socket_path.exists() {
                break;
            }
        }
        if !socket_path.exists() {
            return Err(EngineError::Spawn("mpv IPC socket did not appear".into()));
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|e| EngineError::Ipc(e.to_string()))?;
        info!("mpv: connected to IPC socket");
        Ok(start_io_tasks(stream, event_tx, self.timeout))
    }

    /// Connect to an mpv left running by an earlier daemon.
    #[cfg(unix)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let socket_path = std::path::PathBuf::from(&self.socket_name);
        if !socket_path.exists() {
            return None;
        }
        match UnixStream::connect(&socket_path).await {
            Ok(stream) => {
                info!("mpv: reconnected to existing IPC socket");
                Some(start_io_tasks(stream, event_tx, self.timeout))
            }
            Err(e) => {
                debug!("mpv: no existing instance: {}", e);
                None
            }
        }
    }

    #[cfg(windows)]
    pub async fn spawn_and_connect(
        &mut self,
        event_tx: mpsc::Sender<MpvEvent>,
    ) -> Result<MpvHandle, EngineError> {
        self.kill().await;
        self.spawn_process()?;

        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if let Ok(client) = ClientOptions::new().open(&pipe_path) {
                info!("mpv: connected to named pipe");
                return Ok(start_io_tasks(client, event_tx, self.timeout));
            }
        }
        Err(EngineError::Spawn("mpv named pipe did not appear".into()))
    }

    #[cfg(windows)]
    pub async fn try_reconnect(&mut self, event_tx: mpsc::Sender<MpvEvent>) -> Option<MpvHandle> {
        let pipe_path = format!(r"\\.\pipe\{}", self.socket_name);
        match ClientOptions::new().open(&pipe_path) {
            Ok(client) => {
                info!("mpv: reconnected to named pipe");
                Some(start_io_tasks(client, event_tx, self.timeout))
            }
            Err(e) => {
                debug!("mpv: no existing instance: {}", e);
                None
            }
        }
    }
}

fn start_io_tasks<S>(stream: S, event_tx: mpsc::Sender<MpvEvent>, timeout: Duration) -> MpvHandle
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = BufReader::new(read_half);

    // req_id → reply channel.  Writer inserts, reader resolves.
    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let alive = Arc::new(AtomicBool::new(true));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx, alive.clone()));

    MpvHandle {
        tx: cmd_tx,
        alive,
        timeout,
    }
}

// ── reader task ───────────────────────────────────────────────────────────────

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(EngineError::Ipc(reason.to_string())));
    }
}

async fn reader_task<R>(
    mut reader: BufReader<R>,
    pending: PendingMap,
    event_tx: mpsc::Sender<MpvEvent>,
    alive: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                alive.store(false, Ordering::SeqCst);
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let result = if val["error"].as_str() == Some("success") {
                            Ok(val)
                        } else {
                            let err = val["error"].as_str().unwrap_or("unknown error");
                            debug!("mpv reader: response req={} err={}", req_id, err);
                            Err(EngineError::Command(err.to_string()))
                        };
                        let _ = tx.send(result);
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    let _ = event_tx.send(MpvEvent { raw: val }).await;
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                alive.store(false, Ordering::SeqCst);
                fail_all(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

// ── writer task ───────────────────────────────────────────────────────────────

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can match the reply
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(EngineError::Ipc(format!("mpv write error: {}", e))));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}

// ── event translation ─────────────────────────────────────────────────────────

/// Last observed values of the properties that make up the playback state.
#[derive(Debug, Default, Clone, Copy)]
struct Observed {
    idle_active: bool,
    paused: bool,
    cache_paused: bool,
    core_idle: bool,
}

impl Observed {
    fn state(&self) -> EngineState {
        if self.idle_active {
            EngineState::Connecting
        } else if self.paused {
            EngineState::Paused
        } else if self.cache_paused || self.core_idle {
            EngineState::Buffering
        } else {
            EngineState::Playing
        }
    }
}

/// Split an ICY `StreamTitle` ("Artist - Title") into title and artist.
fn split_icy_title(raw: &str) -> (Option<String>, Option<String>) {
    // Split before trimming: "Artist - " still carries its separator.
    let trimmed = raw.trim();
    let (artist, title) = match raw.split_once(" - ") {
        Some(parts) => parts,
        None => match trimmed.strip_suffix(" -") {
            Some(artist) => (artist, ""),
            None => ("", trimmed),
        },
    };
    let non_empty = |s: &str| {
        let s = s.trim();
        (!s.is_empty()).then(|| s.to_string())
    };
    (non_empty(title), non_empty(artist))
}

/// `["nowplaying-remote", "seek", "30"]` → `RemoteSeek { position: 30.0 }`.
fn remote_command(args: &[Value]) -> Option<EngineEvent> {
    if args.first()?.as_str()? != REMOTE_MESSAGE {
        return None;
    }
    match args.get(1)?.as_str()? {
        "play" => Some(EngineEvent::RemotePlay),
        "pause" => Some(EngineEvent::RemotePause),
        "stop" => Some(EngineEvent::RemoteStop),
        "seek" => {
            let position = args.get(2)?.as_str()?.parse().ok()?;
            Some(EngineEvent::RemoteSeek { position })
        }
        other => {
            debug!("mpv: unknown remote command '{}'", other);
            None
        }
    }
}

#[derive(Debug, Default)]
struct Queue {
    tracks: Vec<TrackDescriptor>,
    current: Option<usize>,
    /// The current entry has been handed to mpv.
    loaded: bool,
    /// Reported while nothing is loaded.
    phase: EngineState,
}

impl Queue {
    fn current_track(&self) -> Option<&TrackDescriptor> {
        self.current.and_then(|i| self.tracks.get(i))
    }

    fn unload(&mut self, phase: EngineState) {
        self.loaded = false;
        self.phase = phase;
    }

    fn idle_phase(&self) -> EngineState {
        if self.tracks.is_empty() {
            EngineState::None
        } else {
            EngineState::Stopped
        }
    }
}

type SharedQueue = Arc<StdMutex<Queue>>;

fn lock(queue: &SharedQueue) -> std::sync::MutexGuard<'_, Queue> {
    queue.lock().unwrap_or_else(|e| e.into_inner())
}

async fn translator_task(
    mut rx: mpsc::Receiver<MpvEvent>,
    queue: SharedQueue,
    events: broadcast::Sender<EngineEvent>,
) {
    let mut observed = Observed::default();
    let mut last_state: Option<EngineState> = None;

    while let Some(event) = rx.recv().await {
        for out in translate(&event, &mut observed, &mut last_state, &queue) {
            let _ = events.send(out);
        }
    }

    debug!("mpv translator: event channel closed");
    let was_loaded = {
        let mut q = lock(&queue);
        let was_loaded = q.loaded;
        if was_loaded {
            q.unload(EngineState::Error);
        }
        was_loaded
    };
    if was_loaded {
        let _ = events.send(EngineEvent::PlaybackError {
            message: "mpv connection lost".into(),
        });
        let _ = events.send(EngineEvent::PlaybackState(EngineState::Error));
    }
}

fn translate(
    event: &MpvEvent,
    observed: &mut Observed,
    last_state: &mut Option<EngineState>,
    queue: &SharedQueue,
) -> Vec<EngineEvent> {
    let mut out = Vec::new();

    if let Some((id, data)) = event.as_property_change() {
        match id {
            OBS_ICY_TITLE | OBS_ICY_TITLE_ALT => {
                if let Some(raw) = data.as_str() {
                    let (title, artist) = split_icy_title(raw);
                    if title.is_some() || artist.is_some() {
                        out.push(EngineEvent::PlaybackMetadataReceived { title, artist });
                    }
                }
                return out;
            }
            OBS_CORE_IDLE => observed.core_idle = data.as_bool().unwrap_or(false),
            OBS_PAUSE => observed.paused = data.as_bool().unwrap_or(false),
            OBS_IDLE_ACTIVE => observed.idle_active = data.as_bool().unwrap_or(false),
            OBS_CACHE_PAUSED => observed.cache_paused = data.as_bool().unwrap_or(false),
            _ => return out,
        }
        if lock(queue).loaded {
            let state = observed.state();
            if *last_state != Some(state) {
                *last_state = Some(state);
                out.push(EngineEvent::PlaybackState(state));
            }
        }
        return out;
    }

    match event.event_name() {
        Some("start-file") => {
            let index = lock(queue).current;
            out.push(EngineEvent::PlaybackTrackChanged { index });
        }
        Some("end-file") => {
            let reason = event.raw["reason"].as_str().unwrap_or("");
            // "stop" is our own loadfile/stop; a live stream never ends on its own.
            if matches!(reason, "error" | "eof") {
                let message = event.raw["file_error"]
                    .as_str()
                    .map(|e| format!("stream failed: {}", e))
                    .unwrap_or_else(|| format!("stream ended ({})", reason));
                lock(queue).unload(EngineState::Error);
                *last_state = Some(EngineState::Error);
                out.push(EngineEvent::PlaybackError { message });
                out.push(EngineEvent::PlaybackState(EngineState::Error));
            }
        }
        Some("client-message") => {
            if let Some(remote) = event.raw["args"].as_array().and_then(|a| remote_command(a)) {
                out.push(remote);
            }
        }
        _ => {}
    }
    out
}

fn media_title(track: &TrackDescriptor) -> String {
    if track.artist.is_empty() {
        track.title.clone()
    } else {
        format!("{} - {}", track.artist, track.title)
    }
}

// ── engine ────────────────────────────────────────────────────────────────────

pub struct MpvEngine {
    driver: Mutex<MpvDriver>,
    handle: StdMutex<Option<MpvHandle>>,
    queue: SharedQueue,
    events: broadcast::Sender<EngineEvent>,
    volume: f32,
    set_up: AtomicBool,
}

impl MpvEngine {
    pub fn new(config: &EngineConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            driver: Mutex::new(MpvDriver::new(config.volume, config.command_timeout())),
            handle: StdMutex::new(None),
            queue: Arc::new(StdMutex::new(Queue::default())),
            events,
            volume: config.volume,
            set_up: AtomicBool::new(false),
        }
    }

    fn live_handle(&self) -> Option<MpvHandle> {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|h| h.is_alive())
            .cloned()
    }

    /// Connect to mpv, spawning it when no instance answers.
    async fn connect(&self) -> Result<MpvHandle, EngineError> {
        let mut driver = self.driver.lock().await;
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(256);
        let handle = match driver.try_reconnect(event_tx.clone()).await {
            Some(handle) => handle,
            None => driver.spawn_and_connect(event_tx).await?,
        };

        handle.observe_all_properties().await;
        if let Err(e) = handle.set_volume(self.volume).await {
            warn!("mpv: failed to set volume: {}", e);
        }
        tokio::spawn(translator_task(
            event_rx,
            Arc::clone(&self.queue),
            self.events.clone(),
        ));

        *self.handle.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
        Ok(handle)
    }

    /// Live handle, reconnecting after mpv went away.
    async fn handle(&self) -> Result<MpvHandle, EngineError> {
        if let Some(handle) = self.live_handle() {
            return Ok(handle);
        }
        if !self.set_up.load(Ordering::SeqCst) {
            return Err(EngineError::NotReady);
        }
        warn!("mpv: connection lost, reconnecting");
        self.connect().await
    }

    fn emit(&self, state: EngineState) {
        let _ = self.events.send(EngineEvent::PlaybackState(state));
    }
}

#[async_trait]
impl Engine for MpvEngine {
    async fn setup(&self) -> Result<(), EngineError> {
        self.connect().await?;
        self.set_up.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reset(&self) -> Result<(), EngineError> {
        let handle = self.handle().await?;
        handle.send(json!(["stop"])).await?;
        *lock(&self.queue) = Queue::default();
        self.emit(EngineState::None);
        Ok(())
    }

    async fn add(&self, track: TrackDescriptor) -> Result<(), EngineError> {
        debug!("mpv: queue {} ({})", track.id, track.url);
        let mut q = lock(&self.queue);
        q.tracks.push(track);
        if q.current.is_none() {
            q.current = Some(0);
            if !q.loaded {
                q.phase = EngineState::Ready;
            }
        }
        Ok(())
    }

    async fn play(&self) -> Result<(), EngineError> {
        let handle = self.handle().await?;
        let (track, loaded) = {
            let q = lock(&self.queue);
            match q.current_track() {
                Some(track) => (track.clone(), q.loaded),
                None => return Ok(()),
            }
        };

        if !loaded {
            if let Some(user_agent) = &track.user_agent {
                handle.set_property("user-agent", json!(user_agent)).await?;
            }
            handle
                .set_property("force-media-title", json!(media_title(&track)))
                .await?;
            handle.send(json!(["loadfile", track.url, "replace"])).await?;
            lock(&self.queue).loaded = true;
            self.emit(EngineState::Connecting);
            info!("mpv: loading {}", track.url);
        }
        handle.set_pause(false).await
    }

    async fn pause(&self) -> Result<(), EngineError> {
        let handle = self.handle().await?;
        if !lock(&self.queue).loaded {
            return Ok(());
        }
        handle.set_pause(true).await
    }

    async fn stop(&self) -> Result<(), EngineError> {
        let handle = self.handle().await?;
        handle.send(json!(["stop"])).await?;
        let phase = {
            let mut q = lock(&self.queue);
            let phase = q.idle_phase();
            q.unload(phase);
            phase
        };
        self.emit(phase);
        Ok(())
    }

    async fn seek_to(&self, position: f64) -> Result<(), EngineError> {
        let handle = self.handle().await?;
        handle.set_property("time-pos", json!(position)).await
    }

    async fn state(&self) -> Result<EngineState, EngineError> {
        let handle = self.handle().await?;
        {
            let q = lock(&self.queue);
            if !q.loaded {
                return Ok(q.phase);
            }
        }
        let observed = Observed {
            idle_active: handle.get_flag("idle-active").await?,
            paused: handle.get_flag("pause").await?,
            cache_paused: handle.get_flag("paused-for-cache").await?,
            core_idle: handle.get_flag("core-idle").await?,
        };
        Ok(observed.state())
    }

    async fn queue(&self) -> Result<Vec<TrackDescriptor>, EngineError> {
        Ok(lock(&self.queue).tracks.clone())
    }

    async fn current_track_index(&self) -> Result<Option<usize>, EngineError> {
        Ok(lock(&self.queue).current)
    }

    async fn track(&self, index: usize) -> Result<Option<TrackDescriptor>, EngineError> {
        Ok(lock(&self.queue).tracks.get(index).cloned())
    }

    async fn update_now_playing_metadata(
        &self,
        metadata: NowPlayingMetadata,
    ) -> Result<(), EngineError> {
        let (title, loaded) = {
            let mut q = lock(&self.queue);
            let loaded = q.loaded;
            let Some(index) = q.current else {
                return Ok(());
            };
            let Some(track) = q.tracks.get_mut(index) else {
                return Ok(());
            };
            track.title = metadata.title;
            track.artist = metadata.artist;
            track.artwork_url = metadata.artwork_url;
            (media_title(track), loaded)
        };
        if loaded {
            let handle = self.handle().await?;
            handle.set_property("force-media-title", json!(title)).await?;
        }
        Ok(())
    }

    fn events(&self) -> Result<broadcast::Receiver<EngineEvent>, EngineError> {
        Ok(self.events.subscribe())
    }
}
