/// Forwards engine events and app lifecycle changes into the coordinator.
///
/// Subscriptions are taken in `attach` and released when the bridge is
/// detached or dropped.  Events are handled one at a time, in arrival order.
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{PlaybackCoordinator, RemoteCommand};
use crate::engine::EngineEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppLifecycle {
    Foreground,
    Background,
}

pub struct EngineBridge {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl EngineBridge {
    /// Subscribe to the coordinator's engine and start forwarding.  A failed
    /// engine subscription is logged; lifecycle events still flow.
    pub fn attach(
        coordinator: PlaybackCoordinator,
        lifecycle: mpsc::Receiver<AppLifecycle>,
    ) -> Self {
        let events = match coordinator.engine().events() {
            Ok(rx) => Some(rx),
            Err(e) => {
                error!("bridge: engine event subscription failed: {}", e);
                None
            }
        };

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = forward(coordinator, events, lifecycle) => {}
            }
            debug!("bridge: stopped");
        });

        info!("bridge: attached");
        Self {
            cancel,
            task: Some(task),
        }
    }

    /// Release all subscriptions and wait for the forwarding task to end.
    pub async fn detach(mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("bridge: detached");
    }
}

impl Drop for EngineBridge {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn forward(
    coordinator: PlaybackCoordinator,
    mut events: Option<broadcast::Receiver<EngineEvent>>,
    lifecycle: mpsc::Receiver<AppLifecycle>,
) {
    let mut lifecycle = Some(lifecycle);
    loop {
        if events.is_none() && lifecycle.is_none() {
            debug!("bridge: all sources closed");
            return;
        }

        tokio::select! {
            event = next_event(&mut events) => match event {
                Ok(event) => handle_event(&coordinator, event).await,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("bridge: missed {} engine events, resyncing", n);
                    coordinator.refresh().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("bridge: engine event stream closed");
                    events = None;
                }
            },
            change = next_lifecycle(&mut lifecycle) => match change {
                Some(AppLifecycle::Foreground) => {
                    debug!("bridge: foreground, resyncing");
                    coordinator.refresh().await;
                }
                Some(AppLifecycle::Background) => debug!("bridge: background"),
                None => lifecycle = None,
            },
        }
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<EngineEvent>>,
) -> Result<EngineEvent, broadcast::error::RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn next_lifecycle(lifecycle: &mut Option<mpsc::Receiver<AppLifecycle>>) -> Option<AppLifecycle> {
    match lifecycle {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn handle_event(coordinator: &PlaybackCoordinator, event: EngineEvent) {
    debug!("bridge: {:?}", event);
    match event {
        EngineEvent::PlaybackState(_) | EngineEvent::PlaybackTrackChanged { .. } => {
            coordinator.refresh().await;
        }
        EngineEvent::PlaybackMetadataReceived { title, artist } => {
            coordinator.apply_stream_metadata(title, artist).await;
        }
        EngineEvent::PlaybackError { message } => {
            error!("bridge: playback error: {}", message);
            coordinator.refresh().await;
        }
        EngineEvent::RemotePlay => coordinator.relay_remote(RemoteCommand::Play).await,
        EngineEvent::RemotePause => coordinator.relay_remote(RemoteCommand::Pause).await,
        EngineEvent::RemoteStop => coordinator.relay_remote(RemoteCommand::Stop).await,
        EngineEvent::RemoteSeek { position } => {
            coordinator.relay_remote(RemoteCommand::Seek(position)).await
        }
    }
}
