use crate::bridge::AppLifecycle;
use crate::core::PlaybackCoordinator;
use nowplaying_proto::protocol::{Broadcast, Command, Message, MAX_FRAME_LEN, PROTOCOL_VERSION};
use nowplaying_proto::state::PlaybackSnapshot;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

pub fn start_server(
    bind_address: String,
    port: u16,
    coordinator: PlaybackCoordinator,
    lifecycle_tx: mpsc::Sender<AppLifecycle>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind TCP socket {}: {}", addr, e);
                return;
            }
        };

        info!("TCP server listening at {}", addr);

        let connected = Arc::new(AtomicUsize::new(0));
        let mut client_id = 0usize;

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    client_id += 1;
                    let id = client_id;
                    let count = connected.fetch_add(1, Ordering::SeqCst) + 1;
                    info!("Client {} connected from {} ({} connected)", id, peer, count);

                    let coordinator = coordinator.clone();
                    let lifecycle_tx = lifecycle_tx.clone();
                    let connected = connected.clone();
                    tokio::spawn(async move {
                        handle_client(stream, coordinator, id, lifecycle_tx).await;
                        let count = connected.fetch_sub(1, Ordering::SeqCst) - 1;
                        info!("Client {} disconnected ({} connected)", id, count);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    })
}

/// Serve one client: `Hello` on connect, a `Snapshot` after every published
/// change, commands dispatched as they arrive.
async fn handle_client<S>(
    stream: S,
    coordinator: PlaybackCoordinator,
    client_id: usize,
    lifecycle_tx: mpsc::Sender<AppLifecycle>,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut read_half, mut write_half) = tokio::io::split(stream);
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let mut snapshots = coordinator.subscribe();

    let hello = encode_hello(&snapshots.borrow_and_update());
    match hello {
        Ok(encoded) => {
            if write_half.write_all(&encoded).await.is_err() {
                return;
            }
        }
        Err(e) => {
            error!("Client {}: failed to encode hello: {}", client_id, e);
            return;
        }
    }

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        loop {
                            let frame = match take_frame(&mut read_buf) {
                                Ok(Some(frame)) => frame,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Client {}: {}, closing", client_id, e);
                                    return;
                                }
                            };
                            match Message::decode(&frame) {
                                Ok((Message::Command(cmd), _)) => {
                                    info!("Client {} sent command: {:?}", client_id, cmd);
                                    if cmd == Command::GetState {
                                        let encoded = encode_snapshot(&coordinator.snapshot());
                                        if let Ok(encoded) = encoded {
                                            if write_half.write_all(&encoded).await.is_err() {
                                                return;
                                            }
                                        }
                                    } else {
                                        dispatch(cmd, &coordinator, &lifecycle_tx).await;
                                    }
                                }
                                Ok((Message::Broadcast(_), _)) => {
                                    warn!("Client {}: ignoring broadcast sent by client", client_id);
                                }
                                Err(e) => {
                                    warn!("Client {}: dropping invalid frame: {}", client_id, e);
                                }
                            }
                        }
                    }
                    Err(e) => {
                        error!("Read error from client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            changed = snapshots.changed() => {
                if changed.is_err() {
                    debug!("Client {}: coordinator gone", client_id);
                    break;
                }
                let encoded = encode_snapshot(&snapshots.borrow_and_update());
                if let Ok(encoded) = encoded {
                    if write_half.write_all(&encoded).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

/// Run a command without blocking the client loop; results reach the client
/// as snapshots.
pub async fn dispatch(
    cmd: Command,
    coordinator: &PlaybackCoordinator,
    lifecycle_tx: &mpsc::Sender<AppLifecycle>,
) {
    let lifecycle = match cmd {
        Command::Foreground => Some(AppLifecycle::Foreground),
        Command::Background => Some(AppLifecycle::Background),
        _ => None,
    };
    if let Some(change) = lifecycle {
        if lifecycle_tx.send(change).await.is_err() {
            warn!("Lifecycle channel closed");
        }
        return;
    }

    let coordinator = coordinator.clone();
    tokio::spawn(async move {
        match cmd {
            Command::Play => coordinator.play().await,
            Command::Stop => coordinator.stop().await,
            Command::Toggle => coordinator.toggle().await,
            Command::GetState | Command::Foreground | Command::Background => {}
        }
    });
}

/// Split the next whole frame off `buf`, header included.  `Ok(None)` while
/// more bytes are needed.
fn take_frame(buf: &mut Vec<u8>) -> anyhow::Result<Option<Vec<u8>>> {
    let Some(len) = Message::payload_len(buf) else {
        return Ok(None);
    };
    if len > MAX_FRAME_LEN {
        anyhow::bail!("frame of {} bytes exceeds limit of {}", len, MAX_FRAME_LEN);
    }
    if buf.len() < 4 + len {
        return Ok(None);
    }
    Ok(Some(buf.drain(..4 + len).collect()))
}

fn encode_hello(snapshot: &PlaybackSnapshot) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::Hello {
        protocol_version: PROTOCOL_VERSION,
        snapshot: snapshot.clone(),
    })
    .encode()
}

fn encode_snapshot(snapshot: &PlaybackSnapshot) -> anyhow::Result<Vec<u8>> {
    Message::Broadcast(Broadcast::Snapshot {
        data: snapshot.clone(),
    })
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::CoordinatorSettings;
    use crate::engine::mock::MockEngine;
    use crate::poller::testing::{song, ScriptedSource};
    use nowplaying_proto::config::Config;
    use std::time::Duration;
    use tokio::io::DuplexStream;

    async fn coordinator() -> (PlaybackCoordinator, Arc<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        let source = Arc::new(ScriptedSource::new());
        source.always(song("On Air"));
        let settings = CoordinatorSettings::from_config(&Config::default());
        let coordinator = PlaybackCoordinator::new(engine.clone(), source, settings);
        assert!(coordinator.initialize().await);
        (coordinator, engine)
    }

    async fn read_message(stream: &mut DuplexStream, buf: &mut Vec<u8>) -> Message {
        let mut tmp = [0u8; 1024];
        loop {
            if let Ok((msg, used)) = Message::decode(buf) {
                buf.drain(..used);
                return msg;
            }
            let n = stream.read(&mut tmp).await.unwrap();
            assert!(n > 0, "connection closed");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    async fn send_raw(stream: &mut DuplexStream, payload: &[u8]) {
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);
        stream.write_all(&frame).await.unwrap();
    }

    async fn send(stream: &mut DuplexStream, cmd: Command) {
        let encoded = Message::Command(cmd).encode().unwrap();
        stream.write_all(&encoded).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn hello_then_snapshots_follow_commands() {
        let (coordinator, _) = coordinator().await;
        let (lifecycle_tx, _lifecycle_rx) = mpsc::channel(4);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_client(server, coordinator.clone(), 1, lifecycle_tx));
        let mut buf = Vec::new();

        match read_message(&mut client, &mut buf).await {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                snapshot,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert!(!snapshot.is_playing);
            }
            other => panic!("expected hello, got {:?}", other),
        }

        send(&mut client, Command::Play).await;
        let last = loop {
            match read_message(&mut client, &mut buf).await {
                Message::Broadcast(Broadcast::Snapshot { data }) => {
                    if data.current_track.as_ref().map(|t| t.title.as_str()) == Some("On Air") {
                        break data;
                    }
                }
                other => panic!("expected snapshot, got {:?}", other),
            }
        };
        assert!(last.is_playing);
        assert!(!last.is_loading);
    }

    #[tokio::test(start_paused = true)]
    async fn get_state_answers_with_current_snapshot() {
        let (coordinator, _) = coordinator().await;
        let (lifecycle_tx, _lifecycle_rx) = mpsc::channel(4);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_client(server, coordinator.clone(), 1, lifecycle_tx));
        let mut buf = Vec::new();
        let _hello = read_message(&mut client, &mut buf).await;

        send(&mut client, Command::GetState).await;
        match read_message(&mut client, &mut buf).await {
            Message::Broadcast(Broadcast::Snapshot { data }) => {
                assert_eq!(data, coordinator.snapshot());
            }
            other => panic!("expected snapshot, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lifecycle_commands_go_to_the_bridge() {
        let (coordinator, engine) = coordinator().await;
        let (lifecycle_tx, mut lifecycle_rx) = mpsc::channel(4);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_client(server, coordinator, 1, lifecycle_tx));
        let mut buf = Vec::new();
        let _hello = read_message(&mut client, &mut buf).await;

        send(&mut client, Command::Background).await;
        send(&mut client, Command::Foreground).await;

        assert_eq!(lifecycle_rx.recv().await, Some(AppLifecycle::Background));
        assert_eq!(lifecycle_rx.recv().await, Some(AppLifecycle::Foreground));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(engine.count("play"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_frames_are_skipped() {
        let (coordinator, engine) = coordinator().await;
        let (lifecycle_tx, _lifecycle_rx) = mpsc::channel(4);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(handle_client(server, coordinator, 1, lifecycle_tx));
        let mut buf = Vec::new();
        let _hello = read_message(&mut client, &mut buf).await;

        send_raw(&mut client, br#"{"cmd":"Bogus"}"#).await;
        send_raw(&mut client, b"not json").await;
        let echoed = Message::Broadcast(Broadcast::Snapshot {
            data: PlaybackSnapshot::idle(),
        })
        .encode()
        .unwrap();
        client.write_all(&echoed).await.unwrap();
        send(&mut client, Command::Play).await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(engine.count("play"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_frame_closes_connection() {
        let (coordinator, engine) = coordinator().await;
        let (lifecycle_tx, _lifecycle_rx) = mpsc::channel(4);
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let task = tokio::spawn(handle_client(server, coordinator, 1, lifecycle_tx));
        let mut buf = Vec::new();
        let _hello = read_message(&mut client, &mut buf).await;

        let header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        client.write_all(&header).await.unwrap();
        client.write_all(b"{\"cmd\":").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("client handler kept running")
            .unwrap();
        let mut tmp = [0u8; 64];
        assert_eq!(client.read(&mut tmp).await.unwrap(), 0);
        assert_eq!(engine.count("play"), 0);
    }
}
