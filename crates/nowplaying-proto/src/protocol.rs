use serde::{Deserialize, Serialize};

use crate::state::PlaybackSnapshot;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Largest payload a peer may announce.  A snapshot is a few hundred bytes.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Messages sent from a UI client to the daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    Play,
    Stop,
    Toggle,
    GetState,
    /// The client's app returned to the foreground; resync from the engine.
    Foreground,
    Background,
}

/// Messages sent from the daemon to UI clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + current snapshot.
    Hello {
        protocol_version: u32,
        snapshot: PlaybackSnapshot,
    },
    Snapshot {
        data: PlaybackSnapshot,
    },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Command(Command),
    Broadcast(Broadcast),
}

impl Message {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Payload length announced by the header, once all four bytes of it
    /// are buffered.
    pub fn payload_len(data: &[u8]) -> Option<usize> {
        let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
        Some(u32::from_be_bytes(header) as usize)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        let Some(len) = Self::payload_len(data) else {
            anyhow::bail!("Insufficient data for length header");
        };
        if data.len() < 4 + len {
            anyhow::bail!("Insufficient data for message");
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok((msg, 4 + len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Track;

    #[test]
    fn test_command_decodes_from_partial_buffer() {
        let encoded = Message::Command(Command::Toggle).encode().unwrap();
        assert!(Message::decode(&encoded[..3]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());

        let mut buf = encoded.clone();
        buf.extend_from_slice(&Message::Command(Command::Stop).encode().unwrap());
        let (first, used) = Message::decode(&buf).unwrap();
        assert_eq!(used, encoded.len());
        match first {
            Message::Command(cmd) => assert_eq!(cmd, Command::Toggle),
            _ => panic!("Wrong message type"),
        }
        let (second, _) = Message::decode(&buf[used..]).unwrap();
        match second {
            Message::Command(cmd) => assert_eq!(cmd, Command::Stop),
            _ => panic!("Wrong message type"),
        }
    }

    #[test]
    fn test_payload_len_reads_header_only() {
        assert_eq!(Message::payload_len(&[0, 0, 1]), None);
        assert_eq!(Message::payload_len(&[0, 0, 1, 2]), Some(258));
        assert_eq!(Message::payload_len(&[0xff, 0xff, 0xff, 0xff, b'{']), Some(u32::MAX as usize));
    }

    #[test]
    fn test_unknown_command_is_a_complete_but_invalid_frame() {
        let payload = br#"{"cmd":"Bogus"}"#;
        let mut frame = (payload.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(payload);

        assert_eq!(Message::payload_len(&frame), Some(payload.len()));
        assert!(Message::decode(&frame).is_err());
    }

    #[test]
    fn test_hello_carries_snapshot() {
        let snapshot = PlaybackSnapshot {
            rev: 7,
            is_playing: true,
            is_loading: false,
            current_track: Some(Track::placeholder("Balearic FM", "Live Stream", "a.jpg", "s")),
        };
        let msg = Message::Broadcast(Broadcast::Hello {
            protocol_version: PROTOCOL_VERSION,
            snapshot: snapshot.clone(),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, _) = Message::decode(&encoded).unwrap();
        match decoded {
            Message::Broadcast(Broadcast::Hello {
                protocol_version,
                snapshot: got,
            }) => {
                assert_eq!(protocol_version, PROTOCOL_VERSION);
                assert_eq!(got, snapshot);
            }
            _ => panic!("Wrong message type"),
        }
    }
}
