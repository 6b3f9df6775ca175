use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Direct channel pick.  `url_idx` may be any integer; it is wrapped into
    /// range.  `programme` requests catch-up playback of a past programme.
    SelectChannel {
        channel_idx: usize,
        #[serde(default)]
        url_idx: Option<i64>,
        #[serde(default)]
        programme: Option<EpgProgramme>,
    },
    Next,
    Prev,
    ToggleFavorite {
        channel_idx: usize,
    },
    ToggleReservation {
        channel_idx: usize,
        programme: EpgProgramme,
    },
    SetFavoritesVisible {
        visible: bool,
    },
    Stop,
    GetState,
}

/// Messages sent from the daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: protocol version + full state snapshot.
    Hello {
        protocol_version: u32,
        state: PlaybackSnapshot,
    },
    State {
        data: PlaybackSnapshot,
    },
    /// User-facing notification ("added to favorites", ...).
    Notice {
        message: String,
    },
    /// The current URL must be rendered by the client's embedded web view.
    WebSurface {
        url: String,
    },
    Log {
        message: String,
    },
}

/// A named stream source with one or more candidate URLs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Channel {
    pub name: String,
    /// Candidate stream URLs in preference order.  Never empty for channels
    /// handed out by a `ChannelDirectory`.
    pub urls: Vec<String>,
    #[serde(default)]
    pub group: String,
}

/// One programme from the guide.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EpgProgramme {
    pub title: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

/// A reminder the user set for an upcoming programme.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EpgProgrammeReserve {
    pub channel: String,
    pub programme: String,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
}

impl EpgProgrammeReserve {
    pub fn new(channel: &Channel, programme: &EpgProgramme) -> Self {
        Self {
            channel: channel.name.clone(),
            programme: programme.title.clone(),
            start_at: programme.start_at,
            end_at: programme.end_at,
        }
    }

    /// Structural match on channel name, title and both instants.
    pub fn matches(&self, channel: &Channel, programme: &EpgProgramme) -> bool {
        self.channel == channel.name
            && self.programme == programme.title
            && self.start_at == programme.start_at
            && self.end_at == programme.end_at
    }
}

/// Detailed playback status as reported by the player engine
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing loaded / explicitly stopped
    Connecting, // url handed to the engine, no frames yet
    Playing,    // engine reported ready
    WebSurface, // url handed to the client's web view
    Error,      // every candidate url failed
}

/// Full state of the orchestrator as seen by clients.  `rev` is incremented
/// every time the state changes so clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PlaybackSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub channel_idx: Option<usize>,
    pub channel: Option<String>,
    pub url_idx: usize,
    pub url: Option<String>,
    pub timeshift: Option<EpgProgramme>,
    pub status: PlaybackStatus,
    pub overlay_visible: bool,
    pub favorites_visible: bool,
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub reservations: Vec<EpgProgrammeReserve>,
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

    pub fn decode(data: &[u8]) -> anyhow::Result<(Self, usize)> {
        if data.len() < 4 {
            anyhow::bail!("Insufficient data for length header");
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
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
    use chrono::TimeZone;

    fn programme() -> EpgProgramme {
        EpgProgramme {
            title: "News".to_string(),
            start_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
            end_at: Utc.with_ymd_and_hms(2024, 1, 1, 10, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_select_channel_decodes_with_programme() {
        let msg = Message::Command(Command::SelectChannel {
            channel_idx: 3,
            url_idx: Some(-1),
            programme: Some(programme()),
        });
        let encoded = msg.encode().unwrap();
        let (decoded, len) = Message::decode(&encoded).unwrap();
        assert_eq!(len, encoded.len());
        match decoded {
            Message::Command(Command::SelectChannel {
                channel_idx,
                url_idx,
                programme: Some(p),
            }) => {
                assert_eq!(channel_idx, 3);
                assert_eq!(url_idx, Some(-1));
                assert_eq!(p, programme());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_select_channel_optional_fields_default() {
        let raw = br#"{"cmd":"SelectChannel","channel_idx":7}"#;
        let mut framed = (raw.len() as u32).to_be_bytes().to_vec();
        framed.extend_from_slice(raw);
        let (decoded, _) = Message::decode(&framed).unwrap();
        match decoded {
            Message::Command(Command::SelectChannel {
                channel_idx,
                url_idx,
                programme,
            }) => {
                assert_eq!(channel_idx, 7);
                assert!(url_idx.is_none());
                assert!(programme.is_none());
            }
            other => panic!("Wrong message type: {:?}", other),
        }
    }

    #[test]
    fn test_decode_incomplete_frame() {
        let encoded = Message::Command(Command::Next).encode().unwrap();
        assert!(Message::decode(&encoded[..2]).is_err());
        assert!(Message::decode(&encoded[..encoded.len() - 1]).is_err());
    }

    #[test]
    fn test_reserve_matches_structurally() {
        let channel = Channel {
            name: "CCTV-1".to_string(),
            urls: vec!["http://a/1.m3u8".to_string()],
            group: String::new(),
        };
        let reserve = EpgProgrammeReserve::new(&channel, &programme());
        assert!(reserve.matches(&channel, &programme()));

        let mut later = programme();
        later.end_at = Utc.with_ymd_and_hms(2024, 1, 1, 11, 0, 0).unwrap();
        assert!(!reserve.matches(&channel, &later));

        let other = Channel {
            name: "CCTV-2".to_string(),
            ..channel.clone()
        };
        assert!(!reserve.matches(&other, &programme()));
    }
}
