use serde::{Deserialize, Serialize};

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.  Clients check this on connect and can refuse to talk to an
/// incompatible daemon.
pub const PROTOCOL_VERSION: u32 = 1;

/// Messages sent from a UI client to the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Command {
    /// Select a catalog station; `channel` picks one of its named sub-streams.
    Play {
        station_idx: usize,
        #[serde(default)]
        channel: Option<String>,
    },
    /// Play an arbitrary stream URL outside the catalog.
    PlayUrl { url: String },
    Pause,
    Resume,
    TogglePause,
    /// Release all audio and reset the session.
    Close,
    Next,
    Prev,
    Random,
    Volume { value: f32 },
    ToggleFavorite { station_id: String },
    GetState,
}

/// Messages sent from daemon to clients (broadcasts)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect: daemon version + full state snapshot.
    Hello {
        protocol_version: u32,
        daemon_rev: u64,
        state: DaemonState,
    },
    State {
        data: DaemonState,
    },
    NowPlaying {
        data: Option<NowPlaying>,
    },
    Log {
        message: String,
    },
    Error {
        message: String,
    },
}

/// Playback state machine.
///
/// ```text
///   Idle -> Loading -> Playing <-> Paused
///           Loading -> Retrying -> Loading      (failure, attempts left)
///           Loading -> Failed                   (attempts exhausted)
///   any   -> Idle                               (close)
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle,
    Loading,
    Retrying,
    Playing,
    Paused,
    Failed,
}

/// Result of one ICY metadata probe.  Also the JSON body of
/// `GET /api/now-playing`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct NowPlaying {
    pub title: Option<String>,
    pub supported: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl NowPlaying {
    pub fn unsupported() -> Self {
        Self {
            title: None,
            supported: false,
            error: None,
        }
    }

    pub fn untitled() -> Self {
        Self {
            title: None,
            supported: true,
            error: None,
        }
    }

    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            supported: true,
            error: None,
        }
    }
}

/// What the OS-level media surface (lock screen, media keys overlay) shows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MediaSession {
    pub title: String,
    pub artist: String,
    #[serde(default)]
    pub artwork: Option<String>,
}

/// Full state of the daemon.  `rev` is a monotonically increasing counter
/// incremented every time the state changes.  Clients can use it to detect
/// missed updates and request a resync.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DaemonState {
    #[serde(default)]
    pub rev: u64,
    pub stations: Vec<Station>,
    pub current_station: Option<usize>,
    #[serde(default)]
    pub current_channel: Option<String>,
    #[serde(default)]
    pub stream_url: Option<String>,
    pub playback_status: PlaybackStatus,
    pub volume: f32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub retry_attempt: u32,
    #[serde(default)]
    pub now_playing: Option<NowPlaying>,
    /// True while two sources are audible during a station switch.
    #[serde(default)]
    pub crossfading: bool,
    #[serde(default)]
    pub history_len: usize,
    #[serde(default)]
    pub favorites: Vec<String>,
    #[serde(default)]
    pub media_session: Option<MediaSession>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Station {
    pub id: String,
    pub slug: String,
    pub name: String,
    /// Default stream URL, used when no channel is selected.
    pub url: String,
    #[serde(default)]
    pub description: String,
    /// Parent network or brand (e.g. "Pacifica", "NPR")
    #[serde(default)]
    pub network: String,
    /// Dial position, e.g. "94.1 FM" or "Internet"
    #[serde(default)]
    pub frequency: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub artwork: Option<String>,
    /// Named sub-streams, each independently playable.
    #[serde(default)]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Channel {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: String,
}

impl Station {
    pub fn channel(&self, channel_id: &str) -> Option<&Channel> {
        self.channels.iter().find(|c| c.id == channel_id)
    }

    /// The channel's URL when a known channel is selected, else the default stream.
    pub fn stream_url(&self, channel_id: Option<&str>) -> &str {
        channel_id
            .and_then(|id| self.channel(id))
            .map(|c| c.url.as_str())
            .unwrap_or(&self.url)
    }

    pub fn media_session(&self) -> MediaSession {
        let artist = if self.network.is_empty() {
            self.location.clone()
        } else {
            self.network.clone()
        };
        MediaSession {
            title: self.name.clone(),
            artist,
            artwork: self.artwork.clone(),
        }
    }
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
