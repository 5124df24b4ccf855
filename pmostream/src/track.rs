//! Track and control message models shared by every station

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// A piece of media announced by a station.
///
/// Two tracks are equal when their station-assigned `id` is equal, whatever
/// the other fields say.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artists: Vec<String>,
    pub source_labels: Vec<String>,
    pub cover_art_url: Option<String>,
    pub duration_seconds: Option<u32>,
    pub detail_url: Option<String>,
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Track {}

impl Hash for Track {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl Track {
    /// Minimal track with only an id and a title.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            artists: Vec::new(),
            source_labels: Vec::new(),
            cover_art_url: None,
            duration_seconds: None,
            detail_url: None,
        }
    }

    pub fn artists_display(&self) -> String {
        self.artists.join(", ")
    }

    /// Duration as `minutes:seconds`, seconds zero-padded.
    pub fn formatted_duration(&self) -> Option<String> {
        self.duration_seconds.map(format_duration)
    }
}

/// Format a number of seconds as `m:ss`.
pub fn format_duration(seconds: u32) -> String {
    format!("{}:{:02}", seconds / 60, seconds % 60)
}

/// Now-playing announcement carried by a control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackUpdate {
    /// When the track starts (or started) on air
    pub start_time: DateTime<Utc>,
    pub track: Track,
    pub listener_count: u32,
    /// Most recent first
    pub last_played: Vec<Track>,
}

impl PlaybackUpdate {
    /// Time left before `start_time`, `None` once it is reached.
    pub fn time_until_start(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.start_time - now).to_std().ok().filter(|d| !d.is_zero())
    }
}

/// Decoded control-socket message.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    HeartbeatInit { interval_ms: u64 },
    HeartbeatAck,
    PlaybackUpdate(PlaybackUpdate),
}

impl ControlMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::HeartbeatInit { .. } => "heartbeat-init",
            Self::HeartbeatAck => "heartbeat-ack",
            Self::PlaybackUpdate(_) => "playback-update",
        }
    }
}
