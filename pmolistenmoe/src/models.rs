//! Data models for the LISTEN.moe gateway protocol
//!
//! Gateway frames are JSON objects discriminated by an `op` field:
//!
//! | op | direction | meaning |
//! |----|-----------|---------|
//! | 0  | in        | heartbeat init, `d.heartbeat` in milliseconds |
//! | 1  | in        | playback update (`t` + `d`) |
//! | 9  | out       | heartbeat |
//! | 10 | in        | heartbeat ack |

use crate::client::{BLANK_COVER_URL, COVER_BASE_URL, SITE_URL};
use crate::error::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use pmostream::{ControlMessage, PlaybackUpdate, Track};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Operation codes used on the gateway
pub mod op {
    pub const HEARTBEAT_INIT: u64 = 0;
    pub const PLAYBACK: u64 = 1;
    pub const HEARTBEAT: u64 = 9;
    pub const HEARTBEAT_ACK: u64 = 10;
}

/// Kind of a playback frame (`t` field)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybackKind {
    TrackUpdate,
    TrackUpdateRequest,
    QueueUpdate,
    Notification,
}

/// Artist, source, album or character reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Named {
    pub id: i64,
    pub name: Option<String>,
    #[serde(rename = "nameRomaji")]
    pub name_romaji: Option<String>,
    pub image: Option<String>,
}

impl Named {
    /// Romanized name when available, else the native one.
    pub fn display_name(&self) -> Option<&str> {
        self.name_romaji.as_deref().or(self.name.as_deref())
    }
}

/// A song as described by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Song {
    pub id: i64,
    pub title: String,
    pub sources: Vec<Named>,
    pub artists: Vec<Named>,
    pub albums: Vec<Named>,
    pub characters: Vec<Named>,
    /// Seconds
    pub duration: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub favorite: Option<bool>,
}

impl Song {
    /// Convert into the station-agnostic [`Track`].
    pub fn to_track(&self) -> Track {
        let id = self.id.to_string();

        let cover_art_url = self
            .albums
            .first()
            .and_then(|album| album.image.as_deref())
            .map(|image| format!("{}/{}", COVER_BASE_URL, image))
            .unwrap_or_else(|| BLANK_COVER_URL.to_string());

        let detail_url = self.artists.first().map(|artist| {
            format!(
                "{}/artists/{}#:~:text=Uploader-,{}",
                SITE_URL, artist.id, self.id
            )
        });

        let seconds = self.duration.max(0.0).trunc() as u32;

        Track {
            id,
            title: self.title.clone(),
            artists: display_names(&self.artists),
            source_labels: display_names(&self.sources),
            cover_art_url: Some(cover_art_url),
            duration_seconds: (seconds > 0).then_some(seconds),
            detail_url,
        }
    }
}

fn display_names(items: &[Named]) -> Vec<String> {
    items
        .iter()
        .filter_map(Named::display_name)
        .map(str::to_string)
        .collect()
}

/// `d` payload of an op 1 frame
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PlaybackData {
    pub listeners: u32,
    #[serde(rename = "startTime", deserialize_with = "deserialize_start_time")]
    pub start_time: DateTime<Utc>,
    pub song: Song,
    #[serde(rename = "lastPlayed")]
    pub last_played: Vec<Song>,
    #[serde(default)]
    pub requester: Value,
    #[serde(default)]
    pub event: Value,
}

impl PlaybackData {
    pub fn to_update(&self) -> PlaybackUpdate {
        PlaybackUpdate {
            start_time: self.start_time,
            track: self.song.to_track(),
            listener_count: self.listeners,
            last_played: self.last_played.iter().map(Song::to_track).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PlaybackFrame {
    t: PlaybackKind,
    d: PlaybackData,
}

#[derive(Debug, Deserialize)]
struct HeartbeatInitData {
    #[allow(dead_code)]
    message: String,
    heartbeat: f64,
}

#[derive(Debug, Deserialize)]
struct HeartbeatInitFrame {
    d: HeartbeatInitData,
}

/// Accepts an RFC 3339 string or epoch milliseconds.
fn deserialize_start_time<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;

    match Value::deserialize(deserializer)? {
        Value::String(s) => DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(D::Error::custom),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .ok_or_else(|| D::Error::custom(format!("invalid startTime {}", n))),
        other => Err(D::Error::custom(format!(
            "startTime must be a string or a number, got {}",
            other
        ))),
    }
}

/// Decode one inbound gateway frame.
///
/// Returns [`Error::Protocol`] or [`Error::Json`] for anything that does not
/// match one of the known shapes.
pub fn decode_frame(text: &str) -> Result<ControlMessage> {
    decode_frame_with_kind(text).map(|(message, _)| message)
}

/// Like [`decode_frame`], also returning the `t` of playback frames.
pub fn decode_frame_with_kind(text: &str) -> Result<(ControlMessage, Option<PlaybackKind>)> {
    let value: Value = serde_json::from_str(text)?;
    let code = value
        .get("op")
        .and_then(Value::as_u64)
        .ok_or_else(|| Error::protocol("missing or non-integer op"))?;

    match code {
        op::HEARTBEAT_INIT => {
            let frame: HeartbeatInitFrame = serde_json::from_value(value)?;
            let interval = frame.d.heartbeat;
            if !interval.is_finite() || interval < 1.0 {
                return Err(Error::protocol(format!(
                    "invalid heartbeat interval {}",
                    interval
                )));
            }
            Ok((
                ControlMessage::HeartbeatInit {
                    interval_ms: interval as u64,
                },
                None,
            ))
        }
        op::HEARTBEAT_ACK => Ok((ControlMessage::HeartbeatAck, None)),
        op::PLAYBACK => {
            let frame: PlaybackFrame = serde_json::from_value(value)?;
            Ok((
                ControlMessage::PlaybackUpdate(frame.d.to_update()),
                Some(frame.t),
            ))
        }
        other => Err(Error::protocol(format!("unrecognized op {}", other))),
    }
}

/// Outbound heartbeat frame.
pub fn heartbeat_frame() -> String {
    serde_json::json!({ "op": op::HEARTBEAT }).to_string()
}
