//! Lifecycle states and bus events of a stream

use crate::readable::Readable;
use crate::track::PlaybackUpdate;
use pmoevents::BusEvent;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of an [`AudioMetaStream`](crate::AudioMetaStream).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamState {
    /// Never started
    #[default]
    Idle,
    /// Opening the control socket
    Connecting,
    /// Control socket open, audio delivered
    Playing,
    /// Stopped after having been started; can start again
    Paused,
}

impl StreamState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Playing => "playing",
            Self::Paused => "paused",
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event published on a stream's bus.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A playback update was received from the control socket.
    Meta(PlaybackUpdate),
    /// The published readable changed. `None` means no audio right now.
    ReadableChange(Option<Readable>),
}

/// Key of a [`StreamEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamEventKind {
    Meta,
    ReadableChange,
}

impl BusEvent for StreamEvent {
    type Key = StreamEventKind;

    fn key(&self) -> StreamEventKind {
        match self {
            Self::Meta(_) => StreamEventKind::Meta,
            Self::ReadableChange(_) => StreamEventKind::ReadableChange,
        }
    }
}
