//! The contract every station stream implements

use crate::error::Result;
use crate::event::{StreamEvent, StreamState};
use crate::readable::Readable;
use crate::track::PlaybackUpdate;
use async_trait::async_trait;
use pmoevents::EventBus;
use std::fmt::Debug;

/// A station feed: a control channel announcing tracks plus a live audio
/// byte source.
///
/// Implementations publish [`StreamEvent::Meta`] for every playback update
/// and [`StreamEvent::ReadableChange`] whenever the audio source is
/// replaced or goes away.
#[async_trait]
pub trait AudioMetaStream: Send + Sync + Debug {
    /// Station name, for logs.
    fn name(&self) -> &str;

    fn state(&self) -> StreamState;

    fn is_playing(&self) -> bool {
        self.state() == StreamState::Playing
    }

    fn events(&self) -> &EventBus<StreamEvent>;

    /// Currently published audio source, if any.
    fn readable(&self) -> Option<Readable>;

    /// Latest playback update, cleared on pause.
    fn current_meta(&self) -> Option<PlaybackUpdate>;

    /// Open the control channel and begin delivering audio.
    ///
    /// A no-op when already playing with an open control channel.
    async fn start(&self) -> Result<()>;

    /// Close the control channel and the audio source. Does nothing unless
    /// the stream is connecting or playing.
    async fn pause(&self) -> Result<()>;

    /// Release everything and tear down the event bus. Fails on the second call.
    async fn destroy(&self) -> Result<()>;
}
