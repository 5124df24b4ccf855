//! # pmostream - Contract and building blocks for station streams
//!
//! A station stream couples a control channel (track announcements) with a
//! live audio byte source. This crate holds what every implementation
//! shares:
//!
//! - [`AudioMetaStream`]: the lifecycle contract (`start`/`pause`/`destroy`)
//! - [`StreamEvent`]: the events published on the stream's [`EventBus`](pmoevents::EventBus)
//! - [`Readable`]: a single-consumer handle on buffered audio
//! - [`AudioSource`]: how an upstream audio fetch is opened
//! - [`Track`], [`PlaybackUpdate`], [`ControlMessage`]: station-agnostic models
//!
//! ## Example
//!
//! ```rust,no_run
//! use pmostream::{AudioMetaStream, StreamEvent, StreamEventKind};
//! use pmoevents::SubscribeOptions;
//!
//! # async fn demo(stream: &dyn AudioMetaStream) -> pmostream::Result<()> {
//! stream.events().subscribe(StreamEventKind::Meta, SubscribeOptions::new(), |d| {
//!     if let StreamEvent::Meta(update) = d.data() {
//!         println!("now playing {}", update.track.title);
//!     }
//! })?;
//! stream.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod readable;
pub mod source;
pub mod track;
pub mod traits;

pub use error::{Result, StreamError};
pub use event::{StreamEvent, StreamEventKind, StreamState};
pub use readable::{
    buffered_pipe, AudioBody, BufferClosed, BufferReader, BufferWriter, PumpOutcome, Readable,
    ReadableSlot, MIN_BUFFER_BYTES,
};
pub use source::AudioSource;
pub use track::{format_duration, ControlMessage, PlaybackUpdate, Track};
pub use traits::AudioMetaStream;
