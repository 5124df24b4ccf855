//! # pmolistenmoe - LISTEN.moe station streams
//!
//! Implements [`pmostream::AudioMetaStream`] for the two LISTEN.moe
//! programs (J-pop and K-pop):
//!
//! - [`gateway`]: the control socket (websocket) and its in-memory twin for tests
//! - [`models`]: serde models of the gateway frames and their conversion to [`pmostream::Track`]
//! - [`client`]: endpoints and the HTTP audio source
//! - [`stream`]: the [`ListenMoeStream`] state machine (heartbeat, audio re-fetch, reconnect)
//!
//! ## Quick Start
//!
//! ```no_run
//! use pmoevents::SubscribeOptions;
//! use pmolistenmoe::{ListenMoeChannel, ListenMoeStream};
//! use pmostream::{AudioMetaStream, StreamEvent, StreamEventKind};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let stream = ListenMoeStream::new(ListenMoeChannel::Jpop)?;
//!     stream.events().subscribe(StreamEventKind::Meta, SubscribeOptions::new(), |d| {
//!         if let StreamEvent::Meta(update) = d.data() {
//!             println!("{} - {}", update.track.artists_display(), update.track.title);
//!         }
//!     })?;
//!     stream.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     stream.destroy().await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod error;
pub mod gateway;
pub mod models;
pub mod stream;

#[cfg(feature = "pmoconfig")]
pub mod config_ext;

#[cfg(test)]
pub(crate) mod test_support;

pub use client::{
    HttpAudioSource, HttpAudioSourceBuilder, ListenMoeChannel, BLANK_COVER_URL, COVER_BASE_URL,
    SITE_URL,
};
pub use error::{Error, Result};
pub use gateway::{ControlConnection, ControlPeer, ControlSender, ControlTransport, GatewayTransport};
pub use models::{decode_frame, heartbeat_frame, PlaybackKind, Song};
pub use stream::{ListenMoeStream, ListenMoeStreamBuilder, ReconnectBackoff};

#[cfg(feature = "pmoconfig")]
pub use config_ext::ListenMoeConfigExt;
