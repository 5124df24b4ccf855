//! # pmorelay - Shared stations and listener sessions
//!
//! The relay layer on top of [`pmostream`] streams:
//!
//! - [`Station`]: one stream and one [`Player`] shared by every attached
//!   session. The stream runs only while at least one session is attached.
//! - [`Session`]: one consumer group's binding of an [`AudioSink`] and a
//!   [`RenderSurface`] to a station, re-rendered on every track change.
//! - [`Relay`]: the stations built at startup and one session per group.
//! - [`DisplayPayload`]: embed-like status views (idle, track, failure).
//!
//! ## Example
//!
//! ```rust,no_run
//! use pmoconfig::get_config;
//! use pmorelay::Relay;
//!
//! # async fn demo(
//! #     sink: std::sync::Arc<dyn pmorelay::AudioSink>,
//! #     surface: std::sync::Arc<dyn pmorelay::RenderSurface>,
//! # ) -> anyhow::Result<()> {
//! let relay = Relay::from_config(&get_config())?;
//! relay.join("living-room", None, sink, surface).await?;
//! tokio::signal::ctrl_c().await?;
//! relay.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod config_ext;
pub mod error;
pub mod logs;
pub mod player;
pub mod relay;
pub mod render;
pub mod session;
pub mod sink;
pub mod station;

#[cfg(test)]
pub(crate) mod test_support;

pub use config_ext::RelayConfigExt;
pub use error::{RelayError, Result};
pub use logs::{init_logging, LogHandle};
pub use player::{Player, PlayerStatus};
pub use relay::Relay;
pub use render::{DisplayField, DisplayPayload};
pub use session::Session;
pub use sink::{AudioSink, RenderSurface, SinkLocation};
pub use station::{Station, StationEvent, StationEventKind, StationInfo, StationKind};
