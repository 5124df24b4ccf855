//! Boundaries with the outer layer: where audio goes and where status is shown

use crate::player::Player;
use crate::render::DisplayPayload;
use async_trait::async_trait;
use std::fmt::Debug;

/// Where a sink lives, as shown to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkLocation {
    pub name: String,
    pub url: Option<String>,
}

impl SinkLocation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// ``Playing in [`#name`](url)``, without the link when there is no url.
    pub fn playing_in(&self) -> String {
        match &self.url {
            Some(url) => format!("Playing in [`#{}`]({})", self.name, url),
            None => format!("Playing in `#{}`", self.name),
        }
    }
}

/// An audio output endpoint owned by the outer layer.
///
/// The relay never inspects membership itself: it only asks whether the
/// sink still has live members when told to.
pub trait AudioSink: Send + Sync + Debug {
    /// Stable identity of the endpoint
    fn id(&self) -> String;

    fn location(&self) -> SinkLocation;

    /// Start consuming the player's output. Replaces any previous player.
    fn subscribe(&self, player: &Player);

    /// Stop consuming audio.
    fn unsubscribe(&self);

    fn has_live_members(&self) -> bool;
}

/// Presents display payloads (a status message, a log line...).
#[async_trait]
pub trait RenderSurface: Send + Sync + Debug {
    /// Show `payload`, replacing whatever was shown before.
    async fn present(&self, payload: &DisplayPayload) -> anyhow::Result<()>;

    /// Remove the surface.
    async fn release(&self) -> anyhow::Result<()>;
}
