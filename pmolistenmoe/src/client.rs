//! LISTEN.moe endpoints and the HTTP audio source

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use pmostream::{AudioBody, AudioSource, StreamError};
use reqwest::Client;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;
use url::Url;

/// LISTEN.moe website
pub const SITE_URL: &str = "https://listen.moe";

/// Base URL of album covers (image name is appended)
pub const COVER_BASE_URL: &str = "https://cdn.listen.moe/covers";

/// Cover used when a song has no album art
pub const BLANK_COVER_URL: &str = "https://listen.moe/_nuxt/img/blank-dark.cd1c044.png";

/// Default User-Agent
pub const DEFAULT_USER_AGENT: &str = "pmolistenmoe/0.1.0";

/// Default timeout for establishing the gateway and audio connections
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;

/// The two LISTEN.moe programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenMoeChannel {
    Jpop,
    Kpop,
}

impl ListenMoeChannel {
    pub const ALL: [ListenMoeChannel; 2] = [ListenMoeChannel::Jpop, ListenMoeChannel::Kpop];

    pub fn slug(&self) -> &'static str {
        match self {
            Self::Jpop => "jpop",
            Self::Kpop => "kpop",
        }
    }

    /// Control socket URL
    pub fn gateway_url(&self) -> &'static str {
        match self {
            Self::Jpop => "wss://listen.moe/gateway_v2",
            Self::Kpop => "wss://listen.moe/kpop/gateway_v2",
        }
    }

    /// Continuous audio URL
    pub fn stream_url(&self) -> &'static str {
        match self {
            Self::Jpop => "https://listen.moe/stream",
            Self::Kpop => "https://listen.moe/kpop/stream",
        }
    }
}

impl fmt::Display for ListenMoeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

impl FromStr for ListenMoeChannel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpop" | "j-pop" => Ok(Self::Jpop),
            "kpop" | "k-pop" => Ok(Self::Kpop),
            other => Err(Error::protocol(format!("unknown LISTEN.moe channel '{}'", other))),
        }
    }
}

/// Continuous audio fetched over HTTP, one request per [`open`](AudioSource::open).
///
/// # Example
///
/// ```no_run
/// use pmolistenmoe::{HttpAudioSource, ListenMoeChannel};
/// use pmostream::AudioSource;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let source = HttpAudioSource::builder()
///     .url(ListenMoeChannel::Kpop.stream_url())
///     .build()?;
/// let body = source.open().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct HttpAudioSource {
    client: Client,
    url: Url,
}

impl HttpAudioSource {
    /// Source for `channel` with default settings
    pub fn for_channel(channel: ListenMoeChannel) -> Result<Self> {
        Self::builder().url(channel.stream_url()).build()
    }

    pub fn builder() -> HttpAudioSourceBuilder {
        HttpAudioSourceBuilder::default()
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl AudioSource for HttpAudioSource {
    async fn open(&self) -> pmostream::Result<AudioBody> {
        debug!(url = %self.url, "Opening audio stream");

        let response = self
            .client
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| Error::from(e).into_stream_error(self.url.as_str()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamError::Http {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        let body = response
            .bytes_stream()
            .map_err(|e| StreamError::Io(std::io::Error::other(e)));
        Ok(AudioBody::new(body))
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Builder for [`HttpAudioSource`]
#[derive(Debug, Default)]
pub struct HttpAudioSourceBuilder {
    client: Option<Client>,
    url: Option<String>,
    user_agent: Option<String>,
    connect_timeout: Option<Duration>,
}

impl HttpAudioSourceBuilder {
    /// Use a custom reqwest client (user agent and timeout are then ignored)
    pub fn client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Result<HttpAudioSource> {
        let url = Url::parse(
            self.url
                .as_deref()
                .unwrap_or(ListenMoeChannel::Jpop.stream_url()),
        )?;

        let client = match self.client {
            Some(client) => client,
            None => Client::builder()
                .user_agent(self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
                .connect_timeout(
                    self.connect_timeout
                        .unwrap_or(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)),
                )
                .build()?,
        };

        Ok(HttpAudioSource { client, url })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_urls() {
        assert_eq!(ListenMoeChannel::Jpop.gateway_url(), "wss://listen.moe/gateway_v2");
        assert_eq!(ListenMoeChannel::Kpop.stream_url(), "https://listen.moe/kpop/stream");
        assert_eq!("K-POP".parse::<ListenMoeChannel>().unwrap(), ListenMoeChannel::Kpop);
        assert!("rock".parse::<ListenMoeChannel>().is_err());
    }

    #[test]
    fn test_builder_defaults_to_jpop() {
        let source = HttpAudioSource::builder().build().unwrap();
        assert_eq!(source.url(), "https://listen.moe/stream");
    }

    #[test]
    fn test_builder_rejects_bad_url() {
        let err = HttpAudioSource::builder().url("not a url").build().unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
