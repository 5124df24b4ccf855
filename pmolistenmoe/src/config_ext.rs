//! Extension pour intégrer LISTEN.moe dans pmoconfig
//!
//! ```rust,ignore
//! use pmoconfig::get_config;
//! use pmolistenmoe::{ListenMoeChannel, ListenMoeConfigExt};
//!
//! let config = get_config();
//! let stream = config.listen_moe_stream_builder(ListenMoeChannel::Jpop)?.build()?;
//! ```

use crate::client::{ListenMoeChannel, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::stream::{
    ListenMoeStream, ListenMoeStreamBuilder, ReconnectBackoff, DEFAULT_BACKOFF_INITIAL_MS,
    DEFAULT_BACKOFF_MAX_MS,
};
use anyhow::Result;
use pmoconfig::Config;
use pmostream::MIN_BUFFER_BYTES;
use serde_yaml::{Number, Value};
use std::time::Duration;

const SOURCE_PATH: [&str; 2] = ["sources", "listen_moe"];
const AUDIO_PATH: [&str; 2] = ["relay", "audio"];

fn path<'a>(base: &[&'a str], key: &'a str) -> Vec<&'a str> {
    let mut path = base.to_vec();
    path.push(key);
    path
}

fn read_u64(config: &Config, path: &[&str]) -> Option<u64> {
    match config.get_value(path) {
        Ok(Value::Number(n)) => n.as_u64(),
        Ok(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Trait d'extension pour la configuration LISTEN.moe dans pmoconfig
pub trait ListenMoeConfigExt {
    /// LISTEN.moe stations enabled (default: true)
    fn get_listen_moe_enabled(&self) -> Result<bool>;
    fn set_listen_moe_enabled(&self, enabled: bool) -> Result<()>;

    /// User-Agent sent to the gateway and the audio endpoint
    fn get_listen_moe_user_agent(&self) -> Result<String>;

    /// Connection timeout for the gateway and the audio fetch (default: 15s)
    fn get_listen_moe_connect_timeout(&self) -> Result<Duration>;
    fn set_listen_moe_connect_timeout(&self, timeout: Duration) -> Result<()>;

    /// Buffer between the audio fetch and the player, never below 1 MiB
    fn get_audio_buffer_bytes(&self) -> Result<usize>;
    fn set_audio_buffer_bytes(&self, bytes: usize) -> Result<()>;

    /// Delays between audio fetches that delivered nothing
    fn get_audio_reconnect_backoff(&self) -> Result<ReconnectBackoff>;

    /// Stream builder preloaded with the settings above
    fn listen_moe_stream_builder(&self, channel: ListenMoeChannel) -> Result<ListenMoeStreamBuilder>;
}

impl ListenMoeConfigExt for Config {
    fn get_listen_moe_enabled(&self) -> Result<bool> {
        match self.get_value(&path(&SOURCE_PATH, "enabled")) {
            Ok(Value::Bool(b)) => Ok(b),
            _ => Ok(true),
        }
    }

    fn set_listen_moe_enabled(&self, enabled: bool) -> Result<()> {
        self.set_value(&path(&SOURCE_PATH, "enabled"), Value::Bool(enabled))
    }

    fn get_listen_moe_user_agent(&self) -> Result<String> {
        match self.get_value(&path(&SOURCE_PATH, "user_agent")) {
            Ok(Value::String(s)) if !s.trim().is_empty() => Ok(s),
            _ => Ok(DEFAULT_USER_AGENT.to_string()),
        }
    }

    fn get_listen_moe_connect_timeout(&self) -> Result<Duration> {
        let secs = read_u64(self, &path(&SOURCE_PATH, "connect_timeout_secs"))
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS);
        Ok(Duration::from_secs(secs))
    }

    fn set_listen_moe_connect_timeout(&self, timeout: Duration) -> Result<()> {
        self.set_value(
            &path(&SOURCE_PATH, "connect_timeout_secs"),
            Value::Number(Number::from(timeout.as_secs())),
        )
    }

    fn get_audio_buffer_bytes(&self) -> Result<usize> {
        let bytes = read_u64(self, &path(&AUDIO_PATH, "buffer_bytes"))
            .map(|b| b as usize)
            .unwrap_or(MIN_BUFFER_BYTES);
        Ok(bytes.max(MIN_BUFFER_BYTES))
    }

    fn set_audio_buffer_bytes(&self, bytes: usize) -> Result<()> {
        self.set_value(
            &path(&AUDIO_PATH, "buffer_bytes"),
            Value::Number(Number::from(bytes.max(MIN_BUFFER_BYTES) as u64)),
        )
    }

    fn get_audio_reconnect_backoff(&self) -> Result<ReconnectBackoff> {
        let initial = read_u64(self, &path(&AUDIO_PATH, "reconnect_backoff_initial_ms"))
            .unwrap_or(DEFAULT_BACKOFF_INITIAL_MS);
        let max = read_u64(self, &path(&AUDIO_PATH, "reconnect_backoff_max_ms"))
            .unwrap_or(DEFAULT_BACKOFF_MAX_MS)
            .max(initial);
        Ok(ReconnectBackoff {
            initial: Duration::from_millis(initial),
            max: Duration::from_millis(max),
        })
    }

    fn listen_moe_stream_builder(&self, channel: ListenMoeChannel) -> Result<ListenMoeStreamBuilder> {
        Ok(ListenMoeStream::builder(channel)
            .user_agent(self.get_listen_moe_user_agent()?)
            .connect_timeout(self.get_listen_moe_connect_timeout()?)
            .buffer_bytes(self.get_audio_buffer_bytes()?)
            .backoff(self.get_audio_reconnect_backoff()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        (dir, config)
    }

    #[test]
    fn test_defaults() {
        let (_dir, config) = temp_config();
        assert!(config.get_listen_moe_enabled().unwrap());
        assert_eq!(config.get_audio_buffer_bytes().unwrap(), MIN_BUFFER_BYTES);
        assert_eq!(
            config.get_listen_moe_connect_timeout().unwrap(),
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
        );
        assert_eq!(config.get_audio_reconnect_backoff().unwrap(), ReconnectBackoff::default());
    }

    #[test]
    fn test_buffer_is_clamped() {
        let (_dir, config) = temp_config();
        config
            .set_value(&["relay", "audio", "buffer_bytes"], Value::Number(Number::from(42)))
            .unwrap();
        assert_eq!(config.get_audio_buffer_bytes().unwrap(), MIN_BUFFER_BYTES);

        config.set_audio_buffer_bytes(4 * MIN_BUFFER_BYTES).unwrap();
        assert_eq!(config.get_audio_buffer_bytes().unwrap(), 4 * MIN_BUFFER_BYTES);
    }

    #[test]
    fn test_builder_from_config() {
        let (_dir, config) = temp_config();
        config.set_listen_moe_enabled(false).unwrap();
        assert!(!config.get_listen_moe_enabled().unwrap());

        let stream = config
            .listen_moe_stream_builder(ListenMoeChannel::Kpop)
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(stream.buffer_bytes(), MIN_BUFFER_BYTES);
    }
}
