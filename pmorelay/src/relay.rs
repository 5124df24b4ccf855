//! Registry of stations and of one session per consumer group

use crate::config_ext::RelayConfigExt;
use crate::error::{RelayError, Result};
use crate::session::Session;
use crate::sink::{AudioSink, RenderSurface};
use crate::station::{Station, StationKind};
use pmoconfig::Config;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Stations built at startup plus the live sessions, keyed by group.
///
/// A group is whatever the outer layer uses to scope listeners (a guild, a
/// room...). Each group has at most one session.
#[derive(Debug)]
pub struct Relay {
    stations: Vec<Station>,
    default_station: String,
    sessions: Mutex<HashMap<String, Session>>,
}

impl Relay {
    pub fn new(stations: Vec<Station>, default_station: impl Into<String>) -> Self {
        Self {
            stations,
            default_station: default_station.into(),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Build every enabled station from the configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let kinds = config.get_relay_stations()?;
        if kinds.is_empty() {
            anyhow::bail!("no station enabled in the configuration");
        }

        let stations = kinds
            .iter()
            .map(|kind| Station::from_kind(*kind, config))
            .collect::<anyhow::Result<Vec<_>>>()?;

        let default = config.get_relay_default_station()?;
        let default = if kinds.contains(&default) {
            default
        } else {
            warn!(station = %default, "Default station is disabled, using {}", kinds[0]);
            kinds[0]
        };

        info!(stations = stations.len(), default = %default, "Relay ready");
        Ok(Self::new(stations, default.key()))
    }

    /// Station registered under `key` (or any name [`StationKind`] accepts).
    pub fn station(&self, key: &str) -> Option<&Station> {
        self.stations.iter().find(|s| s.key() == key).or_else(|| {
            let kind = key.parse::<StationKind>().ok()?;
            self.stations.iter().find(|s| s.key() == kind.key())
        })
    }

    pub fn default_station(&self) -> Option<&Station> {
        self.station(&self.default_station)
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub async fn session(&self, group: &str) -> Option<Session> {
        self.sessions.lock().await.get(group).cloned()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Route `group` to `station` (the default station when `None`).
    ///
    /// An existing session is relocated to `sink` and switched; its surface
    /// is kept and `surface` is dropped. Otherwise a new session is opened.
    pub async fn join(
        &self,
        group: &str,
        station: Option<&str>,
        sink: Arc<dyn AudioSink>,
        surface: Arc<dyn RenderSurface>,
    ) -> Result<Session> {
        let key = station.unwrap_or(&self.default_station);
        let station = self
            .station(key)
            .ok_or_else(|| RelayError::UnknownStation(key.to_string()))?
            .clone();

        if let Some(session) = self.session(group).await {
            session.relocate(sink).await?;
            session.switch_station(&station).await?;
            return Ok(session);
        }

        let opened = Session::open(group, &station, sink, surface).await?;

        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(group).cloned() {
            // Another join for the same group won the race.
            drop(sessions);
            debug!(group, "Concurrent join, keeping the first session");
            opened.destroy().await?;
            existing.switch_station(&station).await?;
            return Ok(existing);
        }
        sessions.insert(group.to_string(), opened.clone());
        Ok(opened)
    }

    /// Destroy the session of `group`. Returns whether there was one.
    pub async fn leave(&self, group: &str) -> Result<bool> {
        let Some(session) = self.sessions.lock().await.remove(group) else {
            return Ok(false);
        };
        info!(group, "Group left");
        session.destroy().await?;
        Ok(true)
    }

    /// Destroy the session of `group` if its sink has no live member left.
    ///
    /// The outer layer calls this on membership changes; the relay never
    /// polls by itself.
    pub async fn release_if_idle(&self, group: &str) -> Result<bool> {
        let session = self
            .session(group)
            .await
            .ok_or_else(|| RelayError::UnknownSession(group.to_string()))?;
        if session.has_live_members() {
            return Ok(false);
        }
        debug!(group, "Sink is empty, releasing session");
        self.leave(group).await
    }

    /// Destroy every session, then every station.
    ///
    /// Keeps going after a failure and returns the first error.
    pub async fn shutdown(&self) -> Result<()> {
        let sessions: Vec<(String, Session)> = self.sessions.lock().await.drain().collect();
        info!(sessions = sessions.len(), stations = self.stations.len(), "Shutting down relay");

        let mut first_error = None;
        for (group, session) in sessions {
            if let Err(e) = session.destroy().await {
                warn!(group = %group, "Failed to destroy session: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for station in &self.stations {
            if station.is_destroyed() {
                continue;
            }
            if let Err(e) = station.destroy().await {
                warn!(station = %station.key(), "Failed to destroy station: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakeSink, FakeStream, FakeSurface};
    use pmostream::{AudioMetaStream, StreamState};

    fn relay() -> (Relay, Arc<FakeStream>, Arc<FakeStream>) {
        let jpop = FakeStream::new("listen.moe");
        let kpop = FakeStream::new("listen.moe/kpop");
        let stations = vec![
            Station::new(
                StationKind::ListenMoe.key(),
                StationKind::ListenMoe.info(),
                jpop.clone() as Arc<dyn AudioMetaStream>,
                16,
            )
            .unwrap(),
            Station::new(
                StationKind::ListenMoeKpop.key(),
                StationKind::ListenMoeKpop.info(),
                kpop.clone() as Arc<dyn AudioMetaStream>,
                16,
            )
            .unwrap(),
        ];
        (Relay::new(stations, "listen.moe"), jpop, kpop)
    }

    #[tokio::test]
    async fn test_join_and_leave() {
        let (relay, jpop, _kpop) = relay();
        let (surface, _rx) = FakeSurface::new();

        let session = relay
            .join("guild-1", None, FakeSink::new("lounge"), surface.clone())
            .await
            .unwrap();
        assert_eq!(session.station_key(), "listen.moe");
        assert_eq!(relay.session_count().await, 1);
        assert_eq!(jpop.state(), StreamState::Playing);

        assert!(relay.leave("guild-1").await.unwrap());
        assert!(!relay.leave("guild-1").await.unwrap());
        assert!(surface.is_released());
        assert_eq!(jpop.state(), StreamState::Paused);
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_second_join_moves_and_switches() {
        let (relay, jpop, kpop) = relay();
        let (surface, _rx) = FakeSurface::new();
        let first_sink = FakeSink::new("lounge");
        relay
            .join("guild-1", None, first_sink.clone(), surface)
            .await
            .unwrap();

        let (other_surface, _rx2) = FakeSurface::new();
        let second_sink = FakeSink::new("attic");
        let session = relay
            .join("guild-1", Some("kpop"), second_sink.clone(), other_surface)
            .await
            .unwrap();

        assert_eq!(relay.session_count().await, 1);
        assert_eq!(session.station_key(), "listen.moe/kpop");
        assert_eq!(session.sink().id(), "attic");
        assert!(!first_sink.is_subscribed());
        assert!(second_sink.is_subscribed());
        assert_eq!(jpop.state(), StreamState::Paused);
        assert_eq!(kpop.state(), StreamState::Playing);
    }

    #[tokio::test]
    async fn test_groups_share_one_stream() {
        let (relay, jpop, _kpop) = relay();
        for group in ["a", "b", "c"] {
            let (surface, _rx) = FakeSurface::new();
            relay
                .join(group, None, FakeSink::new(group), surface)
                .await
                .unwrap();
        }
        assert_eq!(jpop.starts(), 1);
        assert_eq!(relay.station("listen.moe").unwrap().subscriber_count(), 3);

        relay.leave("a").await.unwrap();
        relay.leave("b").await.unwrap();
        assert_eq!(jpop.pauses(), 0);
        relay.leave("c").await.unwrap();
        assert_eq!(jpop.pauses(), 1);
    }

    #[tokio::test]
    async fn test_unknown_station() {
        let (relay, _, _) = relay();
        let (surface, _rx) = FakeSurface::new();
        let err = relay
            .join("g", Some("radio-x"), FakeSink::new("s"), surface)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownStation(_)));
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_join_is_not_registered() {
        let (relay, jpop, _) = relay();
        jpop.fail_next_start("refused");
        let (surface, _rx) = FakeSurface::new();
        let err = relay
            .join("g", None, FakeSink::new("s"), surface)
            .await
            .unwrap_err();
        assert!(err.is_connect_failure());
        assert_eq!(relay.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_if_idle() {
        let (relay, _, _) = relay();
        let (surface, _rx) = FakeSurface::new();
        let sink = FakeSink::new("lounge");
        relay.join("g", None, sink.clone(), surface).await.unwrap();

        assert!(!relay.release_if_idle("g").await.unwrap());
        sink.set_live(false);
        assert!(relay.release_if_idle("g").await.unwrap());
        assert!(matches!(
            relay.release_if_idle("g").await,
            Err(RelayError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (relay, jpop, kpop) = relay();
        let (surface, _rx) = FakeSurface::new();
        relay
            .join("g", None, FakeSink::new("s"), surface.clone())
            .await
            .unwrap();

        relay.shutdown().await.unwrap();
        assert!(surface.is_released());
        assert_eq!(relay.session_count().await, 0);
        assert_eq!(jpop.destroys(), 1);
        assert_eq!(kpop.destroys(), 1);
        assert!(relay.stations().iter().all(Station::is_destroyed));

        // Nothing left to do on a second shutdown
        relay.shutdown().await.unwrap();

        let (surface, _rx) = FakeSurface::new();
        assert!(relay
            .join("g", None, FakeSink::new("s"), surface)
            .await
            .is_err());
    }
}
