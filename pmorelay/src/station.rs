//! Stations: one stream, one player, shared by every attached session
//!
//! A [`Station`] starts its stream when the first session attaches and
//! pauses it when the last one leaves, so nothing is fetched while nobody
//! listens. Readables published by the stream go straight to the shared
//! [`Player`]; playback updates become [`StationEvent::TrackChanged`]
//! notifications once the announced track actually starts.

use crate::error::{RelayError, Result};
use crate::player::Player;
use crate::session::Session;
use chrono::Utc;
use pmoconfig::Config;
use pmoevents::{BusEvent, EventBus, SubscribeOptions};
use pmolistenmoe::{ListenMoeChannel, ListenMoeConfigExt, SITE_URL};
use pmostream::{
    AudioMetaStream, PlaybackUpdate, Readable, StreamEvent, StreamEventKind, StreamState, Track,
};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const LISTEN_MOE_ICON: &str = "https://listen.moe/_nuxt/img/logo-square-64.248c1f3.png";

/// The stations this relay knows how to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StationKind {
    /// LISTEN.moe J-pop
    ListenMoe,
    /// LISTEN.moe K-pop
    ListenMoeKpop,
}

impl StationKind {
    pub const ALL: [StationKind; 2] = [StationKind::ListenMoe, StationKind::ListenMoeKpop];

    /// Registry key
    pub fn key(&self) -> &'static str {
        match self {
            Self::ListenMoe => "listen.moe",
            Self::ListenMoeKpop => "listen.moe/kpop",
        }
    }

    pub fn channel(&self) -> ListenMoeChannel {
        match self {
            Self::ListenMoe => ListenMoeChannel::Jpop,
            Self::ListenMoeKpop => ListenMoeChannel::Kpop,
        }
    }

    pub fn info(&self) -> StationInfo {
        match self {
            Self::ListenMoe => StationInfo {
                name: "LISTEN.moe".to_string(),
                url: SITE_URL.to_string(),
                color: 0xFF015B,
                icon: LISTEN_MOE_ICON.to_string(),
            },
            Self::ListenMoeKpop => StationInfo {
                name: "LISTEN.moe KPOP".to_string(),
                url: format!("{}/kpop", SITE_URL),
                color: 0x3CA4E2,
                icon: LISTEN_MOE_ICON.to_string(),
            },
        }
    }

    /// Stream for this station, configured from `config`.
    pub fn build_stream(&self, config: &Config) -> anyhow::Result<Arc<dyn AudioMetaStream>> {
        let stream = config
            .listen_moe_stream_builder(self.channel())?
            .name(self.key())
            .build()?;
        Ok(Arc::new(stream))
    }
}

impl fmt::Display for StationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for StationKind {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "listen.moe" | "listen.moe/jpop" | "jpop" => Ok(Self::ListenMoe),
            "listen.moe/kpop" | "listen.moe kpop" | "kpop" => Ok(Self::ListenMoeKpop),
            _ => Err(RelayError::UnknownStation(s.to_string())),
        }
    }
}

/// How a station presents itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StationInfo {
    pub name: String,
    pub url: String,
    /// RGB accent color
    pub color: u32,
    pub icon: String,
}

/// Event published on a station's bus
#[derive(Debug, Clone)]
pub enum StationEvent {
    /// The track on air changed. `None` when the station stopped.
    TrackChanged(Option<Track>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StationEventKind {
    TrackChanged,
}

impl BusEvent for StationEvent {
    type Key = StationEventKind;

    fn key(&self) -> StationEventKind {
        match self {
            Self::TrackChanged(_) => StationEventKind::TrackChanged,
        }
    }
}

struct PendingTrack {
    track: Track,
    cancel: CancellationToken,
}

struct StationState {
    subscribers: Vec<Session>,
    current: Option<Track>,
    pending: Option<PendingTrack>,
    destroyed: bool,
}

impl StationState {
    fn cancel_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
    }
}

pub(crate) struct StationInner {
    key: String,
    info: StationInfo,
    stream: Arc<dyn AudioMetaStream>,
    player: Player,
    bus: EventBus<StationEvent>,
    lifecycle: tokio::sync::Mutex<()>,
    state: Mutex<StationState>,
}

/// Shared, refcounted playback source. Cheap to clone.
#[derive(Clone)]
pub struct Station {
    inner: Arc<StationInner>,
}

impl fmt::Debug for Station {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Station")
            .field("key", &self.inner.key)
            .field("state", &self.state())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl Station {
    /// Wrap `stream`. The stream must not have been destroyed.
    pub fn new(
        key: impl Into<String>,
        info: StationInfo,
        stream: Arc<dyn AudioMetaStream>,
        player_capacity: usize,
    ) -> Result<Self> {
        let key = key.into();
        let inner = Arc::new(StationInner {
            player: Player::new(key.clone(), player_capacity),
            bus: EventBus::new(format!("station:{}", key)),
            key,
            info,
            stream,
            lifecycle: tokio::sync::Mutex::new(()),
            state: Mutex::new(StationState {
                subscribers: Vec::new(),
                current: None,
                pending: None,
                destroyed: false,
            }),
        });

        let weak = Arc::downgrade(&inner);
        inner.stream.events().subscribe(
            StreamEventKind::ReadableChange,
            SubscribeOptions::new(),
            move |d| {
                if let (Some(inner), StreamEvent::ReadableChange(readable)) =
                    (weak.upgrade(), d.data())
                {
                    inner.on_readable(readable.as_ref());
                }
            },
        )?;

        let weak = Arc::downgrade(&inner);
        inner
            .stream
            .events()
            .subscribe(StreamEventKind::Meta, SubscribeOptions::new(), move |d| {
                if let (Some(inner), StreamEvent::Meta(update)) = (weak.upgrade(), d.data()) {
                    inner.on_meta(update);
                }
            })?;

        Ok(Self { inner })
    }

    /// Station of `kind` configured from `config`.
    pub fn from_kind(kind: StationKind, config: &Config) -> anyhow::Result<Self> {
        let stream = kind.build_stream(config)?;
        let capacity = config.get_player_channel_capacity()?;
        Ok(Self::new(kind.key(), kind.info(), stream, capacity)?)
    }

    pub(crate) fn downgrade(&self) -> Weak<StationInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<StationInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn info(&self) -> &StationInfo {
        &self.inner.info
    }

    pub fn stream(&self) -> &Arc<dyn AudioMetaStream> {
        &self.inner.stream
    }

    pub fn state(&self) -> StreamState {
        self.inner.stream.state()
    }

    pub fn player(&self) -> &Player {
        &self.inner.player
    }

    /// Bus carrying [`StationEvent`]s
    pub fn events(&self) -> &EventBus<StationEvent> {
        &self.inner.bus
    }

    /// Track on air, if its start time was reached.
    pub fn current_track(&self) -> Option<Track> {
        self.inner.lock().current.clone()
    }

    /// Announced track waiting for its start time.
    pub fn pending_track(&self) -> Option<Track> {
        self.inner.lock().pending.as_ref().map(|p| p.track.clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    pub fn is_attached(&self, session: &Session) -> bool {
        self.inner
            .lock()
            .subscribers
            .iter()
            .any(|s| s.id() == session.id())
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    /// Add `session` to the subscribers and route the player to its sink.
    ///
    /// The first subscriber starts the stream. If that fails, the session is
    /// removed again and the connect error is returned.
    pub async fn attach(&self, session: &Session) -> Result<()> {
        let _guard = self.inner.lifecycle.lock().await;

        let first = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(RelayError::StationDestroyed(self.inner.key.clone()));
            }
            if state.subscribers.iter().any(|s| s.id() == session.id()) {
                false
            } else {
                state.subscribers.push(session.clone());
                state.subscribers.len() == 1
            }
        };

        session.sink().subscribe(&self.inner.player);

        if first {
            info!(station = %self.inner.key, session = %session.id(), "First listener, starting stream");
            if let Err(e) = self.inner.stream.start().await {
                warn!(station = %self.inner.key, session = %session.id(), "Failed to start stream: {}", e);
                self.inner
                    .lock()
                    .subscribers
                    .retain(|s| s.id() != session.id());
                session.sink().unsubscribe();
                return Err(e.into());
            }
        } else {
            debug!(station = %self.inner.key, session = %session.id(), "Listener attached");
        }

        Ok(())
    }

    /// Remove `session`. The stream is paused when nobody is left.
    ///
    /// Returns whether the session was attached.
    pub async fn detach(&self, session: &Session) -> Result<bool> {
        let _guard = self.inner.lifecycle.lock().await;

        let (removed, now_empty) = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Ok(false);
            }
            let position = state
                .subscribers
                .iter()
                .position(|s| s.id() == session.id());
            let removed = position.map(|p| state.subscribers.remove(p));
            let now_empty = state.subscribers.is_empty();
            if removed.is_some() && now_empty {
                state.cancel_pending();
                state.current = None;
            }
            (removed, now_empty)
        };

        let Some(removed) = removed else {
            return Ok(false);
        };
        removed.sink().unsubscribe();

        if now_empty {
            info!(station = %self.inner.key, session = %session.id(), "Last listener left, pausing stream");
            self.inner.stream.pause().await?;
        } else {
            debug!(station = %self.inner.key, session = %session.id(), "Listener detached");
        }
        Ok(true)
    }

    /// Drop every subscriber, destroy the stream and the station bus.
    ///
    /// Safe to call while an attach is still connecting: the pending connect
    /// is abandoned. Fails on the second call.
    pub async fn destroy(&self) -> Result<()> {
        let subscribers = {
            let mut state = self.inner.lock();
            if state.destroyed {
                return Err(RelayError::StationDestroyed(self.inner.key.clone()));
            }
            state.destroyed = true;
            state.cancel_pending();
            state.current = None;
            std::mem::take(&mut state.subscribers)
        };

        info!(station = %self.inner.key, subscribers = subscribers.len(), "Destroying station");
        for session in &subscribers {
            session.sink().unsubscribe();
        }

        let destroyed = self.inner.stream.destroy().await;

        // Wait for an attach that was still connecting to unwind.
        let _guard = self.inner.lifecycle.lock().await;
        self.inner.player.stop();
        self.inner.bus.teardown()?;
        destroyed.map_err(Into::into)
    }
}

impl StationInner {
    fn lock(&self) -> MutexGuard<'_, StationState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn on_readable(&self, readable: Option<&Readable>) {
        if self.lock().destroyed {
            return;
        }
        match readable {
            Some(readable) => {
                self.player.play(readable);
            }
            None => self.player.stop(),
        }
    }

    fn on_meta(self: &Arc<Self>, update: &PlaybackUpdate) {
        let track = &update.track;
        let now_on_air = {
            let mut state = self.lock();
            if state.destroyed {
                return;
            }
            if state.current.as_ref() == Some(track)
                || state.pending.as_ref().is_some_and(|p| &p.track == track)
            {
                return;
            }
            state.cancel_pending();

            match update.time_until_start(Utc::now()) {
                Some(delay) => {
                    debug!(station = %self.key, track = %track.id, delay_ms = delay.as_millis() as u64, "Track announced ahead of its start");
                    let cancel = CancellationToken::new();
                    state.pending = Some(PendingTrack {
                        track: track.clone(),
                        cancel: cancel.clone(),
                    });
                    tokio::spawn(promote_when_due(
                        Arc::downgrade(self),
                        track.id.clone(),
                        delay,
                        cancel,
                    ));
                    false
                }
                None => {
                    state.current = Some(track.clone());
                    true
                }
            }
        };

        if now_on_air {
            self.announce(Some(track.clone()));
        }
    }

    fn promote(&self, id: &str) {
        let track = {
            let mut state = self.lock();
            if state.destroyed || state.pending.as_ref().map(|p| p.track.id.as_str()) != Some(id) {
                return;
            }
            let Some(pending) = state.pending.take() else {
                return;
            };
            state.current = Some(pending.track.clone());
            pending.track
        };
        self.announce(Some(track));
    }

    fn announce(&self, track: Option<Track>) {
        match &track {
            Some(t) => info!(station = %self.key, track = %t.id, title = %t.title, artists = %t.artists_display(), "Now playing"),
            None => debug!(station = %self.key, "No track on air"),
        }
        if let Err(e) = self.bus.publish(StationEvent::TrackChanged(track)) {
            debug!(station = %self.key, "Track change not published: {}", e);
        }
    }
}

async fn promote_when_due(
    station: Weak<StationInner>,
    id: String,
    delay: Duration,
    cancel: CancellationToken,
) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {
            if let Some(station) = station.upgrade() {
                station.promote(&id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{playback, settle, FakeSink, FakeStream, FakeSurface};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn station_with(stream: &Arc<FakeStream>) -> Station {
        Station::new(
            "test",
            StationKind::ListenMoe.info(),
            stream.clone() as Arc<dyn AudioMetaStream>,
            16,
        )
        .unwrap()
    }

    fn unattached_session(id: &str, station: &Station) -> Session {
        let (surface, _rx) = FakeSurface::new();
        Session::new(id, station, FakeSink::new(id), surface)
    }

    fn count_track_changes(station: &Station) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        station
            .events()
            .subscribe(StationEventKind::TrackChanged, SubscribeOptions::new(), move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        count
    }

    #[test]
    fn test_station_kinds() {
        assert_eq!("listen.moe".parse::<StationKind>().unwrap(), StationKind::ListenMoe);
        assert_eq!(" KPOP ".parse::<StationKind>().unwrap(), StationKind::ListenMoeKpop);
        assert!(matches!(
            "radio-x".parse::<StationKind>(),
            Err(RelayError::UnknownStation(_))
        ));
        assert_eq!(StationKind::ListenMoeKpop.info().url, "https://listen.moe/kpop");
        assert_eq!(StationKind::ListenMoeKpop.channel(), ListenMoeChannel::Kpop);
    }

    #[tokio::test]
    async fn test_playing_iff_subscribers() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let s1 = unattached_session("s1", &station);
        let s2 = unattached_session("s2", &station);

        station.attach(&s1).await.unwrap();
        assert_eq!(station.state(), StreamState::Playing);
        assert_eq!(
            stream.history(),
            vec![StreamState::Idle, StreamState::Connecting, StreamState::Playing]
        );

        station.attach(&s2).await.unwrap();
        assert_eq!(stream.starts(), 1);

        // Attaching twice changes nothing
        station.attach(&s2).await.unwrap();
        assert_eq!(station.subscriber_count(), 2);
        assert_eq!(stream.starts(), 1);

        assert!(station.detach(&s1).await.unwrap());
        assert_eq!(station.state(), StreamState::Playing);
        assert_eq!(stream.pauses(), 0);

        assert!(station.detach(&s2).await.unwrap());
        assert_eq!(station.state(), StreamState::Paused);
        assert_eq!(stream.pauses(), 1);

        assert!(!station.detach(&s2).await.unwrap());
        assert_eq!(stream.pauses(), 1);
    }

    #[tokio::test]
    async fn test_attach_wires_sink_to_player() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let sink = FakeSink::new("s1");
        let (surface, _rx) = FakeSurface::new();
        let session = Session::new("s1", &station, sink.clone(), surface);

        station.attach(&session).await.unwrap();
        assert!(sink.is_subscribed());
        assert_eq!(station.player().sink_count(), 1);

        station.detach(&session).await.unwrap();
        assert!(!sink.is_subscribed());
        assert_eq!(station.player().sink_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_failure_propagates_and_removes_subscriber() {
        let stream = FakeStream::new("test");
        stream.fail_next_start("connection refused");
        let station = station_with(&stream);
        let sink = FakeSink::new("s1");
        let (surface, _rx) = FakeSurface::new();
        let session = Session::new("s1", &station, sink.clone(), surface);

        let err = station.attach(&session).await.unwrap_err();
        assert!(err.is_connect_failure());
        assert_eq!(station.subscriber_count(), 0);
        assert!(!sink.is_subscribed());
        assert_eq!(station.state(), StreamState::Idle);

        // The next attach tries again
        station.attach(&session).await.unwrap();
        assert_eq!(station.state(), StreamState::Playing);
    }

    #[tokio::test]
    async fn test_readable_change_drives_player() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let sink = FakeSink::new("s1");
        let (surface, _rx) = FakeSurface::new();
        let session = Session::new("s1", &station, sink.clone(), surface);
        station.attach(&session).await.unwrap();
        let mut rx = sink.take_receiver().unwrap();

        let _writer = stream.feed(&[b"chunk"]).await;
        assert_eq!(&rx.recv().await.unwrap()[..], b"chunk");
        assert_eq!(station.player().status(), crate::PlayerStatus::Playing);

        stream.withdraw();
        assert_eq!(station.player().status(), crate::PlayerStatus::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_track_published_once_at_start_time() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let changes = count_track_changes(&station);

        // Already started: published at once
        stream.announce(playback("1", Utc::now() - chrono::Duration::seconds(5)));
        assert_eq!(station.current_track().unwrap().id, "1");
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        // Same id again: nothing
        stream.announce(playback("1", Utc::now() - chrono::Duration::seconds(5)));
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        // Starts in 3s: pending until then, repeated announces ignored
        stream.announce(playback("2", Utc::now() + chrono::Duration::seconds(3)));
        stream.announce(playback("2", Utc::now() + chrono::Duration::seconds(3)));
        assert_eq!(station.pending_track().unwrap().id, "2");
        assert_eq!(station.current_track().unwrap().id, "1");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(station.current_track().unwrap().id, "2");
        assert!(station.pending_track().is_none());
        assert_eq!(changes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_pending_track_supersedes() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let changes = count_track_changes(&station);

        stream.announce(playback("a", Utc::now() + chrono::Duration::seconds(10)));
        stream.announce(playback("b", Utc::now() + chrono::Duration::seconds(1)));

        tokio::time::sleep(Duration::from_secs(20)).await;
        settle().await;
        assert_eq!(station.current_track().unwrap().id, "b");
        assert_eq!(changes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_detaches_everyone_and_cancels_pending() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let changes = count_track_changes(&station);
        let sink = FakeSink::new("s1");
        let (surface, _rx) = FakeSurface::new();
        let session = Session::new("s1", &station, sink.clone(), surface);
        station.attach(&session).await.unwrap();

        stream.announce(playback("9", Utc::now() + chrono::Duration::seconds(2)));
        station.destroy().await.unwrap();

        assert!(station.is_destroyed());
        assert_eq!(station.subscriber_count(), 0);
        assert!(!sink.is_subscribed());
        assert_eq!(stream.destroys(), 1);
        assert!(station.events().is_torn_down());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(changes.load(Ordering::SeqCst), 0);

        assert!(matches!(
            station.destroy().await,
            Err(RelayError::StationDestroyed(_))
        ));
        assert!(matches!(
            station.attach(&session).await,
            Err(RelayError::StationDestroyed(_))
        ));
    }

    #[tokio::test]
    async fn test_destroyed_stream_is_rejected() {
        let stream = FakeStream::new("test");
        stream.destroy().await.unwrap();
        let err = Station::new(
            "test",
            StationKind::ListenMoe.info(),
            stream as Arc<dyn AudioMetaStream>,
            16,
        )
        .unwrap_err();
        assert!(matches!(err, RelayError::Bus(_)));
    }

    #[tokio::test]
    async fn test_pause_forgets_track() {
        let stream = FakeStream::new("test");
        let station = station_with(&stream);
        let s1 = unattached_session("s1", &station);
        station.attach(&s1).await.unwrap();
        stream.announce(playback("3", Utc::now()));
        assert!(station.current_track().is_some());

        station.detach(&s1).await.unwrap();
        assert!(station.current_track().is_none());
        assert_eq!(station.state(), StreamState::Paused);
    }
}
