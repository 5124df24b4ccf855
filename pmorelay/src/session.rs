//! Sessions: one consumer bound to one station
//!
//! A [`Session`] ties an [`AudioSink`] and a [`RenderSurface`] to a
//! [`Station`]. It keeps only a weak reference to the station; the station
//! owns its attached sessions. The surface is re-rendered on attach, on
//! every track change and on relocation.

use crate::error::{RelayError, Result};
use crate::render::DisplayPayload;
use crate::sink::{AudioSink, RenderSurface};
use crate::station::{Station, StationEventKind, StationInner};
use pmoevents::{SubscribeOptions, Subscription};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

struct Binding {
    station: Weak<StationInner>,
    station_key: String,
    attached: bool,
    /// Why the last attach failed
    failure: Option<String>,
    track_listener: Option<Subscription<StationEventKind>>,
}

struct SessionInner {
    id: String,
    binding: Mutex<Binding>,
    sink: Mutex<Arc<dyn AudioSink>>,
    surface: Arc<dyn RenderSurface>,
    render_lock: tokio::sync::Mutex<()>,
    render_requested: Arc<Notify>,
    worker: CancellationToken,
    destroyed: AtomicBool,
}

/// A consumer's live binding to a station. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding();
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("station", &binding.station_key)
            .field("attached", &binding.attached)
            .finish()
    }
}

impl Session {
    /// Session bound to `station` but not attached yet.
    pub fn new(
        id: impl Into<String>,
        station: &Station,
        sink: Arc<dyn AudioSink>,
        surface: Arc<dyn RenderSurface>,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: id.into(),
                binding: Mutex::new(Binding {
                    station: station.downgrade(),
                    station_key: station.key().to_string(),
                    attached: false,
                    failure: None,
                    track_listener: None,
                }),
                sink: Mutex::new(sink),
                surface,
                render_lock: tokio::sync::Mutex::new(()),
                render_requested: Arc::new(Notify::new()),
                worker: CancellationToken::new(),
                destroyed: AtomicBool::new(false),
            }),
        }
    }

    /// Create a session, attach it to `station` and render it.
    ///
    /// When the station cannot connect, the failure is rendered on the
    /// surface (which is left in place) and the error is returned.
    pub async fn open(
        id: impl Into<String>,
        station: &Station,
        sink: Arc<dyn AudioSink>,
        surface: Arc<dyn RenderSurface>,
    ) -> Result<Self> {
        let session = Self::new(id, station, sink, surface);
        session.spawn_render_worker();

        if let Err(e) = session.bind(station).await {
            session.inner.worker.cancel();
            return Err(e);
        }
        if let Err(e) = session.render().await {
            warn!(session = %session.id(), "Initial render failed: {}", e);
        }
        info!(session = %session.id(), station = %station.key(), "Session opened");
        Ok(session)
    }

    fn binding(&self) -> MutexGuard<'_, Binding> {
        self.inner.binding.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn sink(&self) -> Arc<dyn AudioSink> {
        self.inner
            .sink
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// The bound station, unless it was dropped or destroyed.
    pub fn station(&self) -> Option<Station> {
        Station::upgrade(&self.binding().station).filter(|s| !s.is_destroyed())
    }

    pub fn station_key(&self) -> String {
        self.binding().station_key.clone()
    }

    pub fn is_attached(&self) -> bool {
        self.binding().attached
    }

    /// Reason of the last connect failure, cleared by a successful attach.
    pub fn failure(&self) -> Option<String> {
        self.binding().failure.clone()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    pub fn has_live_members(&self) -> bool {
        self.sink().has_live_members()
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_destroyed() {
            return Err(RelayError::UnknownSession(self.inner.id.clone()));
        }
        Ok(())
    }

    /// Detach from the current station and attach to `station`.
    ///
    /// Does nothing when already attached to a station with the same key.
    pub async fn switch_station(&self, station: &Station) -> Result<()> {
        self.ensure_alive()?;
        {
            let binding = self.binding();
            if binding.attached && binding.station_key == station.key() {
                return Ok(());
            }
        }

        info!(session = %self.id(), from = %self.station_key(), to = %station.key(), "Switching station");
        self.unbind().await?;
        self.bind(station).await?;
        self.render().await
    }

    /// Target another sink; the station binding is unchanged.
    pub async fn relocate(&self, sink: Arc<dyn AudioSink>) -> Result<()> {
        self.ensure_alive()?;
        let previous = {
            let mut current = self.inner.sink.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *current, sink.clone())
        };

        if !Arc::ptr_eq(&previous, &sink) {
            debug!(session = %self.id(), from = %previous.id(), to = %sink.id(), "Relocating session");
            previous.unsubscribe();
            if self.is_attached() {
                if let Some(station) = self.station() {
                    sink.subscribe(station.player());
                }
            }
        }

        self.render().await
    }

    /// Present the current view on the surface.
    pub async fn render(&self) -> Result<()> {
        self.ensure_alive()?;
        let _guard = self.inner.render_lock.lock().await;
        let payload = self.payload()?;
        self.inner
            .surface
            .present(&payload)
            .await
            .map_err(RelayError::surface)
    }

    /// View for the current state: failure, idle or the track on air.
    pub fn payload(&self) -> Result<DisplayPayload> {
        let (station, key, failure) = {
            let binding = self.binding();
            (
                Station::upgrade(&binding.station),
                binding.station_key.clone(),
                binding.failure.clone(),
            )
        };
        let station = station.ok_or(RelayError::StationDestroyed(key))?;
        let location = self.sink().location();

        Ok(match (failure, station.current_track()) {
            (Some(reason), _) => DisplayPayload::failure(station.info(), &reason),
            (None, Some(track)) => DisplayPayload::track(station.info(), &track, &location),
            (None, None) => DisplayPayload::idle(station.info(), &location),
        })
    }

    /// Detach from the station and release the surface.
    ///
    /// A second call does nothing.
    pub async fn destroy(&self) -> Result<()> {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.worker.cancel();

        let detached = self.unbind().await;
        let released = self
            .inner
            .surface
            .release()
            .await
            .map_err(RelayError::surface);

        info!(session = %self.id(), "Session destroyed");
        detached.and(released)
    }

    async fn bind(&self, station: &Station) -> Result<()> {
        {
            let mut binding = self.binding();
            binding.station = station.downgrade();
            binding.station_key = station.key().to_string();
            binding.attached = false;
        }

        let attached = match station.attach(self).await {
            Ok(()) => self.listen(station),
            Err(e) => Err(e),
        };

        match attached {
            Ok(listener) => {
                let mut binding = self.binding();
                binding.attached = true;
                binding.failure = None;
                binding.track_listener = Some(listener);
                Ok(())
            }
            Err(e) => {
                warn!(session = %self.id(), station = %station.key(), "Could not attach: {}", e);
                self.binding().failure = Some(e.to_string());
                if let Err(render_err) = self.render().await {
                    warn!(session = %self.id(), "Failure render failed: {}", render_err);
                }
                Err(e)
            }
        }
    }

    async fn unbind(&self) -> Result<()> {
        let (station, listener, attached) = {
            let mut binding = self.binding();
            let attached = std::mem::replace(&mut binding.attached, false);
            (
                Station::upgrade(&binding.station),
                binding.track_listener.take(),
                attached,
            )
        };
        let Some(station) = station else {
            return Ok(());
        };

        if let Some(listener) = listener {
            if let Err(e) = station.events().unsubscribe(listener) {
                debug!(session = %self.id(), "Track listener already gone: {}", e);
            }
        }
        if attached {
            station.detach(self).await?;
        }
        Ok(())
    }

    fn listen(&self, station: &Station) -> Result<Subscription<StationEventKind>> {
        let notify = self.inner.render_requested.clone();
        let subscription = station.events().subscribe(
            StationEventKind::TrackChanged,
            SubscribeOptions::new(),
            move |_| notify.notify_one(),
        )?;
        Ok(subscription)
    }

    fn spawn_render_worker(&self) {
        let weak = Arc::downgrade(&self.inner);
        let notify = self.inner.render_requested.clone();
        let cancel = self.inner.worker.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = notify.notified() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                let session = Session { inner };
                if let Err(e) = session.render().await {
                    warn!(session = %session.id(), "Render failed: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::station::StationKind;
    use crate::test_support::{playback, FakeSink, FakeStream, FakeSurface};
    use chrono::Utc;
    use pmostream::{AudioMetaStream, StreamState};
    use std::time::Duration;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn station(kind: StationKind) -> (Arc<FakeStream>, Station) {
        let stream = FakeStream::new(kind.key());
        let station = Station::new(
            kind.key(),
            kind.info(),
            stream.clone() as Arc<dyn AudioMetaStream>,
            16,
        )
        .unwrap();
        (stream, station)
    }

    async fn next(rx: &mut UnboundedReceiver<DisplayPayload>) -> DisplayPayload {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_open_renders_idle_then_track() {
        let (stream, station) = station(StationKind::ListenMoe);
        let (surface, mut rx) = FakeSurface::new();
        let session = Session::open("g1", &station, FakeSink::new("lounge"), surface)
            .await
            .unwrap();

        let idle = next(&mut rx).await;
        assert_eq!(idle.title, "LISTEN.moe");
        assert!(session.is_attached());
        assert_eq!(station.state(), StreamState::Playing);

        stream.announce(playback("11", Utc::now()));
        let track = next(&mut rx).await;
        assert_eq!(track.title, "Artist");
        assert_eq!(track.description.as_deref(), Some("### Song 11"));
    }

    #[tokio::test]
    async fn test_connect_failure_renders_failure() {
        let (stream, station) = station(StationKind::ListenMoe);
        stream.fail_next_start("timed out");
        let (surface, mut rx) = FakeSurface::new();

        let err = Session::open("g1", &station, FakeSink::new("lounge"), surface.clone())
            .await
            .unwrap_err();
        assert!(err.is_connect_failure());

        let payload = next(&mut rx).await;
        assert!(payload
            .description
            .unwrap()
            .starts_with("Could not connect to LISTEN.moe"));
        assert!(!surface.is_released());
        assert_eq!(station.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_switch_station() {
        let (jpop_stream, jpop) = station(StationKind::ListenMoe);
        let (kpop_stream, kpop) = station(StationKind::ListenMoeKpop);
        let (surface, mut rx) = FakeSurface::new();
        let session = Session::open("g1", &jpop, FakeSink::new("lounge"), surface)
            .await
            .unwrap();
        next(&mut rx).await;

        session.switch_station(&kpop).await.unwrap();
        assert_eq!(jpop.subscriber_count(), 0);
        assert_eq!(jpop_stream.state(), StreamState::Paused);
        assert_eq!(kpop.subscriber_count(), 1);
        assert_eq!(kpop_stream.state(), StreamState::Playing);
        assert_eq!(session.station_key(), "listen.moe/kpop");
        assert_eq!(next(&mut rx).await.color, 0x3CA4E2);

        // Same station: nothing happens
        session.switch_station(&kpop).await.unwrap();
        assert_eq!(kpop_stream.starts(), 1);
        assert!(rx.try_recv().is_err());

        // Old station updates no longer reach this session
        jpop_stream.announce(playback("1", Utc::now()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_relocate_rewires_sink() {
        let (_stream, station) = station(StationKind::ListenMoe);
        let (surface, mut rx) = FakeSurface::new();
        let first = FakeSink::new("lounge");
        let session = Session::open("g1", &station, first.clone(), surface)
            .await
            .unwrap();
        next(&mut rx).await;

        let second = FakeSink::new("attic");
        session.relocate(second.clone()).await.unwrap();

        assert!(!first.is_subscribed());
        assert!(second.is_subscribed());
        assert_eq!(station.subscriber_count(), 1);
        assert_eq!(
            next(&mut rx).await.description.as_deref(),
            Some("Playing in [`#attic`](https://example.com/attic)")
        );
    }

    #[tokio::test]
    async fn test_destroy_detaches_and_releases() {
        let (stream, station) = station(StationKind::ListenMoe);
        let (surface, _rx) = FakeSurface::new();
        let session = Session::open("g1", &station, FakeSink::new("lounge"), surface.clone())
            .await
            .unwrap();

        session.destroy().await.unwrap();
        assert!(surface.is_released());
        assert_eq!(station.subscriber_count(), 0);
        assert_eq!(stream.pauses(), 1);

        session.destroy().await.unwrap();
        assert_eq!(stream.pauses(), 1);
        assert!(matches!(
            session.render().await,
            Err(RelayError::UnknownSession(_))
        ));
    }

    #[tokio::test]
    async fn test_surface_error_is_reported() {
        let (_stream, station) = station(StationKind::ListenMoe);
        let (surface, _rx) = FakeSurface::new();
        let session = Session::open("g1", &station, FakeSink::new("lounge"), surface.clone())
            .await
            .unwrap();

        surface.set_failing(true);
        assert!(matches!(session.render().await, Err(RelayError::Surface(_))));
    }

    #[tokio::test]
    async fn test_session_survives_station_destroy() {
        let (_stream, station) = station(StationKind::ListenMoe);
        let (surface, _rx) = FakeSurface::new();
        let session = Session::open("g1", &station, FakeSink::new("lounge"), surface.clone())
            .await
            .unwrap();

        station.destroy().await.unwrap();
        assert!(session.station().is_none());
        session.destroy().await.unwrap();
        assert!(surface.is_released());
    }
}
