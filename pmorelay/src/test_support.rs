//! In-memory stream, sink and surface used by the unit tests

use crate::player::Player;
use crate::render::DisplayPayload;
use crate::sink::{AudioSink, RenderSurface, SinkLocation};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use pmoevents::EventBus;
use pmostream::{
    buffered_pipe, AudioMetaStream, BufferWriter, PlaybackUpdate, Readable, StreamError,
    StreamEvent, StreamState, Track,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

/// Let spawned tasks run (virtual clock friendly).
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn playback(id: &str, start: DateTime<Utc>) -> PlaybackUpdate {
    let mut track = Track::new(id, format!("Song {}", id));
    track.artists = vec!["Artist".to_string()];
    track.duration_seconds = Some(185);
    PlaybackUpdate {
        start_time: start,
        track,
        listener_count: 10,
        last_played: Vec::new(),
    }
}

/// Scriptable [`AudioMetaStream`] that records every lifecycle call.
#[derive(Debug)]
pub struct FakeStream {
    name: String,
    bus: EventBus<StreamEvent>,
    state: Mutex<StreamState>,
    history: Mutex<Vec<StreamState>>,
    meta: Mutex<Option<PlaybackUpdate>>,
    readable: Mutex<Option<Readable>>,
    fail_start: Mutex<Option<String>>,
    destroyed: AtomicBool,
    starts: AtomicUsize,
    pauses: AtomicUsize,
    destroys: AtomicUsize,
}

impl FakeStream {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            bus: EventBus::new(name),
            state: Mutex::new(StreamState::Idle),
            history: Mutex::new(vec![StreamState::Idle]),
            meta: Mutex::new(None),
            readable: Mutex::new(None),
            fail_start: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            pauses: AtomicUsize::new(0),
            destroys: AtomicUsize::new(0),
        })
    }

    pub fn fail_next_start(&self, reason: &str) {
        *self.fail_start.lock().unwrap() = Some(reason.to_string());
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn pauses(&self) -> usize {
        self.pauses.load(Ordering::SeqCst)
    }

    pub fn destroys(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> Vec<StreamState> {
        self.history.lock().unwrap().clone()
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap() = state;
        self.history.lock().unwrap().push(state);
    }

    /// Publish a playback update as if it came from the control socket.
    pub fn announce(&self, update: PlaybackUpdate) {
        *self.meta.lock().unwrap() = Some(update.clone());
        let _ = self.bus.publish(StreamEvent::Meta(update));
    }

    /// Publish a new readable preloaded with `chunks`.
    pub async fn feed(&self, chunks: &[&'static [u8]]) -> BufferWriter {
        let (writer, reader) = buffered_pipe(1 << 20);
        for chunk in chunks {
            writer.write(Bytes::from_static(chunk)).await.unwrap();
        }
        let readable = Readable::from_reader(self.name.clone(), reader);
        self.replace_readable(Some(readable));
        writer
    }

    /// Withdraw the published readable.
    pub fn withdraw(&self) {
        self.replace_readable(None);
    }

    fn replace_readable(&self, next: Option<Readable>) {
        let previous = std::mem::replace(&mut *self.readable.lock().unwrap(), next.clone());
        if let Some(previous) = previous {
            previous.close();
        }
        let _ = self.bus.publish(StreamEvent::ReadableChange(next));
    }

    fn release(&self) {
        *self.meta.lock().unwrap() = None;
        if self.readable.lock().unwrap().is_some() {
            self.replace_readable(None);
        }
    }
}

#[async_trait]
impl AudioMetaStream for FakeStream {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> StreamState {
        *self.state.lock().unwrap()
    }

    fn events(&self) -> &EventBus<StreamEvent> {
        &self.bus
    }

    fn readable(&self) -> Option<Readable> {
        self.readable.lock().unwrap().clone()
    }

    fn current_meta(&self) -> Option<PlaybackUpdate> {
        self.meta.lock().unwrap().clone()
    }

    async fn start(&self) -> pmostream::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(StreamError::Destroyed);
        }
        if self.state() == StreamState::Playing {
            return Ok(());
        }
        let failure = self.fail_start.lock().unwrap().take();
        if let Some(reason) = failure {
            return Err(StreamError::connect(self.name.clone(), reason));
        }
        self.set_state(StreamState::Connecting);
        tokio::task::yield_now().await;
        self.set_state(StreamState::Playing);
        Ok(())
    }

    async fn pause(&self) -> pmostream::Result<()> {
        self.pauses.fetch_add(1, Ordering::SeqCst);
        if matches!(self.state(), StreamState::Playing | StreamState::Connecting) {
            self.release();
            self.set_state(StreamState::Paused);
        }
        Ok(())
    }

    async fn destroy(&self) -> pmostream::Result<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(StreamError::Destroyed);
        }
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.release();
        self.set_state(StreamState::Idle);
        self.bus.teardown()?;
        Ok(())
    }
}

/// Sink keeping the receiver it was given.
#[derive(Debug)]
pub struct FakeSink {
    id: String,
    live: AtomicBool,
    receiver: Mutex<Option<broadcast::Receiver<Bytes>>>,
    subscribed: AtomicBool,
    subscriptions: AtomicUsize,
}

impl FakeSink {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            live: AtomicBool::new(true),
            receiver: Mutex::new(None),
            subscribed: AtomicBool::new(false),
            subscriptions: AtomicUsize::new(0),
        })
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn take_receiver(&self) -> Option<broadcast::Receiver<Bytes>> {
        self.receiver.lock().unwrap().take()
    }
}

impl AudioSink for FakeSink {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn location(&self) -> SinkLocation {
        SinkLocation::new(self.id.clone()).with_url(format!("https://example.com/{}", self.id))
    }

    fn subscribe(&self, player: &Player) {
        *self.receiver.lock().unwrap() = Some(player.subscribe());
        self.subscribed.store(true, Ordering::SeqCst);
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
    }

    fn unsubscribe(&self) {
        self.receiver.lock().unwrap().take();
        self.subscribed.store(false, Ordering::SeqCst);
    }

    fn has_live_members(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

/// Surface forwarding every payload to a channel.
#[derive(Debug)]
pub struct FakeSurface {
    tx: mpsc::UnboundedSender<DisplayPayload>,
    released: AtomicBool,
    failing: AtomicBool,
}

impl FakeSurface {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DisplayPayload>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                released: AtomicBool::new(false),
                failing: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RenderSurface for FakeSurface {
    async fn present(&self, payload: &DisplayPayload) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("surface unavailable");
        }
        let _ = self.tx.send(payload.clone());
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}
