//! `ListenMoeStream`: gateway + audio state machine for one LISTEN.moe channel
//!
//! ```text
//!  Idle ──start──▶ Connecting ──handshake──▶ Playing ⇄ Paused
//!    ▲                                          │
//!    └──────────────── destroy ◀────────────────┘
//! ```
//!
//! The control socket drives everything: a heartbeat-init frame starts the
//! heartbeat timer, and every playback update whose track id differs from
//! the previous one starts a new audio fetch. The audio supervisor
//! re-fetches after each premature close, waiting for the announced start
//! time of the current track when it lies in the future.
//!
//! A dropped control socket is not reconnected; callers recover by calling
//! [`start`](AudioMetaStream::start) again.

use crate::client::{
    HttpAudioSource, ListenMoeChannel, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT,
};
use crate::gateway::{ControlConnection, ControlSender, ControlTransport, GatewayTransport};
use crate::models::{decode_frame, heartbeat_frame};
use async_trait::async_trait;
use chrono::Utc;
use pmoevents::EventBus;
use pmostream::{
    AudioMetaStream, AudioSource, ControlMessage, PlaybackUpdate, PumpOutcome, Readable,
    ReadableSlot, Result, StreamError, StreamEvent, StreamState, MIN_BUFFER_BYTES,
};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Default delay before retrying an audio fetch that delivered nothing
pub const DEFAULT_BACKOFF_INITIAL_MS: u64 = 500;

/// Upper bound of the audio retry delay
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 30_000;

const BACKOFF_MULTIPLIER: u32 = 2;

/// Delay policy applied when a published audio stream closes before
/// delivering any byte.
///
/// Streams that delivered audio before closing are re-fetched without delay
/// (apart from waiting for the track start time). A fetch that fails to open
/// is never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectBackoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(DEFAULT_BACKOFF_INITIAL_MS),
            max: Duration::from_millis(DEFAULT_BACKOFF_MAX_MS),
        }
    }
}

struct BackoffState {
    policy: ReconnectBackoff,
    current: Option<Duration>,
}

impl BackoffState {
    fn new(policy: ReconnectBackoff) -> Self {
        Self {
            policy,
            current: None,
        }
    }

    fn reset(&mut self) {
        self.current = None;
    }

    fn next_delay(&mut self) -> Duration {
        let next = match self.current {
            Some(current) => (current * BACKOFF_MULTIPLIER).min(self.policy.max),
            None => self.policy.initial.min(self.policy.max),
        };
        self.current = Some(next);
        next
    }
}

/// LISTEN.moe station stream.
///
/// Cheap to clone; clones share the same state machine.
///
/// # Example
///
/// ```no_run
/// use pmolistenmoe::{ListenMoeChannel, ListenMoeStream};
/// use pmostream::AudioMetaStream;
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let stream = ListenMoeStream::new(ListenMoeChannel::Jpop)?;
/// stream.start().await?;
/// // ... subscribe to stream.events() ...
/// stream.destroy().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ListenMoeStream {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    name: String,
    transport: Arc<dyn ControlTransport>,
    audio: Arc<dyn AudioSource>,
    buffer_bytes: usize,
    backoff: ReconnectBackoff,
    bus: EventBus<StreamEvent>,
    slot: ReadableSlot,
    /// Serialises start/pause/destroy
    lifecycle: tokio::sync::Mutex<()>,
    runtime: Mutex<Runtime>,
}

#[derive(Default)]
struct Runtime {
    state: StreamState,
    destroyed: bool,
    control: Option<ControlHandle>,
    meta: Option<PlaybackUpdate>,
    audio: Option<AudioHandle>,
    connecting: Option<CancellationToken>,
    generation: u64,
}

impl Runtime {
    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

struct ControlHandle {
    generation: u64,
    sender: ControlSender,
    closer: CancellationToken,
    heartbeat: Option<CancellationToken>,
}

impl ControlHandle {
    fn shutdown(self) {
        if let Some(heartbeat) = self.heartbeat {
            heartbeat.cancel();
        }
        self.closer.cancel();
    }
}

struct AudioHandle {
    generation: u64,
    cancel: CancellationToken,
}

impl fmt::Debug for ListenMoeStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rt = self.inner.runtime();
        f.debug_struct("ListenMoeStream")
            .field("name", &self.inner.name)
            .field("transport", &self.inner.transport)
            .field("audio", &self.inner.audio)
            .field("state", &rt.state)
            .field("control_open", &rt.control.is_some())
            .field("destroyed", &rt.destroyed)
            .finish()
    }
}

impl ListenMoeStream {
    /// Stream for `channel` with the default websocket and HTTP endpoints.
    pub fn new(channel: ListenMoeChannel) -> crate::Result<Self> {
        Self::builder(channel).build()
    }

    pub fn builder(channel: ListenMoeChannel) -> ListenMoeStreamBuilder {
        ListenMoeStreamBuilder::new(channel)
    }

    /// Whether a heartbeat timer is currently running.
    pub fn has_heartbeat(&self) -> bool {
        self.inner
            .runtime()
            .control
            .as_ref()
            .and_then(|c| c.heartbeat.as_ref())
            .is_some_and(|t| !t.is_cancelled())
    }

    /// Whether the control socket is open.
    pub fn is_control_open(&self) -> bool {
        self.inner
            .runtime()
            .control
            .as_ref()
            .is_some_and(|c| c.sender.is_open())
    }

    pub fn buffer_bytes(&self) -> usize {
        self.inner.buffer_bytes
    }
}

impl StreamInner {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn audio_is_current(&self, generation: u64) -> bool {
        let rt = self.runtime();
        !rt.destroyed
            && rt.state == StreamState::Playing
            && rt.audio.as_ref().is_some_and(|a| a.generation == generation)
    }

    fn control_is_current(rt: &Runtime, generation: u64) -> bool {
        !rt.destroyed && rt.control.as_ref().is_some_and(|c| c.generation == generation)
    }

    fn handle_frame(self: &Arc<Self>, generation: u64, frame: &str) {
        trace!(station = %self.name, frame = %frame, "Gateway frame");
        let message = match decode_frame(frame) {
            Ok(message) => message,
            Err(e) => {
                let err = e.into_stream_error(&self.transport.target());
                warn!(station = %self.name, "Dropping gateway frame: {}", err);
                return;
            }
        };

        match message {
            ControlMessage::HeartbeatInit { interval_ms } => {
                self.start_heartbeat(generation, Duration::from_millis(interval_ms))
            }
            ControlMessage::HeartbeatAck => {
                trace!(station = %self.name, "Heartbeat acknowledged");
            }
            ControlMessage::PlaybackUpdate(update) => self.apply_update(generation, update),
        }
    }

    fn start_heartbeat(&self, generation: u64, interval: Duration) {
        let (sender, token) = {
            let mut rt = self.runtime();
            if !Self::control_is_current(&rt, generation) {
                return;
            }
            let Some(control) = rt.control.as_mut() else {
                return;
            };
            if let Some(previous) = control.heartbeat.take() {
                previous.cancel();
            }
            let token = control.closer.child_token();
            control.heartbeat = Some(token.clone());
            (control.sender.clone(), token)
        };

        debug!(
            station = %self.name,
            interval_ms = interval.as_millis() as u64,
            "Starting heartbeat"
        );
        tokio::spawn(heartbeat_loop(self.name.clone(), sender, interval, token));
    }

    fn apply_update(self: &Arc<Self>, generation: u64, update: PlaybackUpdate) {
        let changed = {
            let mut rt = self.runtime();
            if !Self::control_is_current(&rt, generation) {
                return;
            }
            let changed = rt
                .meta
                .as_ref()
                .map_or(true, |meta| meta.track.id != update.track.id);
            rt.meta = Some(update.clone());
            changed
        };

        debug!(
            station = %self.name,
            track_id = %update.track.id,
            title = %update.track.title,
            listeners = update.listener_count,
            changed,
            "Playback update"
        );

        if let Err(e) = self.bus.publish(StreamEvent::Meta(update)) {
            debug!(station = %self.name, "Meta not delivered: {}", e);
        }
        if changed {
            self.restart_audio();
        }
    }

    fn restart_audio(self: &Arc<Self>) {
        let cancel = CancellationToken::new();
        let generation = {
            let mut rt = self.runtime();
            if rt.destroyed || rt.state != StreamState::Playing {
                return;
            }
            let generation = rt.next_generation();
            let previous = rt.audio.replace(AudioHandle {
                generation,
                cancel: cancel.clone(),
            });
            if let Some(previous) = previous {
                previous.cancel.cancel();
            }
            generation
        };

        tokio::spawn(supervise_audio(Arc::downgrade(self), generation, cancel));
    }

    fn control_closed(&self, generation: u64) {
        let mut rt = self.runtime();
        if !Self::control_is_current(&rt, generation) {
            return;
        }
        if let Some(control) = rt.control.take() {
            control.shutdown();
        }
        // Audio keeps flowing; a later start() reopens the socket.
        warn!(station = %self.name, "Control socket closed by remote");
    }

    /// Shared teardown of pause and destroy. Caller holds the lifecycle lock.
    fn release(&self, next_state: StreamState) {
        let (control, audio) = {
            let mut rt = self.runtime();
            rt.state = next_state;
            rt.meta = None;
            (rt.control.take(), rt.audio.take())
        };
        if let Some(control) = control {
            control.shutdown();
        }
        if let Some(audio) = audio {
            audio.cancel.cancel();
        }
        self.slot.replace(&self.bus, None);
    }
}

async fn run_control(weak: Weak<StreamInner>, generation: u64, mut conn: ControlConnection) {
    while let Some(frame) = conn.recv().await {
        let Some(inner) = weak.upgrade() else {
            conn.close();
            return;
        };
        inner.handle_frame(generation, &frame);
    }
    if let Some(inner) = weak.upgrade() {
        inner.control_closed(generation);
    }
}

async fn heartbeat_loop(
    station: String,
    sender: ControlSender,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sender.send(heartbeat_frame()) {
                    warn!(station = %station, "Heartbeat stopped: {}", e);
                    break;
                }
                trace!(station = %station, "Heartbeat sent");
            }
        }
    }
    debug!(station = %station, "Heartbeat timer stopped");
}

async fn supervise_audio(weak: Weak<StreamInner>, generation: u64, cancel: CancellationToken) {
    let mut backoff = match weak.upgrade() {
        Some(inner) => BackoffState::new(inner.backoff),
        None => return,
    };

    loop {
        let Some(inner) = weak.upgrade() else { return };
        let source = inner.audio.clone();
        let name = inner.name.clone();
        let capacity = inner.buffer_bytes;
        drop(inner);

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            opened = source.open() => opened,
        };

        let body = match opened {
            Ok(body) => body,
            Err(err) => {
                // Not retried: the next track change or start() fetches again.
                warn!(station = %name, "Audio fetch failed: {}", err);
                return;
            }
        };

        let (readable, pump) = Readable::spawn(name.clone(), body, capacity);
        let Some(inner) = weak.upgrade() else {
            readable.close();
            return;
        };
        let swapped = inner.slot.replace_if(&inner.bus, Some(readable.clone()), || {
            !cancel.is_cancelled() && inner.audio_is_current(generation)
        });
        drop(inner);
        if !swapped {
            return;
        }
        info!(station = %name, readable = readable.id(), "Audio stream published");

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            outcome = pump => outcome.unwrap_or_else(|e| PumpOutcome::Failed {
                bytes: 0,
                reason: e.to_string(),
            }),
        };

        let Some(inner) = weak.upgrade() else { return };
        match outcome {
            PumpOutcome::Cancelled { .. } => return,
            PumpOutcome::ConsumerGone { bytes } => {
                debug!(station = %name, bytes, "Audio consumer went away");
                inner.slot.replace_if(&inner.bus, None, || {
                    !cancel.is_cancelled() && inner.audio_is_current(generation)
                });
                return;
            }
            PumpOutcome::Ended { .. } | PumpOutcome::Failed { .. } => {}
        }

        if let Some(err) = outcome.clone().into_error() {
            warn!(station = %name, "{}, reconnecting", err);
        }
        let cleared = inner.slot.replace_if(&inner.bus, None, || {
            !cancel.is_cancelled() && inner.audio_is_current(generation)
        });
        if !cleared {
            return;
        }

        let until_start = inner
            .runtime()
            .meta
            .as_ref()
            .and_then(|meta| meta.time_until_start(Utc::now()));
        drop(inner);

        let retry = if outcome.bytes() == 0 {
            Some(backoff.next_delay())
        } else {
            backoff.reset();
            None
        };

        if let Some(wait) = until_start.max(retry) {
            debug!(
                station = %name,
                wait_ms = wait.as_millis() as u64,
                "Waiting before audio re-fetch"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }
}

#[async_trait]
impl AudioMetaStream for ListenMoeStream {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn state(&self) -> StreamState {
        self.inner.runtime().state
    }

    fn events(&self) -> &EventBus<StreamEvent> {
        &self.inner.bus
    }

    fn readable(&self) -> Option<Readable> {
        self.inner.slot.get()
    }

    fn current_meta(&self) -> Option<PlaybackUpdate> {
        self.inner.runtime().meta.clone()
    }

    async fn start(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;

        let (cancel, previous) = {
            let mut rt = inner.runtime();
            if rt.destroyed {
                return Err(StreamError::Destroyed);
            }
            if rt.state == StreamState::Playing && rt.control.is_some() {
                return Ok(());
            }
            let previous = rt.state;
            if previous != StreamState::Playing {
                rt.state = StreamState::Connecting;
            }
            let cancel = CancellationToken::new();
            rt.connecting = Some(cancel.clone());
            (cancel, previous)
        };

        let target = inner.transport.target();
        info!(station = %inner.name, target = %target, "Opening control socket");
        let connected = tokio::select! {
            _ = cancel.cancelled() => Err(StreamError::Destroyed),
            conn = inner.transport.connect() => conn.map_err(|e| StreamError::connect(&target, e)),
        };

        let mut rt = inner.runtime();
        rt.connecting = None;
        let conn = match connected {
            Ok(conn) if !rt.destroyed => conn,
            Ok(conn) => {
                conn.close();
                return Err(StreamError::Destroyed);
            }
            Err(err) => {
                if !rt.destroyed && rt.state == StreamState::Connecting {
                    rt.state = previous;
                }
                warn!(station = %inner.name, "Control socket failed: {}", err);
                return Err(err);
            }
        };

        let generation = rt.next_generation();
        rt.control = Some(ControlHandle {
            generation,
            sender: conn.sender(),
            closer: conn.close_handle(),
            heartbeat: None,
        });
        rt.state = StreamState::Playing;
        drop(rt);

        tokio::spawn(run_control(Arc::downgrade(inner), generation, conn));
        info!(station = %inner.name, "Control socket open");
        Ok(())
    }

    async fn pause(&self) -> Result<()> {
        let inner = &self.inner;
        let _guard = inner.lifecycle.lock().await;
        {
            let rt = inner.runtime();
            if rt.destroyed {
                return Err(StreamError::Destroyed);
            }
            if !matches!(rt.state, StreamState::Connecting | StreamState::Playing) {
                return Ok(());
            }
        }
        inner.release(StreamState::Paused);
        info!(station = %inner.name, "Stream paused");
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let inner = &self.inner;
        {
            let mut rt = inner.runtime();
            if rt.destroyed {
                return Err(StreamError::Destroyed);
            }
            rt.destroyed = true;
            if let Some(connecting) = rt.connecting.take() {
                connecting.cancel();
            }
        }

        let _guard = inner.lifecycle.lock().await;
        inner.release(StreamState::Idle);
        inner.bus.teardown()?;
        info!(station = %inner.name, "Stream destroyed");
        Ok(())
    }
}

/// Builder for [`ListenMoeStream`]
pub struct ListenMoeStreamBuilder {
    channel: ListenMoeChannel,
    name: Option<String>,
    transport: Option<Arc<dyn ControlTransport>>,
    audio: Option<Arc<dyn AudioSource>>,
    buffer_bytes: usize,
    backoff: ReconnectBackoff,
    user_agent: String,
    connect_timeout: Duration,
}

impl ListenMoeStreamBuilder {
    fn new(channel: ListenMoeChannel) -> Self {
        Self {
            channel,
            name: None,
            transport: None,
            audio: None,
            buffer_bytes: MIN_BUFFER_BYTES,
            backoff: ReconnectBackoff::default(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    /// Name used in logs and as the bus label (default: `listen.moe/<slug>`)
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Replace the websocket transport
    pub fn transport(mut self, transport: Arc<dyn ControlTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Replace the HTTP audio source
    pub fn audio_source(mut self, audio: Arc<dyn AudioSource>) -> Self {
        self.audio = Some(audio);
        self
    }

    /// Buffer between the audio fetch and its consumer, at least 1 MiB
    pub fn buffer_bytes(mut self, bytes: usize) -> Self {
        self.buffer_bytes = bytes.max(MIN_BUFFER_BYTES);
        self
    }

    pub fn backoff(mut self, backoff: ReconnectBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn build(self) -> crate::Result<ListenMoeStream> {
        let name = self
            .name
            .unwrap_or_else(|| format!("listen.moe/{}", self.channel.slug()));

        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                GatewayTransport::new(self.channel.gateway_url())
                    .with_user_agent(self.user_agent.clone())
                    .with_connect_timeout(self.connect_timeout),
            ),
        };

        let audio = match self.audio {
            Some(audio) => audio,
            None => Arc::new(
                HttpAudioSource::builder()
                    .url(self.channel.stream_url())
                    .user_agent(self.user_agent)
                    .connect_timeout(self.connect_timeout)
                    .build()?,
            ),
        };

        Ok(ListenMoeStream {
            inner: Arc::new(StreamInner {
                bus: EventBus::new(name.clone()),
                name,
                transport,
                audio,
                buffer_bytes: self.buffer_bytes,
                backoff: self.backoff,
                slot: ReadableSlot::new(),
                lifecycle: tokio::sync::Mutex::new(()),
                runtime: Mutex::new(Runtime::default()),
            }),
        })
    }
}
