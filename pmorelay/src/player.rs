//! Shared player: one audio resource, fanned out to every subscribed sink
//!
//! A [`Player`] plays at most one [`Readable`] at a time. Its encoded bytes
//! are pushed on a broadcast channel; sinks call [`Player::subscribe`] and
//! drain their own receiver. Nothing is decoded per listener.
//!
//! Bytes produced while no sink is subscribed are dropped, so a sink that
//! joins later hears the live position rather than a backlog.
//!
//! The relay task holds back while the slowest receiver's queue is full,
//! leaving the backlog in the upstream readable buffer. A receiver that stays
//! full for [`MAX_SINK_STALL`] no longer holds the others: the task sends
//! anyway and that receiver gets `Lagged`.

use bytes::Bytes;
use pmostream::{BufferReader, Readable};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Longest the relay waits on a full sink before overrunning it
pub const MAX_SINK_STALL: Duration = Duration::from_secs(2);

const STALL_POLL: Duration = Duration::from_millis(5);

/// Playback status of a [`Player`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Idle,
    Playing,
}

struct PlaybackResource {
    readable_id: u64,
    cancel: CancellationToken,
}

struct PlayerState {
    status: PlayerStatus,
    resource: Option<PlaybackResource>,
}

struct PlayerInner {
    label: String,
    tx: broadcast::Sender<Bytes>,
    capacity: usize,
    state: Mutex<PlayerState>,
    bytes_relayed: AtomicU64,
}

/// Cheap to clone; every clone drives the same player.
#[derive(Clone)]
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl fmt::Debug for Player {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Player")
            .field("label", &self.inner.label)
            .field("status", &self.status())
            .field("sinks", &self.sink_count())
            .finish()
    }
}

impl Player {
    pub fn new(label: impl Into<String>, channel_capacity: usize) -> Self {
        let capacity = channel_capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(PlayerInner {
                label: label.into(),
                tx,
                capacity,
                state: Mutex::new(PlayerState {
                    status: PlayerStatus::Idle,
                    resource: None,
                }),
                bytes_relayed: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlayerState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Stop the current resource and start playing `readable`.
    ///
    /// The reader is taken before returning, so the call must happen while
    /// the readable is still open (typically inside the `ReadableChange`
    /// listener). Returns false when the reader was already taken or closed;
    /// the player is then left idle.
    pub fn play(&self, readable: &Readable) -> bool {
        let Some(reader) = readable.take_reader() else {
            warn!(player = %self.inner.label, readable = readable.id(), "Readable not available, staying idle");
            self.stop();
            return false;
        };

        let cancel = CancellationToken::new();
        {
            let mut state = self.lock();
            if let Some(previous) = state.resource.take() {
                previous.cancel.cancel();
            }
            state.resource = Some(PlaybackResource {
                readable_id: readable.id(),
                cancel: cancel.clone(),
            });
            state.status = PlayerStatus::Playing;
        }

        debug!(player = %self.inner.label, readable = readable.id(), "Playing new resource");
        tokio::spawn(relay_chunks(self.clone(), readable.id(), reader, cancel));
        true
    }

    /// Stop and release the current resource, if any.
    pub fn stop(&self) {
        let mut state = self.lock();
        if let Some(resource) = state.resource.take() {
            debug!(player = %self.inner.label, readable = resource.readable_id, "Stopping resource");
            resource.cancel.cancel();
        }
        state.status = PlayerStatus::Idle;
    }

    pub fn status(&self) -> PlayerStatus {
        self.lock().status
    }

    /// Id of the readable being played.
    pub fn current_readable(&self) -> Option<u64> {
        self.lock().resource.as_ref().map(|r| r.readable_id)
    }

    /// New receiver of the encoded bytes, starting at the live position.
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.inner.tx.subscribe()
    }

    pub fn sink_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// Total bytes handed to sinks since creation
    pub fn bytes_relayed(&self) -> u64 {
        self.inner.bytes_relayed.load(Ordering::Relaxed)
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    fn finished(&self, readable_id: u64) {
        let mut state = self.lock();
        if state.resource.as_ref().map(|r| r.readable_id) == Some(readable_id) {
            state.resource = None;
            state.status = PlayerStatus::Idle;
        }
    }
}

async fn relay_chunks(
    player: Player,
    readable_id: u64,
    mut reader: BufferReader,
    cancel: CancellationToken,
) {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            chunk = reader.read() => chunk,
        };
        let Some(chunk) = chunk else {
            trace!(player = %player.inner.label, readable = readable_id, "Resource drained");
            break;
        };
        if !wait_for_room(&player, &cancel).await {
            break;
        }
        let len = chunk.len() as u64;
        if player.inner.tx.send(chunk).is_ok() {
            player.inner.bytes_relayed.fetch_add(len, Ordering::Relaxed);
        }
    }
    player.finished(readable_id);
}

/// Wait until the slowest receiver has room, at most [`MAX_SINK_STALL`].
///
/// Returns false when cancelled.
async fn wait_for_room(player: &Player, cancel: &CancellationToken) -> bool {
    let tx = &player.inner.tx;
    let deadline = tokio::time::Instant::now() + MAX_SINK_STALL;
    while tx.receiver_count() > 0 && tx.len() >= player.inner.capacity {
        if tokio::time::Instant::now() >= deadline {
            warn!(player = %player.inner.label, "Sink stalled, overrunning it");
            return true;
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(STALL_POLL) => {}
        }
    }
    true
}
