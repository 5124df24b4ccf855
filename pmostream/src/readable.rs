//! Live byte-source handles.
//!
//! An upstream [`AudioBody`] is drained by a pump task into a byte-bounded
//! buffer. The consumer side of that buffer is published as a [`Readable`],
//! which one player takes with [`Readable::take_reader`].

use crate::error::{Result, StreamError};
use crate::event::StreamEvent;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use pmoevents::EventBus;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Minimum size of the buffer between an upstream fetch and its consumer.
pub const MIN_BUFFER_BYTES: usize = 1024 * 1024;

/// Raw encoded audio coming from an upstream fetch.
pub struct AudioBody {
    inner: Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>,
}

impl AudioBody {
    pub fn new(stream: impl Stream<Item = Result<Bytes>> + Send + 'static) -> Self {
        Self {
            inner: Box::pin(stream),
        }
    }
}

impl Stream for AudioBody {
    type Item = Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl fmt::Debug for AudioBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBody").finish_non_exhaustive()
    }
}

/// Create a pipe holding at most `capacity` bytes in flight.
pub fn buffered_pipe(capacity: usize) -> (BufferWriter, BufferReader) {
    let capacity = capacity.max(1);
    let (tx, rx) = mpsc::unbounded_channel();
    let budget = Arc::new(Semaphore::new(capacity));
    (
        BufferWriter {
            tx,
            budget: budget.clone(),
            capacity,
        },
        BufferReader {
            rx,
            budget,
            capacity,
        },
    )
}

/// Producer half of [`buffered_pipe`].
pub struct BufferWriter {
    tx: mpsc::UnboundedSender<Bytes>,
    budget: Arc<Semaphore>,
    capacity: usize,
}

impl BufferWriter {
    /// Wait for room then enqueue `chunk`. Fails once the reader is gone.
    pub async fn write(&self, chunk: Bytes) -> std::result::Result<(), BufferClosed> {
        let cost = chunk_cost(&chunk, self.capacity);
        let permits = self
            .budget
            .acquire_many(cost)
            .await
            .map_err(|_| BufferClosed)?;
        permits.forget();
        self.tx.send(chunk).map_err(|_| BufferClosed)
    }
}

/// Consumer half of [`buffered_pipe`].
pub struct BufferReader {
    rx: mpsc::UnboundedReceiver<Bytes>,
    budget: Arc<Semaphore>,
    capacity: usize,
}

impl BufferReader {
    /// Next chunk, `None` once the producer finished and the buffer is drained.
    pub async fn read(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await?;
        self.budget.add_permits(chunk_cost(&chunk, self.capacity) as usize);
        Some(chunk)
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        // Wakes a writer blocked on a full buffer.
        self.budget.close();
    }
}

impl fmt::Debug for BufferReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferReader")
            .field("capacity", &self.capacity)
            .field("available", &self.budget.available_permits())
            .finish()
    }
}

fn chunk_cost(chunk: &Bytes, capacity: usize) -> u32 {
    chunk.len().clamp(1, capacity).min(u32::MAX as usize) as u32
}

/// The reader side of a pipe is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferClosed;

/// How a pump task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpOutcome {
    /// Upstream body ended cleanly.
    Ended { bytes: u64 },
    /// Upstream body yielded an error.
    Failed { bytes: u64, reason: String },
    /// The readable was closed by its owner.
    Cancelled { bytes: u64 },
    /// The consumer dropped its reader.
    ConsumerGone { bytes: u64 },
}

impl PumpOutcome {
    pub fn bytes(&self) -> u64 {
        match self {
            Self::Ended { bytes }
            | Self::Failed { bytes, .. }
            | Self::Cancelled { bytes }
            | Self::ConsumerGone { bytes } => *bytes,
        }
    }

    /// The upstream closed on its own, before anyone asked it to.
    pub fn is_premature(&self) -> bool {
        matches!(self, Self::Ended { .. } | Self::Failed { .. })
    }

    pub fn into_error(self) -> Option<StreamError> {
        self.is_premature().then(|| StreamError::PrematureClose {
            bytes: self.bytes(),
        })
    }
}

static NEXT_READABLE_ID: AtomicU64 = AtomicU64::new(1);

/// Handle on a live byte source. Cheap to clone; only one reader can be taken.
#[derive(Clone)]
pub struct Readable {
    inner: Arc<ReadableInner>,
}

struct ReadableInner {
    id: u64,
    label: String,
    reader: Mutex<Option<BufferReader>>,
    cancel: CancellationToken,
}

impl fmt::Debug for Readable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Readable")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl PartialEq for Readable {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Readable {
    /// Wrap an already-filled reader. Closing it only drops the reader.
    pub fn from_reader(label: impl Into<String>, reader: BufferReader) -> Self {
        Self {
            inner: Arc::new(ReadableInner {
                id: NEXT_READABLE_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                reader: Mutex::new(Some(reader)),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Start draining `body` into a buffer of `capacity` bytes.
    ///
    /// The returned join handle resolves when the pump stops; a premature
    /// upstream close shows up as [`PumpOutcome::Ended`] or
    /// [`PumpOutcome::Failed`].
    pub fn spawn(
        label: impl Into<String>,
        body: AudioBody,
        capacity: usize,
    ) -> (Self, JoinHandle<PumpOutcome>) {
        let (writer, reader) = buffered_pipe(capacity);
        let readable = Self::from_reader(label, reader);
        let cancel = readable.inner.cancel.clone();
        let id = readable.inner.id;
        let handle = tokio::spawn(pump(id, body, writer, cancel));
        (readable, handle)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Take the consumer side. Returns `None` after the first call or once closed.
    pub fn take_reader(&self) -> Option<BufferReader> {
        if self.is_closed() {
            return None;
        }
        self.inner
            .reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    /// Stop the upstream pump and drop any untaken reader.
    pub fn close(&self) {
        if !self.inner.cancel.is_cancelled() {
            trace!(readable = self.inner.id, label = %self.inner.label, "Closing readable");
            self.inner.cancel.cancel();
        }
        self.inner
            .reader
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Resolves once the readable is closed.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }
}

async fn pump(
    id: u64,
    mut body: AudioBody,
    writer: BufferWriter,
    cancel: CancellationToken,
) -> PumpOutcome {
    let mut bytes = 0u64;
    let outcome = loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break PumpOutcome::Cancelled { bytes },
            next = body.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                let len = chunk.len() as u64;
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break PumpOutcome::Cancelled { bytes },
                    written = writer.write(chunk) => {
                        if written.is_err() {
                            break PumpOutcome::ConsumerGone { bytes };
                        }
                    }
                }
                bytes += len;
            }
            Some(Err(err)) => {
                break PumpOutcome::Failed {
                    bytes,
                    reason: err.to_string(),
                }
            }
            None => break PumpOutcome::Ended { bytes },
        }
    };
    debug!(readable = id, ?outcome, "Audio pump stopped");
    outcome
}

/// Holder of the currently published readable of a stream.
///
/// Replacing the readable always closes the previous one before the
/// `readableChange` event goes out.
#[derive(Default)]
pub struct ReadableSlot {
    current: Mutex<Option<Readable>>,
    gate: Mutex<()>,
}

impl fmt::Debug for ReadableSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadableSlot")
            .field("current", &self.get().map(|r| r.id()))
            .finish()
    }
}

impl ReadableSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Readable> {
        self.current
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Swap in `next` and publish the change, unless `still_valid` says the
    /// caller was superseded. Returns whether the swap happened.
    ///
    /// Listeners must not call back into this slot.
    pub fn replace_if(
        &self,
        bus: &EventBus<StreamEvent>,
        next: Option<Readable>,
        still_valid: impl FnOnce() -> bool,
    ) -> bool {
        let _gate = self.gate.lock().unwrap_or_else(|p| p.into_inner());
        if !still_valid() {
            if let Some(next) = next {
                next.close();
            }
            return false;
        }

        let previous = {
            let mut current = self.current.lock().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *current, next.clone())
        };
        if let Some(previous) = previous {
            previous.close();
        }

        if let Err(err) = bus.publish(StreamEvent::ReadableChange(next)) {
            debug!(bus = bus.label(), "readableChange not delivered: {err}");
        }
        true
    }

    /// Unconditional [`replace_if`](Self::replace_if).
    pub fn replace(&self, bus: &EventBus<StreamEvent>, next: Option<Readable>) {
        self.replace_if(bus, next, || true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn body_of(chunks: Vec<&'static [u8]>) -> AudioBody {
        AudioBody::new(stream::iter(
            chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
        ))
    }

    #[tokio::test]
    async fn test_pump_delivers_then_reports_end() {
        let (readable, handle) = Readable::spawn("test", body_of(vec![b"abc", b"de"]), 1024);
        let mut reader = readable.take_reader().unwrap();
        assert!(readable.take_reader().is_none());

        assert_eq!(reader.read().await.unwrap(), Bytes::from_static(b"abc"));
        assert_eq!(reader.read().await.unwrap(), Bytes::from_static(b"de"));
        assert!(reader.read().await.is_none());

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, PumpOutcome::Ended { bytes: 5 });
        assert!(outcome.is_premature());
    }

    #[tokio::test]
    async fn test_close_cancels_pump() {
        let body = AudioBody::new(stream::pending());
        let (readable, handle) = Readable::spawn("test", body, 1024);
        readable.close();
        let outcome = handle.await.unwrap();
        assert_eq!(outcome, PumpOutcome::Cancelled { bytes: 0 });
        assert!(!outcome.is_premature());
        assert!(readable.take_reader().is_none());
    }

    #[tokio::test]
    async fn test_buffer_applies_backpressure() {
        let (writer, mut reader) = buffered_pipe(4);
        writer.write(Bytes::from_static(b"1234")).await.unwrap();

        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            writer.write(Bytes::from_static(b"5")),
        )
        .await;
        assert!(blocked.is_err());

        assert_eq!(reader.read().await.unwrap().len(), 4);
        writer.write(Bytes::from_static(b"5")).await.unwrap();
        assert_eq!(reader.read().await.unwrap(), Bytes::from_static(b"5"));
    }

    #[tokio::test]
    async fn test_dropped_reader_unblocks_writer() {
        let (writer, reader) = buffered_pipe(2);
        writer.write(Bytes::from_static(b"12")).await.unwrap();
        drop(reader);
        assert_eq!(writer.write(Bytes::from_static(b"3")).await, Err(BufferClosed));
    }

    #[tokio::test]
    async fn test_slot_closes_previous_and_publishes() {
        use pmoevents::SubscribeOptions;

        let bus = EventBus::new("slot");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.subscribe(
            crate::StreamEventKind::ReadableChange,
            SubscribeOptions::new(),
            move |d| {
                if let StreamEvent::ReadableChange(r) = d.data() {
                    s.lock().unwrap().push(r.as_ref().map(Readable::id));
                }
            },
        )
        .unwrap();

        let slot = ReadableSlot::new();
        let (first, _h1) = Readable::spawn("a", AudioBody::new(stream::pending()), 16);
        let (second, _h2) = Readable::spawn("b", AudioBody::new(stream::pending()), 16);

        slot.replace(&bus, Some(first.clone()));
        slot.replace(&bus, Some(second.clone()));
        assert!(first.is_closed());
        assert!(!second.is_closed());

        assert!(!slot.replace_if(&bus, None, || false));
        assert_eq!(slot.get(), Some(second.clone()));

        slot.replace(&bus, None);
        assert!(second.is_closed());
        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some(first.id()), Some(second.id()), None]
        );
    }
}
