//! In-memory transport and audio fakes for the state-machine tests

use crate::error::{Error, Result};
use crate::gateway::{ControlConnection, ControlPeer, ControlTransport};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream::{self, StreamExt};
use pmostream::{AudioBody, AudioSource, StreamError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug)]
pub struct FakeTransport {
    peers: mpsc::UnboundedSender<ControlPeer>,
    connects: AtomicUsize,
    fail_next: AtomicBool,
    hang_next: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ControlPeer>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                peers: tx,
                connects: AtomicUsize::new(0),
                fail_next: AtomicBool::new(false),
                hang_next: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    /// Next connect never completes.
    pub fn hang_next(&self) {
        self.hang_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ControlTransport for FakeTransport {
    async fn connect(&self) -> Result<ControlConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(Error::Timeout(self.target()));
        }
        if self.hang_next.swap(false, Ordering::SeqCst) {
            futures::future::pending::<()>().await;
        }
        let (conn, peer) = ControlConnection::pair();
        let _ = self.peers.send(peer);
        Ok(conn)
    }

    fn target(&self) -> String {
        "fake://gateway".to_string()
    }
}

/// What one audio fetch does.
#[derive(Debug, Clone)]
pub enum Script {
    /// Delivers the chunks then closes.
    Finite(Vec<&'static [u8]>),
    /// Delivers one chunk then stays open.
    Endless,
    /// Fetch fails.
    Fail,
}

#[derive(Debug)]
pub struct FakeAudio {
    scripts: Mutex<VecDeque<Script>>,
    opens: Mutex<Vec<Instant>>,
}

impl FakeAudio {
    /// Scripts are consumed in order; once exhausted every fetch is endless.
    pub fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            opens: Mutex::new(Vec::new()),
        })
    }

    pub fn opens(&self) -> usize {
        self.opens.lock().unwrap().len()
    }

    pub fn open_times(&self) -> Vec<Instant> {
        self.opens.lock().unwrap().clone()
    }
}

#[async_trait]
impl AudioSource for FakeAudio {
    async fn open(&self) -> pmostream::Result<AudioBody> {
        self.opens.lock().unwrap().push(Instant::now());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Endless);

        match script {
            Script::Finite(chunks) => Ok(AudioBody::new(stream::iter(
                chunks.into_iter().map(|c| Ok(Bytes::from_static(c))),
            ))),
            Script::Endless => Ok(AudioBody::new(
                stream::once(async { Ok(Bytes::from_static(b"audio")) }).chain(stream::pending()),
            )),
            Script::Fail => Err(StreamError::connect(self.describe(), "connection refused")),
        }
    }

    fn describe(&self) -> String {
        "fake://audio".to_string()
    }
}

pub fn song_json(id: i64) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "title": format!("Song {}", id),
        "sources": [],
        "artists": [{ "id": 10, "name": "Artist", "nameRomaji": null, "image": null }],
        "albums": [],
        "characters": [],
        "duration": 200
    })
}

/// An op 1 frame announcing song `id` starting at `start`.
pub fn playback_frame(id: i64, start: DateTime<Utc>) -> String {
    serde_json::json!({
        "op": 1,
        "t": "TRACK_UPDATE",
        "d": {
            "listeners": 100,
            "requester": null,
            "event": null,
            "startTime": start.to_rfc3339_opts(SecondsFormat::Millis, true),
            "song": song_json(id),
            "lastPlayed": []
        }
    })
    .to_string()
}
