//! Control socket transport
//!
//! [`ControlTransport`] opens a [`ControlConnection`]: a pair of text-frame
//! channels plus a close handle. [`GatewayTransport`] backs it with a
//! websocket; tests build connections in memory with
//! [`ControlConnection::pair`].

use crate::client::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use pmostream::StreamError;
use std::fmt::Debug;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Opens control connections to a station.
#[async_trait]
pub trait ControlTransport: Send + Sync + Debug {
    async fn connect(&self) -> Result<ControlConnection>;

    /// Endpoint, for logs and connect errors.
    fn target(&self) -> String;
}

/// Write side of a control connection.
#[derive(Debug, Clone)]
pub struct ControlSender {
    tx: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl ControlSender {
    /// Queue a text frame. Fails with a state error once the socket is closed.
    pub fn send(&self, frame: String) -> pmostream::Result<()> {
        if self.closed.is_cancelled() {
            return Err(StreamError::state("control socket is not open"));
        }
        self.tx
            .send(frame)
            .map_err(|_| StreamError::state("control socket is not open"))
    }

    pub fn is_open(&self) -> bool {
        !self.closed.is_cancelled() && !self.tx.is_closed()
    }
}

/// An open control socket.
///
/// Inbound frames arrive through [`recv`](Self::recv), which yields `None`
/// once the socket is closed by either side.
#[derive(Debug)]
pub struct ControlConnection {
    sender: ControlSender,
    incoming: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
}

impl ControlConnection {
    pub fn new(
        outgoing: mpsc::UnboundedSender<String>,
        incoming: mpsc::UnboundedReceiver<String>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            sender: ControlSender {
                tx: outgoing,
                closed: closed.clone(),
            },
            incoming,
            closed,
        }
    }

    /// In-memory connection and the remote end driving it.
    pub fn pair() -> (Self, ControlPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        (
            Self::new(out_tx, in_rx, closed.clone()),
            ControlPeer {
                to_local: Some(in_tx),
                from_local: out_rx,
                closed,
            },
        )
    }

    pub fn sender(&self) -> ControlSender {
        self.sender.clone()
    }

    /// Next inbound frame. Frames that arrived before the close are still
    /// delivered.
    pub async fn recv(&mut self) -> Option<String> {
        if let Ok(frame) = self.incoming.try_recv() {
            return Some(frame);
        }
        if self.closed.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            frame = self.incoming.recv() => frame,
            _ = self.closed.cancelled() => self.incoming.try_recv().ok(),
        }
    }

    /// Handle that closes the socket when cancelled.
    pub fn close_handle(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn close(&self) {
        self.closed.cancel();
    }
}

/// Remote end of an in-memory [`ControlConnection`].
#[derive(Debug)]
pub struct ControlPeer {
    to_local: Option<mpsc::UnboundedSender<String>>,
    from_local: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
}

impl ControlPeer {
    /// Deliver a frame to the local side. Returns false once it is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.to_local
            .as_ref()
            .is_some_and(|tx| tx.send(frame.into()).is_ok())
    }

    /// Next frame sent by the local side, `None` once it closed.
    pub async fn next_sent(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            frame = self.from_local.recv() => frame,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Frame already sent by the local side, without waiting.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.from_local.try_recv().ok()
    }

    /// Simulate the remote closing the socket.
    pub fn hang_up(&mut self) {
        self.to_local = None;
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Websocket control transport.
#[derive(Debug, Clone)]
pub struct GatewayTransport {
    url: String,
    user_agent: String,
    connect_timeout: Duration,
}

impl GatewayTransport {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

#[async_trait]
impl ControlTransport for GatewayTransport {
    async fn connect(&self) -> Result<ControlConnection> {
        let mut request = self.url.as_str().into_client_request()?;
        if let Ok(value) = HeaderValue::from_str(&self.user_agent) {
            request.headers_mut().insert(header::USER_AGENT, value);
        }

        debug!(url = %self.url, "Connecting to gateway");
        let (socket, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| Error::Timeout(self.url.clone()))??;
        debug!(url = %self.url, "Gateway connected");

        let (mut write, mut read) = socket.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let closed = CancellationToken::new();

        let writer_closed = closed.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    frame = out_rx.recv() => {
                        let Some(frame) = frame else { break };
                        trace!(url = %url, frame = %frame, "Gateway send");
                        if let Err(e) = write.send(Message::text(frame)).await {
                            warn!(url = %url, "Gateway send failed: {}", e);
                            writer_closed.cancel();
                            break;
                        }
                    }
                }
            }
            let _ = write.close().await;
        });

        let reader_closed = closed.clone();
        let url = self.url.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    msg = read.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(text) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Err(_) => warn!(url = %url, "Dropping non UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(frame))) => {
                        debug!(url = %url, ?frame, "Gateway closed by remote");
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(url = %url, "Gateway read error: {}", e);
                        break;
                    }
                    None => break,
                }
            }
            reader_closed.cancel();
        });

        Ok(ControlConnection::new(out_tx, in_rx, closed))
    }

    fn target(&self) -> String {
        self.url.clone()
    }
}
