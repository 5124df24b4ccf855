//! Local sink and surface: relayed bytes to a file or stdout, views to the log

use async_trait::async_trait;
use bytes::Bytes;
use pmorelay::{AudioSink, DisplayPayload, Player, RenderSurface, SinkLocation};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Stdout,
    File(PathBuf),
}

impl Output {
    /// `None` and `-` mean stdout.
    pub fn from_arg(arg: Option<&str>) -> Self {
        match arg {
            None | Some("-") | Some("") => Output::Stdout,
            Some(path) => Output::File(PathBuf::from(path)),
        }
    }
}

impl fmt::Display for Output {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Output::Stdout => write!(f, "stdout"),
            Output::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Writes the encoded stream as relayed, with no re-encoding.
///
/// Each subscription appends to the output; a lagging writer skips the
/// chunks it missed.
#[derive(Debug)]
pub struct FileSink {
    output: Output,
    writer: Mutex<Option<CancellationToken>>,
    bytes_written: Arc<AtomicU64>,
}

impl FileSink {
    pub fn new(output: Output) -> Self {
        Self {
            output,
            writer: Mutex::new(None),
            bytes_written: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    fn replace_writer(&self, next: Option<CancellationToken>) {
        let mut guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let previous = std::mem::replace(&mut *guard, next);
        drop(guard);
        if let Some(cancel) = previous {
            cancel.cancel();
        }
    }
}

impl AudioSink for FileSink {
    fn id(&self) -> String {
        match &self.output {
            Output::Stdout => "stdout".to_string(),
            Output::File(path) => format!("file:{}", path.display()),
        }
    }

    fn location(&self) -> SinkLocation {
        match &self.output {
            Output::Stdout => SinkLocation::new("stdout"),
            Output::File(path) => SinkLocation::new(path.display().to_string())
                .with_url(format!("file://{}", path.display())),
        }
    }

    fn subscribe(&self, player: &Player) {
        let cancel = CancellationToken::new();
        let rx = player.subscribe();
        tokio::spawn(write_loop(
            self.output.clone(),
            rx,
            cancel.clone(),
            self.bytes_written.clone(),
        ));
        debug!(sink = %self.output, player = %player.label(), "File sink subscribed");
        self.replace_writer(Some(cancel));
    }

    fn unsubscribe(&self) {
        self.replace_writer(None);
    }

    /// The local listener stays until Ctrl-C.
    fn has_live_members(&self) -> bool {
        true
    }
}

async fn open_output(output: &Output) -> std::io::Result<Box<dyn AsyncWrite + Send + Unpin>> {
    Ok(match output {
        Output::Stdout => Box::new(tokio::io::stdout()),
        Output::File(path) => Box::new(
            tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .await?,
        ),
    })
}

async fn write_loop(
    output: Output,
    mut rx: broadcast::Receiver<Bytes>,
    cancel: CancellationToken,
    counter: Arc<AtomicU64>,
) {
    let mut out = match open_output(&output).await {
        Ok(out) => out,
        Err(e) => {
            warn!(sink = %output, "⚠️ Cannot open output: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = rx.recv() => match received {
                Ok(chunk) => {
                    if let Err(e) = out.write_all(&chunk).await {
                        warn!(sink = %output, "⚠️ Write failed, dropping sink: {}", e);
                        return;
                    }
                    counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(sink = %output, skipped, "Writer lagging, chunks skipped");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    if let Err(e) = out.flush().await {
        debug!(sink = %output, "Flush failed: {}", e);
    }
}

/// Logs each rendered view on one line.
#[derive(Debug, Default)]
pub struct LogSurface {
    presented: AtomicU64,
}

#[async_trait]
impl RenderSurface for LogSurface {
    async fn present(&self, payload: &DisplayPayload) -> anyhow::Result<()> {
        self.presented.fetch_add(1, Ordering::Relaxed);
        let details: Vec<String> = payload
            .fields
            .iter()
            .map(|f| format!("{} {}", f.name.trim(), f.value.trim()))
            .filter(|s| !s.is_empty())
            .collect();
        info!(
            title = %payload.title,
            description = payload.description.as_deref().unwrap_or(""),
            "🎶 {}",
            details.join(" | ")
        );
        Ok(())
    }

    async fn release(&self) -> anyhow::Result<()> {
        info!(views = self.presented.load(Ordering::Relaxed), "Display released");
        Ok(())
    }
}
