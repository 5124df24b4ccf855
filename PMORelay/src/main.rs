mod sinks;

use anyhow::Result;
use pmoconfig::get_config;
use pmorelay::{init_logging, Relay};
use sinks::{FileSink, LogSurface, Output};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Group used for the single local listener.
const LOCAL_GROUP: &str = "local";

#[tokio::main]
async fn main() -> Result<()> {
    // ========== PHASE 1 : Configuration et logs ==========
    let config = get_config();
    let _logs = init_logging(&config)?;

    let mut args = std::env::args().skip(1);
    let station = args.next().filter(|s| !s.is_empty() && s != "-");
    let output = Output::from_arg(args.next().as_deref());

    // ========== PHASE 2 : Stations ==========
    info!("📻 Building stations...");
    let relay = Relay::from_config(&config)?;
    for station in relay.stations() {
        info!("  - {} ({})", station.info().name, station.key());
    }

    // ========== PHASE 3 : Écoute locale ==========
    info!("🎧 Relaying to {}", output);
    let sink = Arc::new(FileSink::new(output));
    let surface = Arc::new(LogSurface::default());
    if let Err(e) = relay
        .join(LOCAL_GROUP, station.as_deref(), sink, surface)
        .await
    {
        error!("❌ Failed to join station: {}", e);
        if let Err(e) = relay.shutdown().await {
            warn!("⚠️ Shutdown incomplete: {}", e);
        }
        return Err(e.into());
    }

    info!("✅ PMORelay is ready!");
    info!("Press Ctrl+C to stop...");
    tokio::signal::ctrl_c().await?;

    info!("🛑 Stopping...");
    relay.shutdown().await?;
    Ok(())
}
