//! Extension pour la configuration du relais dans pmoconfig

use crate::station::{Station, StationKind};
use anyhow::Result;
use pmoconfig::Config;
use pmolistenmoe::ListenMoeConfigExt;
use tracing::warn;

/// Trait d'extension pour la configuration du relais
pub trait RelayConfigExt {
    /// Stations to build at startup, in registry order
    fn get_relay_stations(&self) -> Result<Vec<StationKind>>;

    /// Station used when a join does not name one (default: listen.moe)
    fn get_relay_default_station(&self) -> Result<StationKind>;
    fn set_relay_default_station(&self, kind: StationKind) -> Result<()>;

    /// Build the station of `kind` with the configured stream and player
    fn build_station(&self, kind: StationKind) -> Result<Station>;
}

impl RelayConfigExt for Config {
    fn get_relay_stations(&self) -> Result<Vec<StationKind>> {
        if !self.get_listen_moe_enabled()? {
            return Ok(Vec::new());
        }
        Ok(StationKind::ALL.to_vec())
    }

    fn get_relay_default_station(&self) -> Result<StationKind> {
        let name = self.get_default_station()?;
        match name.parse() {
            Ok(kind) => Ok(kind),
            Err(_) => {
                warn!(station = %name, "Unknown default station, using {}", StationKind::ListenMoe);
                Ok(StationKind::ListenMoe)
            }
        }
    }

    fn set_relay_default_station(&self, kind: StationKind) -> Result<()> {
        self.set_default_station(kind.key().to_string())
    }

    fn build_station(&self, kind: StationKind) -> Result<Station> {
        Station::from_kind(kind, self)
    }
}
