//! Logging initialisation
//!
//! A `Registry` with a reloadable [`LevelFilter`] first, then an optional
//! `RUST_LOG` filter, then the console layer (on stderr, stdout may carry
//! audio). The level comes from
//! `host.logger.min_level` and can be changed at runtime through the
//! returned [`LogHandle`].

use anyhow::{anyhow, Result};
use pmoconfig::Config;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter,
    Registry,
};

/// Runtime control over the installed subscriber
#[derive(Clone)]
pub struct LogHandle {
    reload_handle: reload::Handle<LevelFilter, Registry>,
    env_override: bool,
}

impl std::fmt::Debug for LogHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogHandle")
            .field("level", &self.level())
            .field("env_override", &self.env_override)
            .finish()
    }
}

impl LogHandle {
    /// Change the minimum level (`ERROR`..`TRACE`, case-insensitive).
    ///
    /// When `RUST_LOG` is set it keeps filtering on top of this level.
    pub fn set_level(&self, level: &str) -> Result<()> {
        let level = string_to_level(level).ok_or_else(|| anyhow!("unknown log level '{}'", level))?;
        self.reload_handle
            .reload(level_to_levelfilter(level))
            .map_err(|e| anyhow!("failed to reload log level: {}", e))?;
        tracing::info!(level = %level, "Log level changed");
        Ok(())
    }

    pub fn level(&self) -> Option<LevelFilter> {
        self.reload_handle.clone_current()
    }

    /// True when `RUST_LOG` drives the filtering.
    pub fn is_env_override(&self) -> bool {
        self.env_override
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_logging(config: &Config) -> Result<LogHandle> {
    let env_filter = std::env::var("RUST_LOG")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(EnvFilter::new);
    let env_override = env_filter.is_some();

    // RUST_LOG wins: the configured level must not hide what it asks for.
    let log_level = if env_override {
        LevelFilter::TRACE
    } else {
        match config.get_log_min_level() {
            Ok(l) => string_to_level(&l)
                .map(level_to_levelfilter)
                .unwrap_or(LevelFilter::INFO),
            Err(_) => LevelFilter::INFO,
        }
    };

    let (filter, reload_handle) = reload::Layer::new(log_level);

    let enable_console = config.get_log_enable_console().unwrap_or(true);
    let console = enable_console.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_level(true)
            .with_ansi(true)
            .with_writer(std::io::stderr)
    });

    Registry::default()
        .with(filter)
        .with(env_filter)
        .with(console)
        .try_init()
        .map_err(|e| anyhow!("failed to install the log subscriber: {}", e))?;

    Ok(LogHandle {
        reload_handle,
        env_override,
    })
}

fn string_to_level(s: &str) -> Option<Level> {
    match s.trim().to_uppercase().as_str() {
        "ERROR" => Some(Level::ERROR),
        "WARN" | "WARNING" => Some(Level::WARN),
        "INFO" => Some(Level::INFO),
        "DEBUG" => Some(Level::DEBUG),
        "TRACE" => Some(Level::TRACE),
        _ => None,
    }
}

fn level_to_levelfilter(level: Level) -> LevelFilter {
    match level {
        Level::ERROR => LevelFilter::ERROR,
        Level::WARN => LevelFilter::WARN,
        Level::INFO => LevelFilter::INFO,
        Level::DEBUG => LevelFilter::DEBUG,
        Level::TRACE => LevelFilter::TRACE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_to_level() {
        assert_eq!(string_to_level("debug"), Some(Level::DEBUG));
        assert_eq!(string_to_level(" Warning "), Some(Level::WARN));
        assert_eq!(string_to_level("loud"), None);
        assert_eq!(level_to_levelfilter(Level::ERROR), LevelFilter::ERROR);
    }

    #[test]
    fn test_init_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_config(dir.path().to_str().unwrap()).unwrap();
        config.set_log_enable_console(false).unwrap();
        config.set_log_min_level("warn".to_string()).unwrap();

        // Only one subscriber per process: this is the only test installing one.
        let handle = init_logging(&config).unwrap();
        if !handle.is_env_override() {
            assert_eq!(handle.level(), Some(LevelFilter::WARN));
        }

        handle.set_level("trace").unwrap();
        assert_eq!(handle.level(), Some(LevelFilter::TRACE));
        assert!(handle.set_level("shout").is_err());

        assert!(init_logging(&config).is_err());
    }
}
