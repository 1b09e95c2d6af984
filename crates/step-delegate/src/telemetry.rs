//! Centralised tracing initialisation for processes embedding the delegate.
//!
//! Build a [`TelemetryConfig`] (usually [`TelemetryConfig::from_env`]) and
//! call [`TelemetryConfig::init`] once at program start. Later calls are
//! ignored: the global subscriber can only be set once per process.

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Env var selecting the output format (`json` or anything else for text).
pub const LOG_FORMAT_ENV: &str = "STEP_DELEGATE_LOG_FORMAT";

/// Env var selecting the default level when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "STEP_DELEGATE_LOG_LEVEL";

/// Logging configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TelemetryConfig {
    /// Emit newline-delimited JSON instead of human-readable lines
    pub json: bool,
    /// Default verbosity when `RUST_LOG` is not set
    pub level: Level,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            json: false,
            level: Level::INFO,
        }
    }
}

impl TelemetryConfig {
    /// Read [`LOG_FORMAT_ENV`] and [`LOG_LEVEL_ENV`]; unset or unknown values
    /// keep the defaults.
    pub fn from_env() -> Self {
        Self::from_values(
            std::env::var(LOG_FORMAT_ENV).ok().as_deref(),
            std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        )
    }

    fn from_values(format: Option<&str>, level: Option<&str>) -> Self {
        let defaults = TelemetryConfig::default();
        TelemetryConfig {
            json: format
                .map(|f| f.trim().eq_ignore_ascii_case("json"))
                .unwrap_or(defaults.json),
            level: level
                .and_then(|l| l.trim().parse::<Level>().ok())
                .unwrap_or(defaults.level),
        }
    }

    /// Install the global subscriber; see [`init_tracing`].
    pub fn init(&self) -> bool {
        init_tracing(self)
    }
}

/// Install the global subscriber for `config`: an `EnvFilter` that honours
/// `RUST_LOG` (falling back to `config.level`) and a text or JSON formatter.
///
/// Returns `false` when a subscriber was already installed, in which case
/// nothing changes.
pub fn init_tracing(config: &TelemetryConfig) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_str()));
    let json_layer = config
        .json
        .then(|| fmt::layer().with_target(false).json());
    let text_layer = (!config.json).then(|| fmt::layer().with_target(false));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .try_init()
        .is_ok()
}
