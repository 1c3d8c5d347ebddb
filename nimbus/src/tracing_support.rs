//! Tracing and logging support.
//!
//! The host logs lifecycle messages through `tracing`: initialisation and
//! watch changes at `debug`, every plugin hook at `trace`, reloads at
//! `info`. This module installs a subscriber for them.

#[cfg(feature = "tracing")]
pub use tracing::{self, debug, error, info, instrument, trace, warn};

#[cfg(feature = "tracing")]
use tracing_subscriber::{
    layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

/// Tracing output format.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable format with colors (default for development).
    Pretty,

    /// Compact format without colors.
    Compact,

    /// JSON format.
    Json,
}

/// Tracing configuration.
#[cfg(feature = "tracing")]
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Log level filter.
    ///
    /// If None, uses RUST_LOG environment variable or defaults to "info".
    pub level: Option<tracing::Level>,

    /// Output format.
    pub format: TracingFormat,

    /// Include timestamps in output.
    pub timestamps: bool,

    /// Include target module names in output.
    pub target: bool,

    /// Include thread IDs in output.
    pub thread_ids: bool,
}

#[cfg(feature = "tracing")]
impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            level: None,
            format: TracingFormat::Pretty,
            timestamps: true,
            target: true,
            thread_ids: false,
        }
    }
}

#[cfg(feature = "tracing")]
impl TracingConfig {
    /// Maps the core plugin's `debug` and `verbose` options to a level.
    ///
    /// `verbose` shows every plugin hook (`TRACE`) and wins over `debug`
    /// (`DEBUG`). With neither set the level comes from `RUST_LOG`.
    pub fn from_flags(debug: bool, verbose: bool) -> Self {
        let level = if verbose {
            Some(tracing::Level::TRACE)
        } else if debug {
            Some(tracing::Level::DEBUG)
        } else {
            None
        };
        Self {
            level,
            format: TracingFormat::Compact,
            target: false,
            ..Default::default()
        }
    }

    fn filter(&self) -> EnvFilter {
        match self.level {
            Some(level) => EnvFilter::new(level.to_string()),
            None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        }
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let fmt = tracing_subscriber::fmt::layer()
            .with_target(self.target)
            .with_thread_ids(self.thread_ids);
        match (self.format, self.timestamps) {
            (TracingFormat::Pretty, true) => fmt.pretty().boxed(),
            (TracingFormat::Pretty, false) => fmt.pretty().without_time().boxed(),
            (TracingFormat::Compact, true) => fmt.compact().boxed(),
            (TracingFormat::Compact, false) => fmt.compact().without_time().boxed(),
            (TracingFormat::Json, true) => fmt.json().boxed(),
            (TracingFormat::Json, false) => fmt.json().without_time().boxed(),
        }
    }
}

/// Initialize tracing subscriber with default settings.
///
/// Uses RUST_LOG environment variable for level filtering.
/// Defaults to "info" level if RUST_LOG is not set.
///
/// # Example
///
/// ```ignore
/// use nimbus::tracing_support::init_subscriber;
///
/// #[tokio::main]
/// async fn main() {
///     init_subscriber();
///
///     // Build and run the worker host
/// }
/// ```
///
/// # Environment Variables
///
/// - `RUST_LOG=debug` - Initialisation and watch changes
/// - `RUST_LOG=trace` - Every plugin hook
/// - `RUST_LOG=nimbus_host=trace` - Per-crate filtering
#[cfg(feature = "tracing")]
pub fn init_subscriber() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(filter)
        .init();
}

/// Initialize tracing subscriber with custom configuration.
///
/// # Example
///
/// ```ignore
/// use nimbus::tracing_support::{init_subscriber_with_config, TracingConfig, TracingFormat};
///
/// let config = TracingConfig {
///     format: TracingFormat::Json,
///     ..TracingConfig::from_flags(true, false)
/// };
/// init_subscriber_with_config(config);
/// ```
#[cfg(feature = "tracing")]
pub fn init_subscriber_with_config(config: TracingConfig) {
    tracing_subscriber::registry()
        .with(config.layer())
        .with(config.filter())
        .init();
}

// Fallback when tracing feature is disabled
#[cfg(not(feature = "tracing"))]
pub fn init_subscriber() {
    // No-op when tracing is disabled
}
