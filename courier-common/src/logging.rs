//! Subscriber setup and the engine's logging macros
//!
//! Engine events go through [`internal!`](crate::internal), channel traffic
//! through [`outgoing!`](crate::outgoing). Both wrap the event in a span named
//! after its kind so the compact formatter prefixes every line with it.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{Subscriber, metadata::LevelFilter};
use tracing_subscriber::{
    Layer,
    filter::FilterFn,
    fmt::{MakeWriter, time::ChronoUtc},
    prelude::__tracing_subscriber_SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Environment variable that overrides [`LoggingConfig::level`]
pub const LEVEL_ENV: &str = "LOG_LEVEL";

#[macro_export]
macro_rules! log {
    ($level:expr, $span:expr, $($msg:expr),*) => {{
        let span = $crate::tracing::span!($level, $span);
        let _enter = span.enter();

        $crate::tracing::event!($level, $($msg),*)
    }};
}

/// Log a message about the engine itself (queue lifecycle, worker state, ...)
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "internal", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::internal!(level = TRACE, $($msg),*)
    };
}

/// Log a message about traffic leaving through a channel
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:expr),*) => {
        $crate::log!($crate::tracing::Level::$level, "outgoing", $($msg),*)
    };

    ($($msg:expr),*) => {
        $crate::outgoing!(level = TRACE, $($msg),*)
    };
}

const fn default_ansi() -> bool {
    true
}

fn default_targets() -> Vec<String> {
    vec!["courier".to_string()]
}

/// The `logging` section of the service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Maximum level shown, e.g. `"info"`
    ///
    /// Default: TRACE in debug builds, INFO otherwise
    #[serde(default)]
    pub level: Option<String>,

    #[serde(default = "default_ansi")]
    pub ansi: bool,

    /// Target prefixes whose events are shown
    ///
    /// Default: `["courier"]`
    #[serde(default = "default_targets")]
    pub targets: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: None,
            ansi: default_ansi(),
            targets: default_targets(),
        }
    }
}

impl LoggingConfig {
    /// Resolve the level filter, preferring `env` (the value of [`LEVEL_ENV`])
    ///
    /// Values that do not parse are reported on stderr and skipped.
    pub fn level_filter(&self, env: Option<&str>) -> LevelFilter {
        let default = if cfg!(debug_assertions) {
            LevelFilter::TRACE
        } else {
            LevelFilter::INFO
        };

        [env, self.level.as_deref()]
            .into_iter()
            .flatten()
            .find_map(|level| {
                LevelFilter::from_str(level)
                    .inspect_err(|_| {
                        eprintln!("Invalid log level specified {level}, ignoring it");
                    })
                    .ok()
            })
            .unwrap_or(default)
    }

    fn shows(&self, target: &str) -> bool {
        self.targets
            .iter()
            .any(|prefix| target.starts_with(prefix.as_str()))
    }
}

/// The compact formatter used by [`init`], writing to `writer`
pub fn subscriber<W>(
    config: &LoggingConfig,
    level: LevelFilter,
    writer: W,
) -> impl Subscriber + Send + Sync + 'static
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    let config = config.clone();

    tracing_subscriber::Registry::default().with(
        tracing_subscriber::fmt::layer()
            .with_writer(writer)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_ansi(config.ansi)
            .with_timer(ChronoUtc::rfc_3339())
            .with_filter(level)
            .with_filter(FilterFn::new(move |metadata| config.shows(metadata.target()))),
    )
}

/// Install the global subscriber, logging to stdout
///
/// Fails if a global subscriber is already set.
pub fn init(config: &LoggingConfig) -> Result<(), TryInitError> {
    let level = config.level_filter(std::env::var(LEVEL_ENV).ok().as_deref());
    subscriber(config, level, std::io::stdout).try_init()
}
