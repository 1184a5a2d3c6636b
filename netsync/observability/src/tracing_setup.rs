//! Subscriber setup for netsync binaries.
//!
//! Libraries only emit through `tracing`; a binary calls [`init_tracing`]
//! once. Reconciliation paths log under their module targets
//! (`netsync_core::flow`, `netsync_core::group`, `netsync_core::intent`,
//! `netsync_core::batch`), so per-subsystem verbosity is a matter of adding
//! a directive.

use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

#[derive(Debug, Clone)]
pub struct TracingConfig {
    pub service_name: String,
    /// Level for every target not named in `directives`.
    pub log_level: Level,
    /// Extra `target=level` directives, e.g. `netsync_core::flow=trace`.
    pub directives: Vec<String>,
    pub json_output: bool,
    /// Log span open/close, useful to time device and intent operations.
    pub span_events: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "netsync".to_string(),
            log_level: Level::INFO,
            directives: Vec::new(),
            json_output: false,
            span_events: false,
        }
    }
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.log_level = level;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json_output = json;
        self
    }

    pub fn with_span_events(mut self, include: bool) -> Self {
        self.span_events = include;
        self
    }

    /// `RUST_LOG` replaces the configured filter entirely when set.
    /// Malformed directives are skipped.
    pub fn filter(&self) -> EnvFilter {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(LevelFilter::from_level(self.log_level).into())
                .parse_lossy(self.directives.join(","))
        })
    }
}

/// Installs the global subscriber.
///
/// Returns `false` if one was already installed; the existing subscriber
/// is kept.
///
/// ```no_run
/// use observability::{init_tracing, TracingConfig};
/// use tracing::Level;
///
/// init_tracing(
///     TracingConfig::new("netsyncd")
///         .with_level(Level::INFO)
///         .with_directive("netsync_core::flow=debug"),
/// );
/// ```
pub fn init_tracing(config: TracingConfig) -> bool {
    let span_events = if config.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let output: Box<dyn Layer<Registry> + Send + Sync> = if config.json_output {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_events(span_events)
            .boxed()
    } else {
        fmt::layer().with_span_events(span_events).boxed()
    };

    let installed = tracing_subscriber::registry()
        .with(output)
        .with(config.filter())
        .try_init()
        .is_ok();
    if installed {
        tracing::info!(service = %config.service_name, level = %config.log_level, "Tracing initialized");
    }
    installed
}

/// Span for reconciliation work on one device.
#[macro_export]
macro_rules! device_span {
    ($op:expr, $device_id:expr) => {
        tracing::debug_span!("device_operation", operation = $op, device_id = %$device_id)
    };
}

/// Span for one step of an intent's lifecycle.
#[macro_export]
macro_rules! intent_span {
    ($op:expr, $intent_id:expr) => {
        tracing::info_span!("intent_operation", operation = $op, intent_id = %$intent_id)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TracingConfig::default();
        assert_eq!(config.service_name, "netsync");
        assert_eq!(config.log_level, Level::INFO);
        assert!(config.directives.is_empty());
        assert!(!config.json_output);
    }

    #[test]
    fn test_builder_collects_directives() {
        let config = TracingConfig::new("netsyncd")
            .with_level(Level::WARN)
            .with_directive("netsync_core::flow=debug")
            .with_directive("netsync_core::intent=trace")
            .with_json(true)
            .with_span_events(true);

        assert_eq!(config.log_level, Level::WARN);
        assert_eq!(config.directives.len(), 2);
        assert!(config.json_output);
        assert!(config.span_events);
    }

    #[test]
    fn test_filter_includes_directives() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let filter = TracingConfig::default()
            .with_directive("netsync_core::flow=debug")
            .filter()
            .to_string();
        assert!(filter.contains("netsync_core::flow=debug"));
    }

    #[test]
    fn test_second_init_is_rejected() {
        init_tracing(TracingConfig::default());
        assert!(!init_tracing(TracingConfig::default()));
    }
}
