// ============================================================================
// LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging through `tracing`, plus the per-source one-shot logger
// that keeps an unreachable endpoint from flooding the log every tick.
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::level_filters::LevelFilter;
use tracing::{info, trace, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{AgentError, AgentResult};

// ----------------------------------------------------------------------------
// 4.1 Logger Initialization
// ----------------------------------------------------------------------------

fn level_filter(level: &str) -> LevelFilter {
    match level.to_lowercase().as_str() {
        "trace" => LevelFilter::TRACE,
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" | "warning" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "off" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> AgentResult<()> {
    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter(&config.level).into())
        .from_env_lossy();

    let registry = tracing_subscriber::registry().with(env_filter);

    let result = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "pretty" => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
    };
    result.map_err(|e| AgentError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "nginx_telemetry::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 4.2 Source Logger
// ----------------------------------------------------------------------------

/// Logs a source's first failure loudly and every repeat at trace level.
///
/// Each source owns one of these; `reset` re-arms it once the source
/// recovers so the next outage is reported again.
#[derive(Debug)]
pub struct SourceLogger {
    source: &'static str,
    logged: AtomicBool,
}

impl SourceLogger {
    pub const fn new(source: &'static str) -> Self {
        Self {
            source,
            logged: AtomicBool::new(false),
        }
    }

    /// Returns true when the message went out at warn level.
    pub fn log(&self, message: &str) -> bool {
        if self.logged.swap(true, Ordering::AcqRel) {
            trace!(target: "nginx_telemetry::source", source = self.source, "{}", message);
            false
        } else {
            warn!(target: "nginx_telemetry::source", source = self.source, "{}", message);
            true
        }
    }

    pub fn reset(&self) {
        self.logged.store(false, Ordering::Release);
    }
}
