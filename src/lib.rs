// ============================================================================
// NGINX TELEMETRY AGENT
// ============================================================================
// Collects NGINX (OSS and Plus), container and host metrics, turns counters
// into restart-safe deltas, tails access and error logs into windowed
// statistics, and aggregates everything into periodic reports.
//
// Layout:
//   model      - dimensions, metrics, stats entities and reports
//   delta      - monotonic counter deltas
//   stats      - windowed distribution statistics
//   catalog    - metric name to calculation kind
//   aggregate  - cross-cycle accumulate / finalize
//   sources    - one unit of collection each
//   collector  - per-subject fan-out / fan-in
//   export     - report sinks
//   agent      - the shared tick loop
// ============================================================================

use std::time::Duration;

pub mod aggregate;
pub mod agent;
pub mod catalog;
pub mod collector;
pub mod config;
pub mod delta;
pub mod error;
pub mod export;
pub mod logging;
pub mod model;
pub mod sources;
pub mod stats;

// ----------------------------------------------------------------------------
// Constants & Version Information
// ----------------------------------------------------------------------------

/// Agent version - follows semantic versioning
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const AGENT_NAME: &str = "nginx-telemetry";

/// Bound on every nginx stub status / Plus API request
pub const API_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of a collector's per-tick fan-in queue
pub const FAN_IN_CAPACITY: usize = 65535;

pub use agent::{Agent, AgentStats};
pub use collector::{Collector, CollectorStats, HostCollector, NginxCollector};
pub use config::{AgentConfig, ConfigManager, NginxCollectorConfig};
pub use error::{AgentError, AgentResult, ConfigError, ExportError, SourceError, SourceResult};
pub use export::{sink_from_config, JsonLinesSink, LogSink, ReportSink};
pub use model::{CommonDim, Dimension, MetricPoint, MetricsReport, SimpleMetric, StatsEntity};
pub use sources::{Source, SourceContext};
