// ============================================================================
// METRIC CATALOG
// ============================================================================
// Every metric name a source emits, next to the way it is combined across
// collection ticks. Exact names are looked up first; dynamically named
// families (slab slots) fall through to an ordered list of regex rules.
// ============================================================================

use ahash::AHashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// 5.1 Calculation Kinds
// ----------------------------------------------------------------------------

/// How accumulated samples of one metric are turned into a report value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationKind {
    /// Counters: the running sum is reported as is
    Sum,
    /// Gauges: running sum divided by the number of reports
    Avg,
    /// Flags: majority vote over the reports
    Boolean,
}

impl CalculationKind {
    pub fn apply(self, value: f64, count: usize) -> f64 {
        match self {
            CalculationKind::Sum => value,
            CalculationKind::Avg => average(value, count),
            CalculationKind::Boolean => {
                if average(value, count) > 0.5 {
                    1.0
                } else {
                    0.0
                }
            }
        }
    }
}

fn average(value: f64, count: usize) -> f64 {
    if count > 0 {
        value / count as f64
    } else {
        value
    }
}

// ----------------------------------------------------------------------------
// 5.2 Descriptor Table
// ----------------------------------------------------------------------------

use CalculationKind::{Avg, Boolean, Sum};

/// Metric name and its calculation kind.
pub type MetricDescriptor = (&'static str, CalculationKind);

pub static SYSTEM_METRICS: &[MetricDescriptor] = &[
    ("system.cpu.idle", Avg),
    ("system.cpu.iowait", Avg),
    ("system.cpu.stolen", Avg),
    ("system.cpu.system", Avg),
    ("system.cpu.user", Avg),
    ("system.disk.free", Avg),
    ("system.disk.in_use", Avg),
    ("system.disk.total", Avg),
    ("system.disk.used", Avg),
    ("system.io.iops_r", Sum),
    ("system.io.iops_w", Sum),
    ("system.io.kbs_r", Sum),
    ("system.io.kbs_w", Sum),
    ("system.io.wait_r", Sum),
    ("system.io.wait_w", Sum),
    ("system.mem.available", Avg),
    ("system.mem.buffered", Avg),
    ("system.mem.cached", Avg),
    ("system.mem.free", Avg),
    ("system.mem.pct_used", Avg),
    ("system.mem.shared", Avg),
    ("system.mem.total", Avg),
    ("system.mem.used", Avg),
    ("system.mem.used.all", Avg),
    ("system.load.1", Avg),
    ("system.load.5", Avg),
    ("system.load.15", Avg),
    ("system.swap.free", Avg),
    ("system.swap.pct_free", Avg),
    ("system.swap.total", Avg),
    ("system.swap.used", Avg),
    ("system.net.bytes_rcvd", Sum),
    ("system.net.bytes_sent", Sum),
    ("system.net.drops_in.count", Sum),
    ("system.net.drops_out.count", Sum),
    ("system.net.listen_overflows", Sum),
    ("system.net.packets_in.count", Sum),
    ("system.net.packets_in.error", Sum),
    ("system.net.packets_out.count", Sum),
    ("system.net.packets_out.error", Sum),
];

pub static NGINX_METRICS: &[MetricDescriptor] = &[
    ("nginx.status", Boolean),
    ("nginx.config.generation", Sum),
    // stub status and Plus connection counters
    ("nginx.http.conn.accepted", Sum),
    ("nginx.http.conn.active", Avg),
    ("nginx.http.conn.current", Avg),
    ("nginx.http.conn.dropped", Sum),
    ("nginx.http.conn.handled", Sum),
    ("nginx.http.conn.idle", Avg),
    ("nginx.http.conn.reading", Avg),
    ("nginx.http.conn.writing", Avg),
    ("nginx.http.request.count", Sum),
    ("nginx.http.request.current", Avg),
    // access log
    ("nginx.http.gzip.ratio", Avg),
    ("nginx.http.method.delete", Sum),
    ("nginx.http.method.get", Sum),
    ("nginx.http.method.head", Sum),
    ("nginx.http.method.options", Sum),
    ("nginx.http.method.others", Sum),
    ("nginx.http.method.post", Sum),
    ("nginx.http.method.put", Sum),
    ("nginx.http.request.body_bytes_sent", Sum),
    ("nginx.http.request.bytes_sent", Sum),
    ("nginx.http.request.length", Avg),
    ("nginx.http.request.malformed", Sum),
    ("nginx.http.request.time", Avg),
    ("nginx.http.request.time.count", Sum),
    ("nginx.http.request.time.max", Avg),
    ("nginx.http.request.time.median", Avg),
    ("nginx.http.request.time.pctl95", Avg),
    ("nginx.http.status.1xx", Sum),
    ("nginx.http.status.2xx", Sum),
    ("nginx.http.status.3xx", Sum),
    ("nginx.http.status.4xx", Sum),
    ("nginx.http.status.5xx", Sum),
    ("nginx.http.status.403", Sum),
    ("nginx.http.status.404", Sum),
    ("nginx.http.status.500", Sum),
    ("nginx.http.status.502", Sum),
    ("nginx.http.status.503", Sum),
    ("nginx.http.status.504", Sum),
    ("nginx.http.status.discarded", Sum),
    ("nginx.http.v0_9", Sum),
    ("nginx.http.v1_0", Sum),
    ("nginx.http.v1_1", Sum),
    ("nginx.http.v2", Sum),
    ("nginx.http.v3", Sum),
    ("nginx.upstream.connect.time", Avg),
    ("nginx.upstream.connect.time.count", Sum),
    ("nginx.upstream.connect.time.max", Avg),
    ("nginx.upstream.connect.time.median", Avg),
    ("nginx.upstream.connect.time.pctl95", Avg),
    ("nginx.upstream.header.time", Avg),
    ("nginx.upstream.header.time.count", Sum),
    ("nginx.upstream.header.time.max", Avg),
    ("nginx.upstream.header.time.median", Avg),
    ("nginx.upstream.header.time.pctl95", Avg),
    ("nginx.upstream.response.length", Avg),
    ("nginx.upstream.response.time", Avg),
    ("nginx.upstream.response.time.count", Sum),
    ("nginx.upstream.response.time.max", Avg),
    ("nginx.upstream.response.time.median", Avg),
    ("nginx.upstream.response.time.pctl95", Avg),
    ("nginx.upstream.status.1xx", Sum),
    ("nginx.upstream.status.2xx", Sum),
    ("nginx.upstream.status.3xx", Sum),
    ("nginx.upstream.status.4xx", Sum),
    ("nginx.upstream.status.5xx", Sum),
    ("nginx.cache.bypass", Sum),
    ("nginx.cache.expired", Sum),
    ("nginx.cache.hit", Sum),
    ("nginx.cache.miss", Sum),
    ("nginx.cache.revalidated", Sum),
    ("nginx.cache.stale", Sum),
    ("nginx.cache.updating", Sum),
    // error log
    ("nginx.http.request.buffered", Sum),
    ("nginx.upstream.request.failed", Sum),
    ("nginx.upstream.response.buffered", Sum),
    ("nginx.upstream.response.failed", Sum),
    // workers
    ("nginx.workers.count", Avg),
    ("nginx.workers.cpu.system", Sum),
    ("nginx.workers.cpu.total", Sum),
    ("nginx.workers.cpu.user", Sum),
    ("nginx.workers.fds_count", Avg),
    ("nginx.workers.io.kbs_r", Sum),
    ("nginx.workers.io.kbs_w", Sum),
    // per-tick gauges: averaged, not summed, so the window value does not
    // scale with the number of ticks
    ("nginx.workers.mem.rss", Avg),
    ("nginx.workers.mem.rss_pct", Avg),
    ("nginx.workers.mem.vms", Avg),
    ("nginx.workers.rlimit_nofile", Avg),
];

pub static PLUS_METRICS: &[MetricDescriptor] = &[
    ("plus.instance.count", Avg),
    ("plus.ssl.failed", Sum),
    ("plus.ssl.handshakes", Sum),
    ("plus.ssl.reuses", Sum),
    // server and location zones
    ("plus.http.request.bytes_rcvd", Sum),
    ("plus.http.request.bytes_sent", Sum),
    ("plus.http.request.count", Sum),
    ("plus.http.response.count", Sum),
    ("plus.http.status.1xx", Sum),
    ("plus.http.status.2xx", Sum),
    ("plus.http.status.3xx", Sum),
    ("plus.http.status.4xx", Sum),
    ("plus.http.status.5xx", Sum),
    ("plus.http.status.discarded", Sum),
    ("plus.http.status.processing", Avg),
    ("plus.stream.bytes_rcvd", Sum),
    ("plus.stream.bytes_sent", Sum),
    ("plus.stream.connections", Sum),
    ("plus.stream.discarded", Sum),
    ("plus.stream.processing", Avg),
    ("plus.stream.status.2xx", Sum),
    ("plus.stream.status.4xx", Sum),
    ("plus.stream.status.5xx", Sum),
    ("plus.stream.status.total", Sum),
    // caches
    ("plus.cache.bypass.bytes", Sum),
    ("plus.cache.bypass.responses", Sum),
    ("plus.cache.expired.bytes", Sum),
    ("plus.cache.expired.responses", Sum),
    ("plus.cache.hit.bytes", Sum),
    ("plus.cache.hit.responses", Sum),
    ("plus.cache.max_size", Avg),
    ("plus.cache.miss.bytes", Sum),
    ("plus.cache.miss.responses", Sum),
    ("plus.cache.revalidated.bytes", Sum),
    ("plus.cache.revalidated.responses", Sum),
    ("plus.cache.size", Avg),
    ("plus.cache.stale.bytes", Sum),
    ("plus.cache.stale.responses", Sum),
    ("plus.cache.updating.bytes", Sum),
    ("plus.cache.updating.responses", Sum),
    // http upstreams
    ("plus.http.upstream.keepalives", Avg),
    ("plus.http.upstream.zombies", Avg),
    ("plus.http.upstream.queue.maxsize", Avg),
    ("plus.http.upstream.queue.overflows", Sum),
    ("plus.http.upstream.queue.size", Avg),
    ("plus.http.upstream.peers.bytes_rcvd", Sum),
    ("plus.http.upstream.peers.bytes_sent", Sum),
    ("plus.http.upstream.peers.conn.active", Avg),
    ("plus.http.upstream.peers.fails", Sum),
    ("plus.http.upstream.peers.header_time", Avg),
    ("plus.http.upstream.peers.header_time.count", Sum),
    ("plus.http.upstream.peers.header_time.max", Avg),
    ("plus.http.upstream.peers.header_time.median", Avg),
    ("plus.http.upstream.peers.header_time.pctl95", Avg),
    ("plus.http.upstream.peers.health_checks.checks", Sum),
    ("plus.http.upstream.peers.health_checks.fails", Sum),
    ("plus.http.upstream.peers.health_checks.unhealthy", Sum),
    ("plus.http.upstream.peers.request.count", Sum),
    ("plus.http.upstream.peers.response.count", Sum),
    ("plus.http.upstream.peers.response.time", Avg),
    ("plus.http.upstream.peers.response.time.count", Sum),
    ("plus.http.upstream.peers.response.time.max", Avg),
    ("plus.http.upstream.peers.response.time.median", Avg),
    ("plus.http.upstream.peers.response.time.pctl95", Avg),
    ("plus.http.upstream.peers.state.checking", Avg),
    ("plus.http.upstream.peers.state.down", Avg),
    ("plus.http.upstream.peers.state.draining", Avg),
    ("plus.http.upstream.peers.state.unavail", Avg),
    ("plus.http.upstream.peers.state.unhealthy", Avg),
    ("plus.http.upstream.peers.state.up", Avg),
    ("plus.http.upstream.peers.status.1xx", Sum),
    ("plus.http.upstream.peers.status.2xx", Sum),
    ("plus.http.upstream.peers.status.3xx", Sum),
    ("plus.http.upstream.peers.status.4xx", Sum),
    ("plus.http.upstream.peers.status.5xx", Sum),
    ("plus.http.upstream.peers.total.checking", Avg),
    ("plus.http.upstream.peers.total.down", Avg),
    ("plus.http.upstream.peers.total.draining", Avg),
    ("plus.http.upstream.peers.total.unavail", Avg),
    ("plus.http.upstream.peers.total.unhealthy", Avg),
    ("plus.http.upstream.peers.total.up", Avg),
    ("plus.http.upstream.peers.unavail", Sum),
    // stream upstreams
    ("plus.stream.upstream.zombies", Avg),
    ("plus.stream.upstream.peers.bytes_rcvd", Sum),
    ("plus.stream.upstream.peers.bytes_sent", Sum),
    ("plus.stream.upstream.peers.conn.active", Avg),
    ("plus.stream.upstream.peers.conn.count", Sum),
    ("plus.stream.upstream.peers.connect_time", Avg),
    ("plus.stream.upstream.peers.connect_time.count", Sum),
    ("plus.stream.upstream.peers.connect_time.max", Avg),
    ("plus.stream.upstream.peers.connect_time.median", Avg),
    ("plus.stream.upstream.peers.connect_time.pctl95", Avg),
    ("plus.stream.upstream.peers.fails", Sum),
    ("plus.stream.upstream.peers.health_checks.checks", Sum),
    ("plus.stream.upstream.peers.health_checks.fails", Sum),
    ("plus.stream.upstream.peers.health_checks.unhealthy", Sum),
    ("plus.stream.upstream.peers.response.time", Avg),
    ("plus.stream.upstream.peers.response.time.count", Sum),
    ("plus.stream.upstream.peers.response.time.max", Avg),
    ("plus.stream.upstream.peers.response.time.median", Avg),
    ("plus.stream.upstream.peers.response.time.pctl95", Avg),
    ("plus.stream.upstream.peers.state.checking", Avg),
    ("plus.stream.upstream.peers.state.down", Avg),
    ("plus.stream.upstream.peers.state.draining", Avg),
    ("plus.stream.upstream.peers.state.unavail", Avg),
    ("plus.stream.upstream.peers.state.unhealthy", Avg),
    ("plus.stream.upstream.peers.state.up", Avg),
    ("plus.stream.upstream.peers.total.checking", Avg),
    ("plus.stream.upstream.peers.total.down", Avg),
    ("plus.stream.upstream.peers.total.draining", Avg),
    ("plus.stream.upstream.peers.total.unavail", Avg),
    ("plus.stream.upstream.peers.total.unhealthy", Avg),
    ("plus.stream.upstream.peers.total.up", Avg),
    ("plus.stream.upstream.peers.ttfb", Avg),
    ("plus.stream.upstream.peers.unavail", Sum),
    // slabs and limits
    ("plus.slab.pages.free", Avg),
    ("plus.slab.pages.pct_used", Avg),
    ("plus.slab.pages.total", Avg),
    ("plus.slab.pages.used", Avg),
    ("plus.http.limit_conns.passed", Sum),
    ("plus.http.limit_conns.rejected", Sum),
    ("plus.http.limit_conns.rejected_dry_run", Sum),
    ("plus.http.limit_reqs.delayed", Sum),
    ("plus.http.limit_reqs.delayed_dry_run", Sum),
    ("plus.http.limit_reqs.passed", Sum),
    ("plus.http.limit_reqs.rejected", Sum),
    ("plus.http.limit_reqs.rejected_dry_run", Sum),
];

pub static CONTAINER_METRICS: &[MetricDescriptor] = &[
    ("container.cpu.cores", Avg),
    ("container.cpu.period", Avg),
    ("container.cpu.quota", Avg),
    ("container.cpu.set.cores", Avg),
    ("container.cpu.shares", Avg),
    ("container.cpu.throttling.percent", Avg),
    ("container.cpu.throttling.periods", Avg),
    ("container.cpu.throttling.throttled", Avg),
    ("container.cpu.throttling.time", Avg),
    ("container.mem.oom", Avg),
    ("container.mem.oom.kill", Avg),
];

/// Rules for dynamically named metrics, consulted in order after an exact miss.
static PATTERN_RULES: &[(&str, CalculationKind)] = &[
    (r"^plus\.slab\.slots\.\d+\.fails$", Sum),
    (r"^plus\.slab\.slots\.\d+\.free$", Avg),
    (r"^plus\.slab\.slots\.\d+\.reqs$", Sum),
    (r"^plus\.slab\.slots\.\d+\.used$", Avg),
];

// ----------------------------------------------------------------------------
// 5.3 Lookup
// ----------------------------------------------------------------------------

static EXACT: Lazy<AHashMap<&'static str, CalculationKind>> = Lazy::new(|| {
    SYSTEM_METRICS
        .iter()
        .chain(NGINX_METRICS)
        .chain(PLUS_METRICS)
        .chain(CONTAINER_METRICS)
        .copied()
        .collect()
});

static PATTERNS: Lazy<Vec<(Regex, CalculationKind)>> = Lazy::new(|| {
    PATTERN_RULES
        .iter()
        .filter_map(|(pattern, kind)| Regex::new(pattern).ok().map(|re| (re, *kind)))
        .collect()
});

/// Calculation kind for a metric name, if it is known.
pub fn lookup(name: &str) -> Option<CalculationKind> {
    if let Some(kind) = EXACT.get(name) {
        return Some(*kind);
    }
    PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(name))
        .map(|(_, kind)| *kind)
}

/// Number of exactly named metrics in the catalog.
pub fn len() -> usize {
    EXACT.len()
}
