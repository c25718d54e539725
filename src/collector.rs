// ============================================================================
// COLLECTORS
// ============================================================================
// A collector owns the sources for one subject (the host, the container or
// one nginx instance). Each tick fans out to every source on its own task,
// fans the results back in through one bounded queue, and tags everything
// with the collector's common dimensions before forwarding it.
//
// The dimension snapshot lives in an ArcSwap owned by the collector. Sources
// only ever see the immutable snapshot for the tick they run in.
// ============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, GeneralConfig, NginxCollectorConfig};
use crate::logging::SourceLogger;
use crate::model::{CommonDim, StatsEntity};
use crate::sources::access_log::NginxAccessLog;
use crate::sources::cgroup::container_sources;
use crate::sources::error_log::NginxErrorLog;
use crate::sources::nginx_oss::{NginxOss, NginxStatic};
use crate::sources::plus::NginxPlus;
use crate::sources::process::{NginxProcess, NginxWorker, ProcfsInspector};
use crate::sources::system::system_sources;
use crate::sources::{Source, SourceContext};
use crate::FAN_IN_CAPACITY;

// ----------------------------------------------------------------------------
// 15.1 Collector Trait
// ----------------------------------------------------------------------------

/// One subject's collection loop, driven by the agent's tick.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique name, used in logs and stats.
    fn name(&self) -> &str;

    /// Run one tick and forward the tagged entities to `out`. Returns how
    /// many entities were forwarded.
    async fn collect(&self, cancel: &CancellationToken, out: &flume::Sender<StatsEntity>) -> usize;

    /// Rebuild the common dimensions (and anything else derived from the
    /// agent configuration) for every future tick.
    async fn update_config(&self, config: &AgentConfig);

    /// Stop every source's background work.
    async fn stop(&self);

    fn stats(&self) -> CollectorStats;
}

// ----------------------------------------------------------------------------
// 15.2 Collector Statistics
// ----------------------------------------------------------------------------

/// Statistics for a collector.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectorStats {
    /// Entities forwarded downstream
    pub entities_collected: u64,
    /// Ticks completed
    pub collection_cycles: u64,
    /// Source failures and panics
    pub errors: u64,
    /// Ticks cut short by the deadline
    pub timeouts: u64,
    pub avg_collection_us: u64,
    pub max_collection_us: u64,
    pub min_collection_us: u64,
}

/// Tracks collector statistics with atomic operations.
#[derive(Debug)]
pub struct CollectorStatsTracker {
    entities_collected: AtomicU64,
    collection_cycles: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
    total_duration_us: AtomicU64,
    max_duration_us: AtomicU64,
    min_duration_us: AtomicU64,
}

impl Default for CollectorStatsTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectorStatsTracker {
    pub fn new() -> Self {
        Self {
            entities_collected: AtomicU64::new(0),
            collection_cycles: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            max_duration_us: AtomicU64::new(0),
            min_duration_us: AtomicU64::new(u64::MAX),
        }
    }

    pub fn record_entities(&self, count: u64) {
        self.entities_collected.fetch_add(count, AtomicOrdering::Relaxed);
    }

    pub fn record_cycle(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.collection_cycles.fetch_add(1, AtomicOrdering::Relaxed);
        self.total_duration_us.fetch_add(us, AtomicOrdering::Relaxed);

        let mut max = self.max_duration_us.load(AtomicOrdering::Relaxed);
        while us > max {
            match self.max_duration_us.compare_exchange_weak(
                max,
                us,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(m) => max = m,
            }
        }

        let mut min = self.min_duration_us.load(AtomicOrdering::Relaxed);
        while us < min {
            match self.min_duration_us.compare_exchange_weak(
                min,
                us,
                AtomicOrdering::Relaxed,
                AtomicOrdering::Relaxed,
            ) {
                Ok(_) => break,
                Err(m) => min = m,
            }
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub fn snapshot(&self) -> CollectorStats {
        let cycles = self.collection_cycles.load(AtomicOrdering::Relaxed);
        let total_us = self.total_duration_us.load(AtomicOrdering::Relaxed);
        let min = self.min_duration_us.load(AtomicOrdering::Relaxed);

        CollectorStats {
            entities_collected: self.entities_collected.load(AtomicOrdering::Relaxed),
            collection_cycles: cycles,
            errors: self.errors.load(AtomicOrdering::Relaxed),
            timeouts: self.timeouts.load(AtomicOrdering::Relaxed),
            avg_collection_us: if cycles > 0 { total_us / cycles } else { 0 },
            max_collection_us: self.max_duration_us.load(AtomicOrdering::Relaxed),
            min_collection_us: if min == u64::MAX { 0 } else { min },
        }
    }
}

// ----------------------------------------------------------------------------
// 15.3 Source Set (fan-out / fan-in)
// ----------------------------------------------------------------------------

/// The sources one collector runs every tick.
pub struct SourceSet {
    sources: Vec<Arc<dyn Source>>,
}

impl SourceSet {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self { sources }
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.sources.iter().map(|s| s.name()).collect()
    }

    /// Run every source once, concurrently, and return what they queued,
    /// tagged with `dims`.
    ///
    /// The tick is bounded by `deadline`: sources still running when it
    /// passes (or when `cancel` fires) are cancelled and aborted, and only
    /// what already reached the queue is kept.
    pub async fn collect(
        &self,
        collector: &str,
        dims: Arc<CommonDim>,
        deadline: Duration,
        cancel: &CancellationToken,
        stats: &CollectorStatsTracker,
    ) -> Vec<StatsEntity> {
        let tick = cancel.child_token();
        let (tx, rx) = flume::bounded(FAN_IN_CAPACITY);

        let mut tasks = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            let ctx = SourceContext::new(Arc::clone(&dims), tick.clone(), tx.clone());
            tasks.spawn(async move {
                let result = source.collect(&ctx).await;
                (source.name(), result)
            });
        }
        drop(tx);

        let timer = tokio::time::sleep(deadline);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                joined = tasks.join_next() => match joined {
                    None => break,
                    Some(Ok((_, Ok(())))) => {}
                    Some(Ok((source, Err(e)))) => {
                        stats.record_error();
                        debug!(
                            target: "nginx_telemetry::collector",
                            collector,
                            source,
                            error = %e,
                            hint = ?e.recovery_hint(),
                            "Source collection failed"
                        );
                    }
                    Some(Err(e)) => {
                        stats.record_error();
                        warn!(target: "nginx_telemetry::collector", collector, error = %e, "Source task panicked");
                    }
                },
                _ = &mut timer => {
                    stats.record_timeout();
                    warn!(
                        target: "nginx_telemetry::collector",
                        collector,
                        pending = tasks.len(),
                        deadline = ?deadline,
                        "Collection tick timed out, dropping slow sources"
                    );
                    break;
                }
                _ = cancel.cancelled() => break,
            }
        }
        tick.cancel();
        tasks.abort_all();

        rx.drain().map(|entity| entity.tagged(&dims)).collect()
    }

    /// Stop every source.
    pub async fn stop(&self) {
        for source in &self.sources {
            source.stop().await;
        }
    }

    pub async fn update(&self, config: &NginxCollectorConfig) {
        for source in &self.sources {
            source.update(config).await;
        }
    }
}

/// Forward entities downstream, giving up once `cancel` fires.
async fn forward(
    entities: Vec<StatsEntity>,
    cancel: &CancellationToken,
    out: &flume::Sender<StatsEntity>,
) -> usize {
    let mut sent = 0;
    for entity in entities {
        let delivered = tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            result = out.send_async(entity) => result.is_ok(),
        };
        if !delivered {
            break;
        }
        sent += 1;
    }
    sent
}

// ----------------------------------------------------------------------------
// 15.4 Host Collectors (system & container)
// ----------------------------------------------------------------------------

/// Collector for host-level subjects: the system itself or the container
/// the agent runs in.
pub struct HostCollector {
    name: String,
    sources: SourceSet,
    dims: ArcSwap<CommonDim>,
    interval_ms: AtomicU64,
    stats: CollectorStatsTracker,
}

impl HostCollector {
    pub fn new(name: impl Into<String>, sources: Vec<Arc<dyn Source>>, general: &GeneralConfig) -> Self {
        Self {
            name: name.into(),
            sources: SourceSet::new(sources),
            dims: ArcSwap::from_pointee(CommonDim::from_agent(general)),
            interval_ms: AtomicU64::new(general.collection_interval.as_millis() as u64),
            stats: CollectorStatsTracker::new(),
        }
    }

    /// CPU, memory, swap, load, disk, disk io and network sources.
    pub fn system(config: &AgentConfig) -> Self {
        Self::new("system", system_sources(&config.system.proc_root), &config.agent)
    }

    /// cgroup CPU and memory sources.
    pub fn container(config: &AgentConfig) -> Self {
        Self::new(
            "container",
            container_sources(&config.container.cgroup_root, &config.system.proc_root),
            &config.agent,
        )
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(AtomicOrdering::Relaxed))
    }
}

#[async_trait]
impl Collector for HostCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, cancel: &CancellationToken, out: &flume::Sender<StatsEntity>) -> usize {
        let start = Instant::now();
        let entities = self
            .sources
            .collect(&self.name, self.dims.load_full(), self.interval(), cancel, &self.stats)
            .await;
        let sent = forward(entities, cancel, out).await;
        self.stats.record_entities(sent as u64);
        self.stats.record_cycle(start.elapsed());
        sent
    }

    async fn update_config(&self, config: &AgentConfig) {
        self.dims.store(Arc::new(CommonDim::from_agent(&config.agent)));
        self.interval_ms
            .store(config.agent.collection_interval.as_millis() as u64, AtomicOrdering::Relaxed);
        debug!(target: "nginx_telemetry::collector", collector = %self.name, "Updated common dimensions");
    }

    async fn stop(&self) {
        self.sources.stop().await;
    }

    fn stats(&self) -> CollectorStats {
        self.stats.snapshot()
    }
}

// ----------------------------------------------------------------------------
// 15.5 NGINX Collector
// ----------------------------------------------------------------------------

/// Collector for one nginx instance.
pub struct NginxCollector {
    id: String,
    name: String,
    general: Mutex<GeneralConfig>,
    proc_root: Mutex<PathBuf>,
    config: Mutex<NginxCollectorConfig>,
    dims: ArcSwap<CommonDim>,
    /// Held for reading through a whole tick; rebuilds take it for writing
    sources: RwLock<SourceSet>,
    static_warning: SourceLogger,
    stats: CollectorStatsTracker,
}

impl NginxCollector {
    pub fn new(agent: &AgentConfig, config: NginxCollectorConfig) -> Self {
        let static_warning = SourceLogger::new("nginx_static");
        let sources = build_sources(&config, &agent.system.proc_root, &static_warning);
        info!(
            target: "nginx_telemetry::collector",
            nginx_id = %config.nginx_id,
            sources = ?sources.names(),
            "Created nginx collector"
        );
        Self {
            id: config.nginx_id.clone(),
            name: format!("nginx:{}", config.nginx_id),
            general: Mutex::new(agent.agent.clone()),
            proc_root: Mutex::new(agent.system.proc_root.clone()),
            dims: ArcSwap::from_pointee(CommonDim::for_nginx(&agent.agent, &config)),
            config: Mutex::new(config),
            sources: RwLock::new(sources),
            static_warning,
            stats: CollectorStatsTracker::new(),
        }
    }

    /// The nginx id this collector is bound to.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> NginxCollectorConfig {
        self.config.lock().clone()
    }

    pub async fn source_names(&self) -> Vec<&'static str> {
        self.sources.read().await.names()
    }

    /// Apply a new per-instance configuration. A change in how the instance
    /// is reached (stub status, Plus API endpoint or version) stops and
    /// rebuilds every source; anything else is handed to the sources.
    pub async fn update_collector_config(&self, config: NginxCollectorConfig) {
        let previous = self.config();
        if previous == config {
            return;
        }

        let mut sources = self.sources.write().await;
        if previous.shape_changed(&config) {
            info!(
                target: "nginx_telemetry::collector",
                nginx_id = %self.id,
                "Collection method changed, rebuilding sources"
            );
            sources.stop().await;
            let proc_root = self.proc_root.lock().clone();
            *sources = build_sources(&config, &proc_root, &self.static_warning);
        } else {
            sources.update(&config).await;
        }

        let general = self.general.lock().clone();
        self.dims.store(Arc::new(CommonDim::for_nginx(&general, &config)));
        *self.config.lock() = config;
    }
}

/// Sources for one instance: process and worker sources, exactly one of
/// Plus / stub status / static, then the log sources.
fn build_sources(
    config: &NginxCollectorConfig,
    proc_root: &std::path::Path,
    static_warning: &SourceLogger,
) -> SourceSet {
    let mut sources: Vec<Arc<dyn Source>> = vec![
        Arc::new(NginxProcess::new(config)),
        Arc::new(NginxWorker::new(Arc::new(ProcfsInspector::new(proc_root)), config)),
    ];

    let status: Arc<dyn Source> = if !config.plus_api.is_empty() {
        match NginxPlus::from_config(config) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                warn!(target: "nginx_telemetry::collector", nginx_id = %config.nginx_id, error = %e, "Unable to create Plus source");
                Arc::new(NginxStatic::new(config))
            }
        }
    } else if !config.stub_status.is_empty() {
        match NginxOss::from_config(config) {
            Ok(source) => Arc::new(source),
            Err(e) => {
                warn!(target: "nginx_telemetry::collector", nginx_id = %config.nginx_id, error = %e, "Unable to create stub status source");
                Arc::new(NginxStatic::new(config))
            }
        }
    } else {
        static_warning.log(&format!(
            "nginx {} has neither stub_status nor plus_api configured, reporting it as down",
            config.nginx_id
        ));
        Arc::new(NginxStatic::new(config))
    };
    sources.push(status);

    sources.push(Arc::new(NginxAccessLog::new(config)));
    sources.push(Arc::new(NginxErrorLog::new(config)));
    SourceSet::new(sources)
}

#[async_trait]
impl Collector for NginxCollector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn collect(&self, cancel: &CancellationToken, out: &flume::Sender<StatsEntity>) -> usize {
        let start = Instant::now();
        let deadline = self.config.lock().collection_interval;
        let entities = {
            let sources = self.sources.read().await;
            sources
                .collect(&self.name, self.dims.load_full(), deadline, cancel, &self.stats)
                .await
        };
        let sent = forward(entities, cancel, out).await;
        self.stats.record_entities(sent as u64);
        self.stats.record_cycle(start.elapsed());
        sent
    }

    async fn update_config(&self, config: &AgentConfig) {
        *self.general.lock() = config.agent.clone();
        *self.proc_root.lock() = config.system.proc_root.clone();

        match config
            .collector_configs()
            .into_iter()
            .find(|c| c.nginx_id == self.id)
        {
            Some(instance) => self.update_collector_config(instance).await,
            None => {
                let current = self.config();
                self.dims
                    .store(Arc::new(CommonDim::for_nginx(&config.agent, &current)));
            }
        }
    }

    async fn stop(&self) {
        self.sources.read().await.stop().await;
    }

    fn stats(&self) -> CollectorStats {
        self.stats.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SourceError, SourceResult};
    use crate::model::{DimOverrides, SimpleMetric};
    use pretty_assertions::assert_eq;

    struct Fixed(&'static str, f64);

    #[async_trait]
    impl Source for Fixed {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
            ctx.send(StatsEntity::new(Vec::new(), vec![SimpleMetric::new(self.0, self.1)]))
                .await;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Source for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn collect(&self, _ctx: &SourceContext) -> SourceResult<()> {
            Err(SourceError::unreachable("http://127.0.0.1:1/api", "connection refused"))
        }
    }

    struct Stuck;

    #[async_trait]
    impl Source for Stuck {
        fn name(&self) -> &'static str {
            "stuck"
        }

        async fn collect(&self, _ctx: &SourceContext) -> SourceResult<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    fn general() -> GeneralConfig {
        GeneralConfig {
            system_id: "sys-1".into(),
            hostname: "web-01".into(),
            tags: vec!["prod".into(), "eu".into()],
            collection_interval: Duration::from_secs(1),
            ..GeneralConfig::default()
        }
    }

    async fn run(collector: &dyn Collector) -> Vec<StatsEntity> {
        let (tx, rx) = flume::unbounded();
        collector.collect(&CancellationToken::new(), &tx).await;
        rx.drain().collect()
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_siblings() {
        let sources: Vec<Arc<dyn Source>> = vec![
            Arc::new(Failing),
            Arc::new(Fixed("system.cpu.idle", 97.0)),
            Arc::new(Fixed("system.mem.used", 1024.0)),
        ];
        let collector = HostCollector::new("system", sources, &general());

        let mut names: Vec<String> = run(&collector)
            .await
            .into_iter()
            .flat_map(|e| e.metrics.into_iter().map(|m| m.name))
            .collect();
        names.sort();
        assert_eq!(names, vec!["system.cpu.idle", "system.mem.used"]);

        let stats = collector.stats();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.collection_cycles, 1);
        assert_eq!(stats.entities_collected, 2);
    }

    #[tokio::test]
    async fn test_entities_are_tagged_with_common_dims() {
        let collector = HostCollector::new("system", vec![Arc::new(Fixed("system.cpu.idle", 1.0))], &general());
        let entities = run(&collector).await;
        assert_eq!(entities.len(), 1);

        let names: Vec<&str> = entities[0].dimensions.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["system_id", "hostname", "instance_tags", "instance_group", "display_name"]
        );
        assert_eq!(entities[0].dimension("instance_tags"), Some("prod,eu"));

        let mut changed = AgentConfig::default();
        changed.agent = GeneralConfig {
            hostname: "web-02".into(),
            ..general()
        };
        collector.update_config(&changed).await;
        let entities = run(&collector).await;
        assert_eq!(entities[0].dimension("hostname"), Some("web-02"));
    }

    #[tokio::test]
    async fn test_overrides_apply_to_nginx_dims() {
        struct Overridden;

        #[async_trait]
        impl Source for Overridden {
            fn name(&self) -> &'static str {
                "overridden"
            }

            async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
                let entity = StatsEntity::new(Vec::new(), vec![SimpleMetric::new("nginx.status", 1.0)])
                    .with_overrides(DimOverrides::default().published_api("http://127.0.0.1/api").nginx_type("plus"));
                ctx.send(entity).await;
                Ok(())
            }
        }

        let dims = Arc::new(CommonDim {
            nginx_id: "main".into(),
            ..CommonDim::from_agent(&general())
        });
        let set = SourceSet::new(vec![Arc::new(Overridden)]);
        let entities = set
            .collect("nginx:main", dims, Duration::from_secs(1), &CancellationToken::new(), &CollectorStatsTracker::new())
            .await;
        assert_eq!(entities[0].dimension("system.published_api"), Some("http://127.0.0.1/api"));
        assert_eq!(entities[0].dimension("nginx.type"), Some("plus"));
        assert!(entities[0].overrides.is_empty());
    }

    #[tokio::test]
    async fn test_slow_source_is_dropped_at_deadline() {
        let sources: Vec<Arc<dyn Source>> = vec![Arc::new(Stuck), Arc::new(Fixed("system.load.1", 0.5))];
        let set = SourceSet::new(sources);
        let stats = CollectorStatsTracker::new();

        let start = Instant::now();
        let entities = set
            .collect(
                "system",
                Arc::new(CommonDim::default()),
                Duration::from_millis(100),
                &CancellationToken::new(),
                &stats,
            )
            .await;
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(entities.len(), 1);
        assert_eq!(entities[0].metric("system.load.1"), Some(0.5));
        assert_eq!(stats.snapshot().timeouts, 1);
    }

    #[tokio::test]
    async fn test_cancelled_tick_returns_promptly() {
        let set = SourceSet::new(vec![Arc::new(Stuck)]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let entities = set
            .collect(
                "system",
                Arc::new(CommonDim::default()),
                Duration::from_secs(3600),
                &cancel,
                &CollectorStatsTracker::new(),
            )
            .await;
        assert!(entities.is_empty());
    }

    #[test]
    fn test_stats_tracker_min_max() {
        let tracker = CollectorStatsTracker::new();
        assert_eq!(tracker.snapshot().min_collection_us, 0);

        tracker.record_cycle(Duration::from_micros(300));
        tracker.record_cycle(Duration::from_micros(100));
        let stats = tracker.snapshot();
        assert_eq!(stats.min_collection_us, 100);
        assert_eq!(stats.max_collection_us, 300);
        assert_eq!(stats.avg_collection_us, 200);
    }

    fn nginx_config(stub_status: &str, plus_api: &str) -> NginxCollectorConfig {
        NginxCollectorConfig {
            nginx_id: "main".into(),
            stub_status: stub_status.into(),
            plus_api: plus_api.into(),
            client_version: 6,
            pid: Some(1),
            collection_interval: Duration::from_secs(1),
            ..NginxCollectorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_nginx_prefers_plus_api() {
        let collector = NginxCollector::new(
            &AgentConfig::default(),
            nginx_config("http://127.0.0.1:1/nginx_status", "http://127.0.0.1:1/api"),
        );
        let names = collector.source_names().await;
        assert!(names.contains(&"nginx_plus"));
        assert!(!names.contains(&"nginx_oss"));
        assert_eq!(
            names,
            vec!["nginx_process", "nginx_worker", "nginx_plus", "nginx_access_log", "nginx_error_log"]
        );
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_nginx_without_endpoints_reports_down() {
        let collector = NginxCollector::new(&AgentConfig::default(), nginx_config("", ""));
        assert!(collector.source_names().await.contains(&"nginx_static"));

        let entities = run(&collector).await;
        let status: Vec<f64> = entities.iter().filter_map(|e| e.metric("nginx.status")).collect();
        assert!(status.contains(&0.0));
        assert!(entities.iter().all(|e| e.dimension("nginx_id") == Some("main")));
        collector.stop().await;
    }

    #[tokio::test]
    async fn test_nginx_rebuilds_on_shape_change() {
        let collector = NginxCollector::new(
            &AgentConfig::default(),
            nginx_config("http://127.0.0.1:1/nginx_status", ""),
        );
        assert!(collector.source_names().await.contains(&"nginx_oss"));

        collector
            .update_collector_config(nginx_config("http://127.0.0.1:1/nginx_status", "http://127.0.0.1:1/api"))
            .await;
        let names = collector.source_names().await;
        assert!(names.contains(&"nginx_plus"));
        assert!(!names.contains(&"nginx_oss"));

        let mut error_logs = nginx_config("http://127.0.0.1:1/nginx_status", "http://127.0.0.1:1/api");
        error_logs.error_logs = vec!["/var/log/nginx/error.log".into()];
        collector.update_collector_config(error_logs.clone()).await;
        assert!(collector.source_names().await.contains(&"nginx_plus"));
        assert_eq!(collector.config(), error_logs);
        collector.stop().await;
    }
}
