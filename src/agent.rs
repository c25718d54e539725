// ============================================================================
// AGENT
// ============================================================================
// Owns the collectors and drives them from one shared tick. Every tick runs
// all collectors concurrently and gathers their entities into one report.
// In aggregated mode the reports of a report interval are folded together
// and finalized once; in streaming mode each report is finalized on its own.
// Finalized reports are pushed to the configured sink.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::aggregate::{finalize, Collections};
use crate::collector::{Collector, CollectorStats, HostCollector, NginxCollector};
use crate::config::{AgentConfig, ConfigManager, GeneralConfig, ReportMode};
use crate::error::AgentResult;
use crate::export::ReportSink;
use crate::model::{MetricsReport, StatsEntity};
use crate::VERSION;

const SYSTEM_COLLECTOR: &str = "system";
const CONTAINER_COLLECTOR: &str = "container";

// ----------------------------------------------------------------------------
// 17.1 Schedule
// ----------------------------------------------------------------------------

struct Schedule {
    collect: Interval,
    report: Interval,
    reload: Interval,
    settings: (Duration, Duration, Duration),
}

impl Schedule {
    fn new(general: &GeneralConfig) -> Self {
        let now = tokio::time::Instant::now();
        let mut collect = tokio::time::interval(general.collection_interval);
        let mut report = tokio::time::interval_at(now + general.report_interval, general.report_interval);
        let mut reload = tokio::time::interval_at(now + general.reload_interval, general.reload_interval);
        for interval in [&mut collect, &mut report, &mut reload] {
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        }
        Self {
            collect,
            report,
            reload,
            settings: Self::settings(general),
        }
    }

    fn settings(general: &GeneralConfig) -> (Duration, Duration, Duration) {
        (general.collection_interval, general.report_interval, general.reload_interval)
    }

    fn is_current(&self, general: &GeneralConfig) -> bool {
        self.settings == Self::settings(general)
    }
}

// ----------------------------------------------------------------------------
// 17.2 Agent State
// ----------------------------------------------------------------------------

#[derive(Default)]
struct CollectorSet {
    /// Host-level collectors by name
    host: BTreeMap<String, Arc<dyn Collector>>,
    /// nginx collectors by instance id
    nginx: BTreeMap<String, Arc<NginxCollector>>,
}

impl CollectorSet {
    fn all(&self) -> Vec<Arc<dyn Collector>> {
        self.host
            .values()
            .cloned()
            .chain(self.nginx.values().map(|c| Arc::clone(c) as Arc<dyn Collector>))
            .collect()
    }
}

/// Agent statistics
#[derive(Debug, Clone)]
pub struct AgentStats {
    pub uptime: Duration,
    pub is_running: bool,
    pub ticks: u64,
    pub reports: u64,
    pub push_errors: u64,
    pub collectors: Vec<(String, CollectorStats)>,
}

/// The telemetry agent
pub struct Agent {
    config: Arc<ConfigManager>,
    sink: Arc<dyn ReportSink>,
    collectors: RwLock<CollectorSet>,
    /// Ticks of the current report window
    collections: Mutex<Collections>,
    config_dirty: Arc<AtomicBool>,
    shutdown: CancellationToken,
    running: AtomicBool,
    start_time: Instant,
    ticks: AtomicU64,
    reports: AtomicU64,
    push_errors: AtomicU64,
}

impl Agent {
    /// Create an agent and its collectors. Must be called inside a tokio
    /// runtime; log sources start their tailers right away.
    pub fn new(config: Arc<ConfigManager>, sink: Arc<dyn ReportSink>) -> Self {
        let config_dirty = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&config_dirty);
        config.on_reload(move |_| flag.store(true, AtomicOrdering::Release));

        let current = config.get();
        let mut collectors = CollectorSet::default();
        if current.system.enabled {
            collectors
                .host
                .insert(SYSTEM_COLLECTOR.into(), Arc::new(HostCollector::system(&current)));
        }
        if current.container.enabled {
            collectors
                .host
                .insert(CONTAINER_COLLECTOR.into(), Arc::new(HostCollector::container(&current)));
        }
        for instance in current.collector_configs() {
            collectors
                .nginx
                .insert(instance.nginx_id.clone(), Arc::new(NginxCollector::new(&current, instance)));
        }

        Self {
            config,
            sink,
            collectors: RwLock::new(collectors),
            collections: Mutex::new(Collections::new()),
            config_dirty,
            shutdown: CancellationToken::new(),
            running: AtomicBool::new(false),
            start_time: Instant::now(),
            ticks: AtomicU64::new(0),
            reports: AtomicU64::new(0),
            push_errors: AtomicU64::new(0),
        }
    }

    /// Add a host-level collector, replacing any with the same name.
    pub async fn register(&self, collector: Arc<dyn Collector>) {
        let name = collector.name().to_string();
        if let Some(old) = self.collectors.write().await.host.insert(name, collector) {
            old.stop().await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(AtomicOrdering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signal shutdown
    pub fn shutdown(&self) {
        info!(target: "nginx_telemetry::agent", "Shutdown signal received");
        self.shutdown.cancel();
    }

    pub async fn nginx_ids(&self) -> Vec<String> {
        self.collectors.read().await.nginx.keys().cloned().collect()
    }

    pub async fn collector_names(&self) -> Vec<String> {
        self.collectors
            .read()
            .await
            .all()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    // ------------------------------------------------------------------------
    // 17.3 Collection
    // ------------------------------------------------------------------------

    /// Run every collector once and gather the tick into one report.
    ///
    /// Never fails: a collector that panics contributes nothing, and a tick
    /// interrupted by shutdown yields an empty report.
    pub async fn collect_once(&self) -> MetricsReport {
        self.gather().await.unwrap_or_default()
    }

    async fn gather(&self) -> Option<MetricsReport> {
        let collectors = self.collectors.read().await.all();
        let (tx, rx) = flume::unbounded::<StatsEntity>();

        let mut tasks = JoinSet::new();
        for collector in collectors {
            let tx = tx.clone();
            let cancel = self.shutdown.clone();
            tasks.spawn(async move {
                let sent = collector.collect(&cancel, &tx).await;
                trace!(target: "nginx_telemetry::agent", collector = collector.name(), sent, "Collector finished");
            });
        }
        drop(tx);

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(target: "nginx_telemetry::agent", error = %e, "Collector task failed");
            }
        }

        if self.shutdown.is_cancelled() {
            return None;
        }
        self.ticks.fetch_add(1, AtomicOrdering::Relaxed);
        Some(MetricsReport::new(rx.drain().collect()))
    }

    /// One tick: collect, then accumulate or push depending on the mode.
    async fn tick(&self, mode: ReportMode) {
        let Some(report) = self.gather().await else {
            return;
        };
        debug!(
            target: "nginx_telemetry::agent",
            entities = report.entities.len(),
            metrics = report.metric_count(),
            "Collection tick"
        );

        match mode {
            ReportMode::Aggregated => self.collections.lock().accumulate(&report),
            ReportMode::Streaming => {
                let mut single = Collections::new();
                single.accumulate(&report);
                self.push(&single).await;
            }
        }
    }

    /// Finalize and push the current report window, if it saw any ticks.
    pub async fn flush_report(&self) {
        let window = std::mem::take(&mut *self.collections.lock());
        if window.is_empty() {
            return;
        }
        self.push(&window).await;
    }

    async fn push(&self, window: &Collections) {
        let policy = self.config.get().aggregation.unknown_metric_policy;
        let report = finalize(window, policy);
        self.reports.fetch_add(1, AtomicOrdering::Relaxed);

        if let Err(e) = self.sink.push(&report).await {
            self.push_errors.fetch_add(1, AtomicOrdering::Relaxed);
            warn!(target: "nginx_telemetry::agent", sink = self.sink.name(), error = %e, "Failed to push report");
        }
    }

    // ------------------------------------------------------------------------
    // 17.4 Configuration
    // ------------------------------------------------------------------------

    /// Bring the collector set in line with the current configuration:
    /// host collectors follow their enabled flags, nginx collectors are
    /// matched by instance id, and every surviving collector is updated.
    pub async fn apply_config(&self) {
        let config = self.config.get();
        let mut collectors = self.collectors.write().await;

        toggle_host(&mut collectors, SYSTEM_COLLECTOR, config.system.enabled, || {
            Arc::new(HostCollector::system(&config)) as Arc<dyn Collector>
        })
        .await;
        toggle_host(&mut collectors, CONTAINER_COLLECTOR, config.container.enabled, || {
            Arc::new(HostCollector::container(&config)) as Arc<dyn Collector>
        })
        .await;

        let wanted: BTreeMap<String, _> = config
            .collector_configs()
            .into_iter()
            .map(|c| (c.nginx_id.clone(), c))
            .collect();

        let removed: Vec<String> = collectors
            .nginx
            .keys()
            .filter(|id| !wanted.contains_key(*id))
            .cloned()
            .collect();
        for id in removed {
            if let Some(collector) = collectors.nginx.remove(&id) {
                info!(target: "nginx_telemetry::agent", nginx_id = %id, "Removing nginx collector");
                collector.stop().await;
            }
        }

        for collector in collectors.host.values() {
            collector.update_config(&config).await;
        }
        for (id, instance) in wanted {
            match collectors.nginx.get(&id) {
                Some(collector) => collector.update_config(&config).await,
                None => {
                    info!(target: "nginx_telemetry::agent", nginx_id = %id, "Adding nginx collector");
                    collectors
                        .nginx
                        .insert(id, Arc::new(NginxCollector::new(&config, instance)));
                }
            }
        }
    }

    fn check_reload(&self) -> bool {
        if let Err(e) = self.config.check_and_reload() {
            warn!(target: "nginx_telemetry::agent", error = %e, "Configuration reload failed, keeping current");
        }
        self.config_dirty.swap(false, AtomicOrdering::AcqRel)
    }

    // ------------------------------------------------------------------------
    // 17.5 Main Loop
    // ------------------------------------------------------------------------

    /// Run until `shutdown` is called. The open report window is flushed
    /// and every collector stopped on the way out.
    pub async fn run(&self) -> AgentResult<()> {
        info!(target: "nginx_telemetry::agent", version = VERSION, "Starting telemetry agent");
        self.running.store(true, AtomicOrdering::Release);

        let config = self.config.get();
        let collectors = self.collector_names().await;
        info!(
            target: "nginx_telemetry::agent",
            hostname = %config.agent.hostname,
            collection_interval = ?config.agent.collection_interval,
            report_interval = ?config.agent.report_interval,
            mode = ?config.agent.mode,
            collectors = ?collectors,
            "Agent configuration loaded"
        );
        let mut mode = config.agent.mode;
        let mut schedule = Schedule::new(&config.agent);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = schedule.collect.tick() => self.tick(mode).await,
                _ = schedule.report.tick(), if mode == ReportMode::Aggregated => self.flush_report().await,
                _ = schedule.reload.tick() => {
                    if !self.check_reload() {
                        continue;
                    }
                    info!(target: "nginx_telemetry::agent", "Applying reloaded configuration");
                    self.apply_config().await;

                    let config = self.config.get();
                    if config.agent.mode != mode {
                        self.flush_report().await;
                        mode = config.agent.mode;
                    }
                    if !schedule.is_current(&config.agent) {
                        schedule = Schedule::new(&config.agent);
                    }
                }
            }
        }

        info!(target: "nginx_telemetry::agent", "Starting graceful shutdown");
        let shutdown_start = Instant::now();

        self.flush_report().await;
        for collector in self.collectors.read().await.all() {
            collector.stop().await;
        }
        if let Err(e) = self.sink.flush().await {
            warn!(target: "nginx_telemetry::agent", error = %e, "Failed to flush sink");
        }

        self.running.store(false, AtomicOrdering::Release);
        info!(
            target: "nginx_telemetry::agent",
            duration_ms = shutdown_start.elapsed().as_millis() as u64,
            "Agent shutdown complete"
        );
        Ok(())
    }

    pub async fn stats(&self) -> AgentStats {
        let collectors = self
            .collectors
            .read()
            .await
            .all()
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect();
        AgentStats {
            uptime: self.uptime(),
            is_running: self.is_running(),
            ticks: self.ticks.load(AtomicOrdering::Relaxed),
            reports: self.reports.load(AtomicOrdering::Relaxed),
            push_errors: self.push_errors.load(AtomicOrdering::Relaxed),
            collectors,
        }
    }
}

async fn toggle_host<F>(collectors: &mut CollectorSet, name: &str, enabled: bool, build: F)
where
    F: FnOnce() -> Arc<dyn Collector>,
{
    match (enabled, collectors.host.contains_key(name)) {
        (true, false) => {
            info!(target: "nginx_telemetry::agent", collector = name, "Enabling collector");
            collectors.host.insert(name.to_string(), build());
        }
        (false, true) => {
            if let Some(collector) = collectors.host.remove(name) {
                info!(target: "nginx_telemetry::agent", collector = name, "Disabling collector");
                collector.stop().await;
            }
        }
        _ => {}
    }
}
