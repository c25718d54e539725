// ============================================================================
// SOURCES
// ============================================================================
// A source is one independent unit of collection. It is polled once per
// collector tick and pushes zero or more stats entities into the tick's
// queue. Every send races the tick's cancellation token so a stalled
// consumer can never pin a source task.
// ============================================================================

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::NginxCollectorConfig;
use crate::error::{SourceError, SourceResult};
use crate::model::{CommonDim, DimOverrides, NamedMetric, StatsEntity};

pub mod access_log;
pub mod cgroup;
pub mod error_log;
pub mod log_window;
pub mod nginx_oss;
pub mod plus;
pub mod process;
pub mod system;
pub mod tailer;

// ----------------------------------------------------------------------------
// 7.1 Metric Namespaces
// ----------------------------------------------------------------------------

pub const NS_SYSTEM: &str = "system";
pub const NS_NGINX: &str = "nginx";
pub const NS_PLUS: &str = "plus";
pub const NS_CONTAINER: &str = "container";

pub const NGINX_TYPE_OSS: &str = "oss";
pub const NGINX_TYPE_PLUS: &str = "plus";

// ----------------------------------------------------------------------------
// 7.2 Source Trait
// ----------------------------------------------------------------------------

/// Everything a source sees during one tick: the collector's dimension
/// snapshot, the tick's cancellation token and the fan-in queue.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub dims: Arc<CommonDim>,
    pub cancel: CancellationToken,
    tx: flume::Sender<StatsEntity>,
}

impl SourceContext {
    pub fn new(dims: Arc<CommonDim>, cancel: CancellationToken, tx: flume::Sender<StatsEntity>) -> Self {
        Self { dims, cancel, tx }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Queue one entity. Returns false when the tick was cancelled or the
    /// queue is gone before the entity could be delivered.
    pub async fn send(&self, entity: StatsEntity) -> bool {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            sent = self.tx.send_async(entity) => sent.is_ok(),
        }
    }

    /// Queue entities in order, stopping at the first failed send.
    pub async fn send_all<I>(&self, entities: I) -> usize
    where
        I: IntoIterator<Item = StatsEntity>,
    {
        let mut sent = 0;
        for entity in entities {
            if !self.send(entity).await {
                break;
            }
            sent += 1;
        }
        sent
    }
}

/// One unit of collection owned by a collector.
#[async_trait]
pub trait Source: Send + Sync {
    /// Source name, used in logs and collector stats
    fn name(&self) -> &'static str;

    /// Collect once and push the results through `ctx`.
    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()>;

    /// Apply a per-instance configuration change that does not require
    /// rebuilding the source set.
    async fn update(&self, _config: &NginxCollectorConfig) {}

    /// Release background work owned by the source.
    async fn stop(&self) {}
}

// ----------------------------------------------------------------------------
// 7.3 Shared Helpers
// ----------------------------------------------------------------------------

/// The single `nginx.status = 0` entity sources emit when they cannot
/// establish that nginx is alive.
pub fn nginx_down_entity(overrides: DimOverrides) -> StatsEntity {
    StatsEntity::new(
        Vec::new(),
        NamedMetric::new(NS_NGINX, "").convert([("status", 0.0)]),
    )
    .with_overrides(overrides)
}

/// Dimensions every source of one nginx instance attaches, whether or not
/// the instance answered: the status endpoint it is monitored through and
/// its nginx type. Keeping them identical across sources and outages keeps
/// up and down ticks in one aggregation bucket.
pub fn instance_overrides(config: &NginxCollectorConfig) -> DimOverrides {
    if config.is_plus() {
        DimOverrides::default()
            .published_api(config.plus_api.trim_end_matches('/'))
            .nginx_type(NGINX_TYPE_PLUS)
    } else {
        DimOverrides::default()
            .published_api(config.stub_status.as_str())
            .nginx_type(NGINX_TYPE_OSS)
    }
}

/// Read a small procfs/sysfs/cgroup file.
pub(crate) async fn read_file(path: &Path) -> SourceResult<String> {
    tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SourceError::io(path, e))
}

/// Read a file holding one integer.
pub(crate) async fn read_int(path: &Path) -> SourceResult<i64> {
    let raw = read_file(path).await?;
    raw.trim()
        .parse::<i64>()
        .map_err(|e| SourceError::parse(path.display().to_string(), e))
}
