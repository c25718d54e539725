// ============================================================================
// NGINX PLUS SOURCE
// ============================================================================
// Snapshot types for the Plus REST API, the client seam that produces them
// and the source that turns two consecutive snapshots into entities.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use super::{nginx_down_entity, Source, SourceContext, NGINX_TYPE_PLUS};
use crate::config::NginxCollectorConfig;
use crate::error::SourceResult;
use crate::logging::SourceLogger;
use crate::model::DimOverrides;

pub mod client;
pub mod metrics;

pub use client::{HttpPlusClient, PlusClient};

// ----------------------------------------------------------------------------
// 12.1 API Snapshot Types
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NginxInfo {
    pub version: String,
    pub build: String,
    pub generation: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Connections {
    pub accepted: u64,
    pub dropped: u64,
    pub active: u64,
    pub idle: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRequests {
    pub total: u64,
    pub current: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Ssl {
    pub handshakes: u64,
    pub handshakes_failed: u64,
    pub session_reuses: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Responses {
    #[serde(rename = "1xx")]
    pub r1xx: u64,
    #[serde(rename = "2xx")]
    pub r2xx: u64,
    #[serde(rename = "3xx")]
    pub r3xx: u64,
    #[serde(rename = "4xx")]
    pub r4xx: u64,
    #[serde(rename = "5xx")]
    pub r5xx: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerZone {
    pub processing: u64,
    pub requests: u64,
    pub responses: Responses,
    pub discarded: u64,
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationZone {
    pub requests: u64,
    pub responses: Responses,
    pub discarded: u64,
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Sessions {
    #[serde(rename = "2xx")]
    pub s2xx: u64,
    #[serde(rename = "4xx")]
    pub s4xx: u64,
    #[serde(rename = "5xx")]
    pub s5xx: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamServerZone {
    pub processing: u64,
    pub connections: u64,
    pub sessions: Sessions,
    pub discarded: u64,
    pub received: u64,
    pub sent: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheStats {
    pub responses: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpCache {
    pub size: u64,
    pub max_size: u64,
    pub hit: CacheStats,
    pub stale: CacheStats,
    pub updating: CacheStats,
    pub revalidated: CacheStats,
    pub miss: CacheStats,
    pub expired: CacheStats,
    pub bypass: CacheStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthChecks {
    pub checks: u64,
    pub fails: u64,
    pub unhealthy: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Peer {
    pub id: u64,
    pub server: String,
    pub service: String,
    pub name: String,
    pub backup: bool,
    pub weight: u64,
    pub state: String,
    pub active: u64,
    pub requests: u64,
    pub header_time: Option<u64>,
    pub response_time: Option<u64>,
    pub responses: Responses,
    pub sent: u64,
    pub received: u64,
    pub fails: u64,
    pub unavail: u64,
    pub health_checks: HealthChecks,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Queue {
    pub size: u64,
    pub max_size: u64,
    pub overflows: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Upstream {
    pub peers: Vec<Peer>,
    pub keepalive: u64,
    pub zombies: u64,
    pub zone: String,
    pub queue: Queue,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamPeer {
    pub id: u64,
    pub server: String,
    pub service: String,
    pub name: String,
    pub backup: bool,
    pub weight: u64,
    pub state: String,
    pub active: u64,
    pub connections: u64,
    pub connect_time: Option<u64>,
    pub first_byte_time: Option<u64>,
    pub response_time: Option<u64>,
    pub sent: u64,
    pub received: u64,
    pub fails: u64,
    pub unavail: u64,
    pub health_checks: HealthChecks,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamUpstream {
    pub peers: Vec<StreamPeer>,
    pub zombies: u64,
    pub zone: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabPages {
    pub used: u64,
    pub free: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlabSlot {
    pub used: u64,
    pub free: u64,
    pub reqs: u64,
    pub fails: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slab {
    pub pages: SlabPages,
    pub slots: BTreeMap<String, SlabSlot>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitConn {
    pub passed: u64,
    pub rejected: u64,
    pub rejected_dry_run: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitReq {
    pub passed: u64,
    pub delayed: u64,
    pub rejected: u64,
    pub delayed_dry_run: u64,
    pub rejected_dry_run: u64,
}

/// Everything one poll of the Plus API returned.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlusStats {
    pub nginx: NginxInfo,
    pub connections: Connections,
    pub http_requests: HttpRequests,
    pub ssl: Ssl,
    pub slabs: BTreeMap<String, Slab>,
    pub caches: BTreeMap<String, HttpCache>,
    pub server_zones: BTreeMap<String, ServerZone>,
    pub location_zones: BTreeMap<String, LocationZone>,
    pub upstreams: BTreeMap<String, Upstream>,
    pub stream_server_zones: BTreeMap<String, StreamServerZone>,
    pub stream_upstreams: BTreeMap<String, StreamUpstream>,
    pub limit_conns: BTreeMap<String, LimitConn>,
    pub limit_reqs: BTreeMap<String, LimitReq>,
}

// ----------------------------------------------------------------------------
// 12.2 Plus Source
// ----------------------------------------------------------------------------

/// Polls the Plus API and reports `nginx.*` and `plus.*` entities.
pub struct NginxPlus {
    client: Arc<dyn PlusClient>,
    /// Previous snapshot; held across the fetch so ticks never interleave
    prev: Mutex<Option<PlusStats>>,
    logger: SourceLogger,
}

impl NginxPlus {
    pub fn new(client: Arc<dyn PlusClient>) -> Self {
        Self {
            client,
            prev: Mutex::new(None),
            logger: SourceLogger::new("nginx_plus"),
        }
    }

    pub fn from_config(config: &NginxCollectorConfig) -> SourceResult<Self> {
        let client = HttpPlusClient::new(&config.plus_api, config.client_version)?;
        Ok(Self::new(Arc::new(client)))
    }
}

#[async_trait]
impl Source for NginxPlus {
    fn name(&self) -> &'static str {
        "nginx_plus"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let mut prev = self.prev.lock().await;

        let current = match self.client.stats().await {
            Ok(stats) => {
                self.logger.reset();
                stats
            }
            Err(e) => {
                self.logger.log(&format!("Failed to retrieve plus metrics: {}", e));
                let mut overrides = DimOverrides::default()
                    .published_api(self.client.endpoint())
                    .nginx_type(NGINX_TYPE_PLUS);
                // last known build, so the down tick shares the up ticks' bucket
                if let Some(last) = prev.as_ref() {
                    overrides = overrides.build(last.nginx.build.as_str(), last.nginx.version.as_str());
                }
                ctx.send(nginx_down_entity(overrides)).await;
                return Err(e);
            }
        };

        let baseline = prev.take().unwrap_or_else(|| current.clone());
        let entities = metrics::convert(&current, &baseline, self.client.endpoint());
        *prev = Some(current);
        drop(prev);

        debug!(
            target: "nginx_telemetry::source::plus",
            endpoint = self.client.endpoint(),
            entities = entities.len(),
            "Collected plus metrics"
        );
        ctx.send_all(entities).await;
        Ok(())
    }
}
