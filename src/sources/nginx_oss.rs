// ============================================================================
// NGINX OSS (STUB STATUS) SOURCE
// ============================================================================
// Polls the stub_status page, converts its connection and request counters
// into per-tick deltas and reports nginx liveness. Also holds the static
// source used when an instance exposes no status endpoint at all.
// ============================================================================

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{instance_overrides, nginx_down_entity, Source, SourceContext, NGINX_TYPE_OSS, NS_NGINX};
use crate::config::NginxCollectorConfig;
use crate::delta::counter_delta;
use crate::error::{SourceError, SourceResult};
use crate::logging::SourceLogger;
use crate::model::{DimOverrides, NamedMetric, SimpleMetric, StatsEntity};
use crate::API_TIMEOUT;

// ----------------------------------------------------------------------------
// 11.1 Stub Status Page
// ----------------------------------------------------------------------------

/// One parse of the stub_status page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StubStatus {
    pub active: u64,
    pub accepted: u64,
    pub handled: u64,
    pub requests: u64,
    pub reading: u64,
    pub writing: u64,
    pub waiting: u64,
}

/// Parse the stub_status text:
///
/// ```text
/// Active connections: 291
/// server accepts handled requests
///  16630948 16630948 31070465
/// Reading: 6 Writing: 179 Waiting: 106
/// ```
pub fn parse_stub_status(body: &str) -> SourceResult<StubStatus> {
    let bad = |message: &str| SourceError::parse("stub_status", message);
    let lines: Vec<&str> = body.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
    if lines.len() < 4 {
        return Err(bad("truncated page"));
    }

    let active = lines[0]
        .strip_prefix("Active connections:")
        .and_then(|v| v.trim().parse().ok())
        .ok_or_else(|| bad("missing active connections"))?;

    let counters: Vec<u64> = lines[2]
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|_| bad("malformed accepts/handled/requests"))?;
    let [accepted, handled, requests] = counters[..] else {
        return Err(bad("malformed accepts/handled/requests"));
    };

    let mut states = [0u64; 3];
    let mut tokens = lines[3].split_whitespace();
    for (slot, key) in states.iter_mut().zip(["Reading:", "Writing:", "Waiting:"]) {
        if tokens.next() != Some(key) {
            return Err(bad("malformed reading/writing/waiting"));
        }
        *slot = tokens
            .next()
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| bad("malformed reading/writing/waiting"))?;
    }
    let [reading, writing, waiting] = states;

    Ok(StubStatus {
        active,
        accepted,
        handled,
        requests,
        reading,
        writing,
        waiting,
    })
}

impl StubStatus {
    fn metrics(&self, prev: &StubStatus) -> Vec<SimpleMetric> {
        let accepted = counter_delta(self.accepted, prev.accepted);
        let handled = counter_delta(self.handled, prev.handled);

        NamedMetric::new(NS_NGINX, "http").convert([
            ("conn.active", self.active as f64),
            ("conn.accepted", accepted as f64),
            ("conn.handled", handled as f64),
            ("conn.current", (self.active + self.waiting) as f64),
            ("conn.idle", self.waiting as f64),
            ("conn.dropped", accepted.saturating_sub(handled) as f64),
            ("conn.reading", self.reading as f64),
            ("conn.writing", self.writing as f64),
            ("request.count", counter_delta(self.requests, prev.requests) as f64),
            ("request.current", (self.reading + self.writing) as f64),
        ])
    }
}

// ----------------------------------------------------------------------------
// 11.2 Stub Status Client
// ----------------------------------------------------------------------------

/// Fetches the stub_status page.
#[async_trait]
pub trait StubStatusClient: Send + Sync {
    fn endpoint(&self) -> &str;
    async fn fetch(&self) -> SourceResult<StubStatus>;
}

/// `reqwest` stub_status client.
pub struct HttpStubStatusClient {
    url: String,
    client: reqwest::Client,
}

impl HttpStubStatusClient {
    pub fn new(url: impl Into<String>) -> SourceResult<Self> {
        let url = url.into();
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .build()
            .map_err(|e| SourceError::unreachable(&url, e))?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl StubStatusClient for HttpStubStatusClient {
    fn endpoint(&self) -> &str {
        &self.url
    }

    async fn fetch(&self) -> SourceResult<StubStatus> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| SourceError::unreachable(&self.url, e))?;
        if !response.status().is_success() {
            return Err(SourceError::invalid_response(
                &self.url,
                format!("status {}", response.status()),
            ));
        }
        let body = response
            .text()
            .await
            .map_err(|e| SourceError::invalid_response(&self.url, e))?;
        parse_stub_status(&body)
    }
}

// ----------------------------------------------------------------------------
// 11.3 OSS Source
// ----------------------------------------------------------------------------

/// `nginx.status` and `nginx.http.*` from stub_status.
pub struct NginxOss {
    client: Arc<dyn StubStatusClient>,
    prev: Mutex<Option<StubStatus>>,
    logger: SourceLogger,
}

impl NginxOss {
    pub fn new(client: Arc<dyn StubStatusClient>) -> Self {
        Self {
            client,
            prev: Mutex::new(None),
            logger: SourceLogger::new("nginx_oss"),
        }
    }

    pub fn from_config(config: &NginxCollectorConfig) -> SourceResult<Self> {
        Ok(Self::new(Arc::new(HttpStubStatusClient::new(&config.stub_status)?)))
    }

    fn overrides(&self) -> DimOverrides {
        DimOverrides::default()
            .published_api(self.client.endpoint())
            .nginx_type(NGINX_TYPE_OSS)
    }
}

#[async_trait]
impl Source for NginxOss {
    fn name(&self) -> &'static str {
        "nginx_oss"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let current = match self.client.fetch().await {
            Ok(status) => {
                self.logger.reset();
                status
            }
            Err(e) => {
                self.logger.log(&format!("Failed to retrieve stub status metrics: {}", e));
                ctx.send(nginx_down_entity(self.overrides())).await;
                return Err(e);
            }
        };

        let mut metrics = {
            let mut prev = self.prev.lock();
            let baseline = prev.unwrap_or(current);
            *prev = Some(current);
            current.metrics(&baseline)
        };
        metrics.insert(0, SimpleMetric::new(NamedMetric::new(NS_NGINX, "").label("status"), 1.0));

        debug!(
            target: "nginx_telemetry::source::oss",
            endpoint = self.client.endpoint(),
            active = current.active,
            "Collected stub status"
        );
        ctx.send(StatsEntity::new(Vec::new(), metrics).with_overrides(self.overrides()))
            .await;
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 11.4 Static Source
// ----------------------------------------------------------------------------

/// Emits `nginx.status = 0` for an instance with neither stub_status nor a
/// Plus API configured, or whose status client could not be built.
#[derive(Debug, Default)]
pub struct NginxStatic {
    overrides: DimOverrides,
}

impl NginxStatic {
    pub fn new(config: &NginxCollectorConfig) -> Self {
        Self {
            overrides: instance_overrides(config),
        }
    }
}

#[async_trait]
impl Source for NginxStatic {
    fn name(&self) -> &'static str {
        "nginx_static"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        ctx.send(nginx_down_entity(self.overrides.clone())).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CommonDim;
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;

    const PAGE: &str = "Active connections: 291 \nserver accepts handled requests\n 16630948 16630940 31070465 \nReading: 6 Writing: 179 Waiting: 106 \n";

    struct FakeStub {
        pages: Mutex<Vec<SourceResult<StubStatus>>>,
    }

    #[async_trait]
    impl StubStatusClient for FakeStub {
        fn endpoint(&self) -> &str {
            "http://127.0.0.1/nginx_status"
        }

        async fn fetch(&self) -> SourceResult<StubStatus> {
            self.pages.lock().remove(0)
        }
    }

    fn context() -> (SourceContext, flume::Receiver<StatsEntity>) {
        let (tx, rx) = flume::bounded(16);
        (
            SourceContext::new(Arc::new(CommonDim::default()), CancellationToken::new(), tx),
            rx,
        )
    }

    #[test]
    fn test_parse_stub_status() {
        assert_eq!(
            parse_stub_status(PAGE).unwrap(),
            StubStatus {
                active: 291,
                accepted: 16630948,
                handled: 16630940,
                requests: 31070465,
                reading: 6,
                writing: 179,
                waiting: 106,
            }
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_stub_status("<html>502 Bad Gateway</html>").is_err());
        assert!(parse_stub_status("Active connections: x\na\n1 2 3\nReading: 1 Writing: 2 Waiting: 3").is_err());
        assert!(parse_stub_status("Active connections: 1\na\n1 2\nReading: 1 Writing: 2 Waiting: 3").is_err());
    }

    #[tokio::test]
    async fn test_oss_deltas_and_restart() {
        let base = parse_stub_status(PAGE).unwrap();
        let later = StubStatus {
            accepted: base.accepted + 100,
            handled: base.handled + 90,
            requests: base.requests + 250,
            ..base
        };
        let restarted = StubStatus {
            accepted: 5,
            handled: 5,
            requests: 7,
            ..base
        };
        let client = Arc::new(FakeStub {
            pages: Mutex::new(vec![Ok(base), Ok(later), Ok(restarted)]),
        });
        let source = NginxOss::new(client);
        let (ctx, rx) = context();

        source.collect(&ctx).await.unwrap();
        let first = rx.try_recv().unwrap();
        assert_eq!(first.metric("nginx.status"), Some(1.0));
        assert_eq!(first.metric("nginx.http.request.count"), Some(0.0));
        assert_eq!(first.metric("nginx.http.conn.current"), Some(397.0));
        assert_eq!(first.metric("nginx.http.request.current"), Some(185.0));
        assert_eq!(first.overrides.nginx_type.as_deref(), Some(NGINX_TYPE_OSS));

        source.collect(&ctx).await.unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!(second.metric("nginx.http.conn.accepted"), Some(100.0));
        assert_eq!(second.metric("nginx.http.conn.dropped"), Some(10.0));
        assert_eq!(second.metric("nginx.http.request.count"), Some(250.0));

        source.collect(&ctx).await.unwrap();
        let third = rx.try_recv().unwrap();
        assert_eq!(third.metric("nginx.http.request.count"), Some(7.0));
        assert_eq!(third.metric("nginx.http.conn.accepted"), Some(5.0));
    }

    #[tokio::test]
    async fn test_oss_unreachable_reports_down() {
        let client = Arc::new(FakeStub {
            pages: Mutex::new(vec![Err(SourceError::unreachable("http://127.0.0.1/nginx_status", "refused"))]),
        });
        let source = NginxOss::new(client);
        let (ctx, rx) = context();

        assert!(source.collect(&ctx).await.is_err());
        let entity = rx.try_recv().unwrap();
        assert_eq!(entity.metrics.len(), 1);
        assert_eq!(entity.metric("nginx.status"), Some(0.0));
        assert_eq!(
            entity.overrides.published_api.as_deref(),
            Some("http://127.0.0.1/nginx_status")
        );
    }

    /// One tick per page through a source set, finalized as one window.
    async fn aggregated_window(pages: Vec<SourceResult<StubStatus>>) -> crate::model::MetricsReport {
        use crate::aggregate::{finalize, Collections};
        use crate::collector::{CollectorStatsTracker, SourceSet};
        use crate::config::UnknownMetricPolicy;
        use crate::model::MetricsReport;
        use std::time::Duration;

        let ticks = pages.len();
        let client = Arc::new(FakeStub {
            pages: Mutex::new(pages),
        });
        let sources = SourceSet::new(vec![Arc::new(NginxOss::new(client))]);
        let dims = Arc::new(CommonDim {
            hostname: "web-01".into(),
            nginx_id: "main".into(),
            ..CommonDim::default()
        });
        let stats = CollectorStatsTracker::new();
        let cancel = CancellationToken::new();

        let mut collections = Collections::new();
        for _ in 0..ticks {
            let entities = sources
                .collect("nginx:main", Arc::clone(&dims), Duration::from_secs(1), &cancel, &stats)
                .await;
            collections.accumulate(&MetricsReport::new(entities));
        }
        finalize(&collections, UnknownMetricPolicy::Drop)
    }

    fn refused() -> SourceResult<StubStatus> {
        Err(SourceError::unreachable("http://127.0.0.1/nginx_status", "refused"))
    }

    #[tokio::test]
    async fn test_status_majority_vote_across_outage() {
        let up = parse_stub_status(PAGE).unwrap();
        let report = aggregated_window(vec![Ok(up), Ok(up), refused(), Ok(up)]).await;
        let status: Vec<f64> = report.entities.iter().filter_map(|e| e.metric("nginx.status")).collect();
        assert_eq!(status, vec![1.0]);
    }

    #[tokio::test]
    async fn test_status_majority_down_reports_down() {
        let up = parse_stub_status(PAGE).unwrap();
        let report = aggregated_window(vec![Ok(up), refused(), refused(), refused()]).await;
        let status: Vec<f64> = report.entities.iter().filter_map(|e| e.metric("nginx.status")).collect();
        assert_eq!(status, vec![0.0]);
    }

    #[tokio::test]
    async fn test_static_source() {
        let (ctx, rx) = context();
        NginxStatic::new(&NginxCollectorConfig::default()).collect(&ctx).await.unwrap();
        let entity = rx.try_recv().unwrap();
        assert_eq!(entity.metric("nginx.status"), Some(0.0));
        assert_eq!(entity.overrides.nginx_type.as_deref(), Some(NGINX_TYPE_OSS));
    }

    #[tokio::test]
    async fn test_static_fallback_matches_status_source_dims() {
        let config = NginxCollectorConfig {
            stub_status: "http://127.0.0.1/nginx_status".into(),
            ..NginxCollectorConfig::default()
        };
        let (ctx, rx) = context();
        NginxStatic::new(&config).collect(&ctx).await.unwrap();
        let fallback = rx.try_recv().unwrap();

        let client = Arc::new(FakeStub {
            pages: Mutex::new(vec![Ok(parse_stub_status(PAGE).unwrap())]),
        });
        NginxOss::new(client).collect(&ctx).await.unwrap();
        let answered = rx.try_recv().unwrap();

        assert_eq!(fallback.overrides, answered.overrides);
    }
}
