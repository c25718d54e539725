// ============================================================================
// NGINX ERROR LOG SOURCE
// ============================================================================
// Counts buffering and upstream failure events in error logs per window.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;

use super::access_log::nginx_type_of;
use super::log_window::{LogWatchers, ParserFactory, WindowParser};
use super::{Source, SourceContext, NS_NGINX};
use crate::config::NginxCollectorConfig;
use crate::error::SourceResult;
use crate::model::{NamedMetric, SimpleMetric};

pub const HTTP_REQUEST_BUFFERED: &str = "http.request.buffered";
pub const UPSTREAM_RESPONSE_BUFFERED: &str = "upstream.response.buffered";
pub const UPSTREAM_REQUEST_FAILED: &str = "upstream.request.failed";
pub const UPSTREAM_RESPONSE_FAILED: &str = "upstream.response.failed";

const RULES: [(&str, &[&str]); 4] = [
    (HTTP_REQUEST_BUFFERED, &[r".*client request body is buffered.*"]),
    (UPSTREAM_RESPONSE_BUFFERED, &[r".*upstream response is buffered.*"]),
    (
        UPSTREAM_REQUEST_FAILED,
        &[
            r".*failed.*while connecting to upstream, client.*",
            r".*upstream timed out.*while connecting to upstream, client.*",
            r".*upstream queue is full while connecting to upstream.*",
            r".*no live upstreams while connecting to upstream, client.*",
            r".*upstream connection is closed too while sending request to upstream, client.*",
        ],
    ),
    (
        UPSTREAM_RESPONSE_FAILED,
        &[
            r".*failed.*while reading upstream.*",
            r".*failed.*while reading response header from upstream, client.*",
            r".*upstream timed out.*while reading response header from upstream, client.*",
            r".*upstream buffer is too small to read response.*",
            r".*upstream prematurely closed connection while reading response header from upstream, client.*",
            r".*upstream sent no valid.*header while reading response.*",
            r".*upstream sent invalid header.*",
            r".*upstream sent invalid chunked response.*",
            r".*upstream sent too big header while reading response header from upstream.*",
        ],
    ),
];

static MATCHERS: Lazy<Vec<(&'static str, Vec<Regex>)>> = Lazy::new(|| {
    RULES
        .iter()
        .map(|(metric, patterns)| (*metric, patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()))
        .collect()
});

/// One error log's current window. A line counts at most once per metric.
#[derive(Debug, Default)]
pub struct ErrorWindow {
    counts: [f64; RULES.len()],
}

impl WindowParser for ErrorWindow {
    fn ingest(&mut self, line: &str) {
        for (count, (_, regexes)) in self.counts.iter_mut().zip(MATCHERS.iter()) {
            if regexes.iter().any(|re| re.is_match(line)) {
                *count += 1.0;
            }
        }
    }

    fn flush(&mut self) -> Vec<SimpleMetric> {
        let counts = std::mem::take(&mut self.counts);
        NamedMetric::new(NS_NGINX, "").convert(RULES.iter().map(|(metric, _)| *metric).zip(counts))
    }
}

fn error_factory() -> ParserFactory {
    Arc::new(|_path: &str, _format: &str, _nginx_type: &str| -> SourceResult<Box<dyn WindowParser>> {
        Ok(Box::new(ErrorWindow::default()))
    })
}

fn error_files(config: &NginxCollectorConfig) -> BTreeMap<String, String> {
    config
        .error_logs
        .iter()
        .map(|path| (path.clone(), String::new()))
        .collect()
}

/// Windowed failure counters from every error log of one instance.
pub struct NginxErrorLog {
    watchers: Mutex<LogWatchers>,
}

impl NginxErrorLog {
    pub fn new(config: &NginxCollectorConfig) -> Self {
        let mut watchers = LogWatchers::new("error", error_factory(), config.collection_interval, nginx_type_of(config));
        watchers.reconcile(&error_files(config), config.collection_interval, nginx_type_of(config));
        Self {
            watchers: Mutex::new(watchers),
        }
    }

    pub fn watched(&self) -> Vec<String> {
        self.watchers.lock().watched()
    }
}

#[async_trait]
impl Source for NginxErrorLog {
    fn name(&self) -> &'static str {
        "nginx_error_log"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let buffer = self.watchers.lock().buffer();
        buffer.deliver(ctx).await;
        Ok(())
    }

    async fn update(&self, config: &NginxCollectorConfig) {
        self.watchers
            .lock()
            .reconcile(&error_files(config), config.collection_interval, nginx_type_of(config));
    }

    async fn stop(&self) {
        self.watchers.lock().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use test_case::test_case;

    fn counts(lines: &[&str]) -> Vec<(String, f64)> {
        let mut window = ErrorWindow::default();
        for line in lines {
            window.ingest(line);
        }
        window.flush().into_iter().map(|m| (m.name, m.value)).collect()
    }

    #[test_case(
        "2022/05/19 09:30:39 [warn] 1#1: *7 a client request body is buffered to a temporary file /var/cache/nginx/client_temp/0000000001, client: 10.0.0.1",
        "nginx.http.request.buffered"
    )]
    #[test_case(
        "2022/05/19 09:30:39 [warn] 1#1: *7 an upstream response is buffered to a temporary file /var/cache/nginx/proxy_temp/1/00/0000000001 while reading upstream",
        "nginx.upstream.response.buffered"
    )]
    #[test_case(
        "2022/05/19 09:30:39 [error] 1#1: *7 connect() failed (111: Connection refused) while connecting to upstream, client: 10.0.0.1, server: _",
        "nginx.upstream.request.failed"
    )]
    #[test_case(
        "2022/05/19 09:30:39 [error] 1#1: *7 no live upstreams while connecting to upstream, client: 10.0.0.1",
        "nginx.upstream.request.failed"
    )]
    #[test_case(
        "2022/05/19 09:30:39 [error] 1#1: *7 upstream prematurely closed connection while reading response header from upstream, client: 10.0.0.1",
        "nginx.upstream.response.failed"
    )]
    #[test_case(
        "2022/05/19 09:30:39 [error] 1#1: *7 upstream sent invalid chunked response while reading upstream",
        "nginx.upstream.response.failed"
    )]
    fn test_line_classification(line: &str, metric: &str) {
        for (name, value) in counts(&[line]) {
            let expected = if name == metric { 1.0 } else { 0.0 };
            assert_eq!(value, expected, "{}", name);
        }
    }

    #[test]
    fn test_unrelated_lines_count_nothing() {
        let result = counts(&["2015/07/15 05:56:30 [info] 28386#28386: *94160 client 10.196.158.41 closed keepalive connection"]);
        assert!(result.iter().all(|(_, v)| *v == 0.0));
        assert_eq!(result.len(), 4);
    }

    #[test]
    fn test_line_counts_once_per_metric() {
        // matches two response.failed patterns
        let result = counts(&["recv() failed (104) while reading response header from upstream, client: 10.0.0.1 while reading upstream"]);
        let failed = result
            .iter()
            .find(|(n, _)| n == "nginx.upstream.response.failed")
            .map(|(_, v)| *v);
        assert_eq!(failed, Some(1.0));
    }

    #[test]
    fn test_names_are_catalogued() {
        for (name, _) in counts(&[]) {
            assert!(catalog::lookup(&name).is_some(), "uncatalogued: {}", name);
        }
    }

    #[tokio::test]
    async fn test_interval_change_restarts_tailers() {
        let config = NginxCollectorConfig {
            collection_interval: Duration::from_secs(10),
            error_logs: vec!["/var/log/nginx/error.log".into()],
            ..NginxCollectorConfig::default()
        };
        let source = NginxErrorLog::new(&config);
        assert_eq!(source.watched(), vec!["/var/log/nginx/error.log"]);

        let changed = NginxCollectorConfig {
            collection_interval: Duration::from_secs(20),
            error_logs: vec!["/var/log/nginx/other.log".into()],
            ..config
        };
        source.update(&changed).await;
        assert_eq!(source.watched(), vec!["/var/log/nginx/other.log"]);

        source.stop().await;
        assert!(source.watched().is_empty());
    }
}
