// ============================================================================
// NGINX ACCESS LOG SOURCE
// ============================================================================
// Turns an nginx log_format into a line pattern and aggregates matched
// lines into per-window counters and timing distributions.
// ============================================================================

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::{Captures, Regex};
use tracing::{debug, trace};

use super::log_window::{LogWatchers, ParserFactory, WindowParser};
use super::{Source, SourceContext, NGINX_TYPE_OSS, NGINX_TYPE_PLUS, NS_NGINX};
use crate::config::NginxCollectorConfig;
use crate::error::{SourceError, SourceResult};
use crate::model::{NamedMetric, SimpleMetric};
use crate::stats::{mean, WindowStats};

// ----------------------------------------------------------------------------
// 14.1 Log Format
// ----------------------------------------------------------------------------

static VARIABLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$(?:\{([A-Za-z0-9_]+)\}|([A-Za-z0-9_]+))").unwrap());

fn variable_pattern(name: &str) -> &'static str {
    match name {
        "remote_addr" | "remote_user" => r"\S+",
        "time_local" => r"[^\]]*",
        "status" | "request_length" => r"\d+",
        "body_bytes_sent" | "bytes_sent" => r"\d+(?:\.\d+)?",
        _ => ".*?",
    }
}

/// A compiled nginx `log_format`.
#[derive(Debug, Clone)]
pub struct AccessLogFormat {
    regex: Regex,
}

impl AccessLogFormat {
    /// Each `$variable` becomes a named capture, literal text is matched
    /// verbatim and the whole line must match. A variable used twice only
    /// captures its first occurrence.
    pub fn compile(format: &str) -> SourceResult<Self> {
        let mut pattern = String::from("^");
        let mut seen = AHashSet::new();
        let mut last = 0;

        for caps in VARIABLE.captures_iter(format) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1).or_else(|| caps.get(2))) else {
                continue;
            };
            pattern.push_str(&regex::escape(&format[last..whole.start()]));
            let name = name.as_str();
            if seen.insert(name) {
                pattern.push_str(&format!("(?P<{}>{})", name, variable_pattern(name)));
            } else {
                pattern.push_str(&format!("(?:{})", variable_pattern(name)));
            }
            last = whole.end();
        }
        pattern.push_str(&regex::escape(&format[last..]));
        pattern.push_str(r"\s*$");

        let regex = Regex::new(&pattern).map_err(|e| SourceError::parse("log_format", e))?;
        Ok(Self { regex })
    }

    pub fn captures<'l>(&self, line: &'l str) -> Option<Captures<'l>> {
        self.regex.captures(line)
    }

    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }
}

// ----------------------------------------------------------------------------
// 14.2 Access Window
// ----------------------------------------------------------------------------

/// `nginx.http.*` counters, in reporting order.
const HTTP_COUNTERS: [&str; 26] = [
    "request.body_bytes_sent",
    "request.bytes_sent",
    "request.malformed",
    "method.post",
    "method.get",
    "method.delete",
    "method.put",
    "method.head",
    "method.options",
    "method.others",
    "status.1xx",
    "status.2xx",
    "status.3xx",
    "status.4xx",
    "status.5xx",
    "status.403",
    "status.404",
    "status.500",
    "status.502",
    "status.503",
    "status.504",
    "status.discarded",
    "v0_9",
    "v1_0",
    "v1_1",
    "v2",
];

/// Counters without a group (`nginx.upstream.*`, `nginx.cache.*`).
const UPSTREAM_COUNTERS: [&str; 12] = [
    "upstream.status.1xx",
    "upstream.status.2xx",
    "upstream.status.3xx",
    "upstream.status.4xx",
    "upstream.status.5xx",
    "cache.bypass",
    "cache.expired",
    "cache.hit",
    "cache.miss",
    "cache.revalidated",
    "cache.stale",
    "cache.updating",
];

const STATUS_CLASSES: [&str; 5] = ["status.1xx", "status.2xx", "status.3xx", "status.4xx", "status.5xx"];
const UPSTREAM_STATUS_CLASSES: [&str; 5] = [
    "upstream.status.1xx",
    "upstream.status.2xx",
    "upstream.status.3xx",
    "upstream.status.4xx",
    "upstream.status.5xx",
];

#[derive(Debug, Default)]
struct ValueLists {
    gzip_ratios: Vec<f64>,
    request_lengths: Vec<f64>,
    request_times: Vec<f64>,
    connect_times: Vec<f64>,
    header_times: Vec<f64>,
    response_times: Vec<f64>,
    response_lengths: Vec<f64>,
}

/// One access log's current window.
#[derive(Debug)]
pub struct AccessWindow {
    format: AccessLogFormat,
    /// Status classes are only derived from the log for OSS; Plus reports
    /// them through its API
    count_status: bool,
    counters: AHashMap<&'static str, f64>,
    values: ValueLists,
    unmatched: u64,
}

impl AccessWindow {
    pub fn new(format: AccessLogFormat, nginx_type: &str) -> Self {
        Self {
            format,
            count_status: nginx_type != NGINX_TYPE_PLUS,
            counters: AHashMap::new(),
            values: ValueLists::default(),
            unmatched: 0,
        }
    }

    fn inc(&mut self, name: &'static str) {
        self.add(name, 1.0);
    }

    fn add(&mut self, name: &'static str, value: f64) {
        *self.counters.entry(name).or_insert(0.0) += value;
    }

    fn count(&self, name: &str) -> f64 {
        self.counters.get(name).copied().unwrap_or_default()
    }

    fn record_status(&mut self, code: u16) {
        if let Some(class) = status_class(code, &STATUS_CLASSES) {
            self.inc(class);
        }
        match code {
            400 => self.inc("request.malformed"),
            403 => self.inc("status.403"),
            404 => self.inc("status.404"),
            499 => self.inc("status.discarded"),
            500 => self.inc("status.500"),
            502 => self.inc("status.502"),
            503 => self.inc("status.503"),
            504 => self.inc("status.504"),
            _ => {}
        }
    }
}

fn field<'l>(caps: &Captures<'l>, name: &str) -> Option<&'l str> {
    caps.name(name)
        .map(|m| m.as_str().trim())
        .filter(|v| !v.is_empty())
}

fn status_class(code: u16, classes: &[&'static str; 5]) -> Option<&'static str> {
    match code / 100 {
        n @ 1..=5 => Some(classes[(n - 1) as usize]),
        _ => None,
    }
}

/// Method and protocol of a `METHOD uri PROTO/x` request line.
fn split_request(request: &str) -> Option<(&str, &str)> {
    let (method, rest) = request.split_once(' ')?;
    let (uri, protocol) = rest.rsplit_once(' ')?;
    let well_formed = !method.is_empty()
        && method.chars().all(|c| c.is_ascii_alphanumeric())
        && !uri.trim().is_empty()
        && protocol.matches('/').count() == 1;
    well_formed.then_some((method, protocol))
}

fn protocol_counter(protocol: &str) -> Option<&'static str> {
    let (_, version) = protocol.split_once('/')?;
    match version {
        "0.9" => Some("v0_9"),
        "1.0" => Some("v1_0"),
        "1.1" => Some("v1_1"),
        "2" | "2.0" => Some("v2"),
        "3" | "3.0" => Some("v3"),
        _ => None,
    }
}

fn method_counter(method: &str) -> &'static str {
    match method.to_ascii_lowercase().as_str() {
        "get" => "method.get",
        "post" => "method.post",
        "put" => "method.put",
        "delete" => "method.delete",
        "head" => "method.head",
        "options" => "method.options",
        _ => "method.others",
    }
}

fn cache_counter(status: &str) -> Option<&'static str> {
    match status.to_ascii_lowercase().as_str() {
        "bypass" => Some("cache.bypass"),
        "expired" => Some("cache.expired"),
        "hit" => Some("cache.hit"),
        "miss" => Some("cache.miss"),
        "revalidated" => Some("cache.revalidated"),
        "stale" => Some("cache.stale"),
        "updating" => Some("cache.updating"),
        _ => None,
    }
}

/// Values of a multi-upstream field such as `0.010, 0.020 : 0.005`.
fn upstream_values(raw: &str) -> impl Iterator<Item = &str> {
    raw.split([',', ':']).map(str::trim).filter(|v| !v.is_empty())
}

/// Upstream timings; `-` (no upstream reached) counts as zero.
fn push_times(values: &mut Vec<f64>, raw: Option<&str>) {
    for v in raw.into_iter().flat_map(upstream_values) {
        if v == "-" {
            values.push(0.0);
        } else if let Ok(t) = v.parse() {
            values.push(t);
        }
    }
}

fn parse_f64(raw: Option<&str>) -> Option<f64> {
    raw.and_then(|v| v.parse().ok())
}

impl WindowParser for AccessWindow {
    fn ingest(&mut self, line: &str) {
        let Some(caps) = self.format.captures(line) else {
            self.unmatched += 1;
            trace!(target: "nginx_telemetry::source::access_log", line, "Line does not match log format");
            return;
        };

        if let Some(v) = parse_f64(field(&caps, "body_bytes_sent")) {
            self.add("request.body_bytes_sent", v);
        }
        if let Some(v) = parse_f64(field(&caps, "bytes_sent")) {
            self.add("request.bytes_sent", v);
        }
        if let Some(v) = parse_f64(field(&caps, "gzip_ratio")) {
            self.values.gzip_ratios.push(v);
        }
        if let Some(v) = parse_f64(field(&caps, "request_length")) {
            self.values.request_lengths.push(v);
        }
        if let Some(v) = parse_f64(field(&caps, "request_time")) {
            self.values.request_times.push(v);
        }

        let server_protocol = field(&caps, "server_protocol");
        if let Some((method, protocol)) = field(&caps, "request").and_then(split_request) {
            self.inc(method_counter(method));
            if server_protocol.is_none() {
                if let Some(version) = protocol_counter(protocol) {
                    self.inc(version);
                }
            }
        }
        if let Some(version) = server_protocol.and_then(protocol_counter) {
            self.inc(version);
        }

        if self.count_status {
            if let Some(code) = field(&caps, "status").and_then(|s| s.parse::<u16>().ok()) {
                self.record_status(code);
            }
        }

        push_times(&mut self.values.connect_times, field(&caps, "upstream_connect_time"));
        push_times(&mut self.values.header_times, field(&caps, "upstream_header_time"));
        push_times(&mut self.values.response_times, field(&caps, "upstream_response_time"));

        for v in field(&caps, "upstream_response_length").into_iter().flat_map(upstream_values) {
            if let Ok(length) = v.parse() {
                self.values.response_lengths.push(length);
            }
        }
        for v in field(&caps, "upstream_status").into_iter().flat_map(upstream_values) {
            if let Some(class) = v.parse().ok().and_then(|code| status_class(code, &UPSTREAM_STATUS_CLASSES)) {
                self.inc(class);
            }
        }
        if let Some(counter) = field(&caps, "upstream_cache_status").and_then(cache_counter) {
            self.inc(counter);
        }
    }

    fn flush(&mut self) -> Vec<SimpleMetric> {
        let values = std::mem::take(&mut self.values);
        if self.unmatched > 0 {
            debug!(target: "nginx_telemetry::source::access_log", unmatched = self.unmatched, "Skipped unmatched access log lines");
            self.unmatched = 0;
        }

        let mut http: Vec<(String, f64)> = vec![("gzip.ratio".into(), mean(&values.gzip_ratios))];
        http.extend(WindowStats::compute(&values.request_times).samples("request.time"));
        http.extend(HTTP_COUNTERS.iter().map(|name| (name.to_string(), self.count(name))));
        http.push(("v3".into(), self.count("v3")));
        http.push(("request.length".into(), mean(&values.request_lengths)));

        let mut upstream: Vec<(String, f64)> = Vec::new();
        upstream.extend(WindowStats::compute(&values.connect_times).samples("upstream.connect.time"));
        upstream.extend(WindowStats::compute(&values.header_times).samples("upstream.header.time"));
        upstream.extend(WindowStats::compute(&values.response_times).samples("upstream.response.time"));
        upstream.push(("upstream.response.length".into(), mean(&values.response_lengths)));
        upstream.extend(UPSTREAM_COUNTERS.iter().map(|name| (name.to_string(), self.count(name))));
        self.counters.clear();

        let mut metrics = NamedMetric::new(NS_NGINX, "http").convert(http.iter().map(|(n, v)| (n.as_str(), *v)));
        metrics.extend(NamedMetric::new(NS_NGINX, "").convert(upstream.iter().map(|(n, v)| (n.as_str(), *v))));
        metrics
    }
}

// ----------------------------------------------------------------------------
// 14.3 Access Log Source
// ----------------------------------------------------------------------------

fn access_factory() -> ParserFactory {
    Arc::new(|path: &str, format: &str, nginx_type: &str| -> SourceResult<Box<dyn WindowParser>> {
        let compiled = AccessLogFormat::compile(format)?;
        debug!(
            target: "nginx_telemetry::source::access_log",
            path,
            format,
            pattern = compiled.as_str(),
            "Compiled access log format"
        );
        Ok(Box::new(AccessWindow::new(compiled, nginx_type)))
    })
}

pub(crate) fn nginx_type_of(config: &NginxCollectorConfig) -> &'static str {
    if config.is_plus() {
        NGINX_TYPE_PLUS
    } else {
        NGINX_TYPE_OSS
    }
}

/// Windowed metrics from every access log of one instance.
pub struct NginxAccessLog {
    watchers: Mutex<LogWatchers>,
}

impl NginxAccessLog {
    pub fn new(config: &NginxCollectorConfig) -> Self {
        Self::with_watchers(
            LogWatchers::new("access", access_factory(), config.collection_interval, nginx_type_of(config)),
            &config.access_logs,
            config,
        )
    }

    pub(crate) fn with_watchers(
        mut watchers: LogWatchers,
        files: &BTreeMap<String, String>,
        config: &NginxCollectorConfig,
    ) -> Self {
        watchers.reconcile(files, config.collection_interval, nginx_type_of(config));
        Self {
            watchers: Mutex::new(watchers),
        }
    }

    pub fn watched(&self) -> Vec<String> {
        self.watchers.lock().watched()
    }
}

#[async_trait]
impl Source for NginxAccessLog {
    fn name(&self) -> &'static str {
        "nginx_access_log"
    }

    async fn collect(&self, ctx: &SourceContext) -> SourceResult<()> {
        let buffer = self.watchers.lock().buffer();
        buffer.deliver(ctx).await;
        Ok(())
    }

    async fn update(&self, config: &NginxCollectorConfig) {
        self.watchers
            .lock()
            .reconcile(&config.access_logs, config.collection_interval, nginx_type_of(config));
    }

    async fn stop(&self) {
        self.watchers.lock().stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::model::CommonDim;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const COMBINED: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent" "$http_x_forwarded_for""#;

    const FULL: &str = r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$http_referer" "$http_user_agent" "$http_x_forwarded_for" "$bytes_sent" "$request_length" "$request_time" "$gzip_ratio" "$server_protocol" "$upstream_connect_time" "$upstream_header_time" "$upstream_response_length" "$upstream_response_time" "$upstream_status" "$upstream_cache_status""#;

    const FULL_LINES: [&str; 14] = [
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"GET /nginx_status HTTP/1.1\" 200 98 \"-\" \"Go-http-client/1.1\" \"-\" \"150\" \"105\" \"0.100\" \"10\" \"HTTP/1.1\" \"350\" \"500\" \"28\" \"0.00\" \"200\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"POST /nginx_status HTTP/1.1\" 201 98 \"-\" \"Go-http-client/1.1\" \"-\" \"250\" \"110\" \"0.300\" \"20\" \"HTTP/1.1\" \"350\" \"730\" \"28\" \"0.01\" \"201\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"GET /nginx_status HTTP/1.1\" 200 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"350\" \"500\" \"28\" \"0.00\" \"200\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"DELETE /nginx_status HTTP/1.1\" 400 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"350\" \"500\" \"28\" \"0.03\" \"400\" \"MISS\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"DELETE /nginx_status HTTP/1.1\" 403 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"100\" \"500\" \"28\" \"0.00\" \"403\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"HEAD /nginx_status HTTP/1.1\" 404 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"350\" \"505\" \"28\" \"0.00\" \"404\" \"MISS\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"PUT /nginx_status HTTP/1.1\" 499 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"350\" \"2000\" \"28\" \"0.00\" \"-\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"PUT /nginx_status HTTP/1.1\" 500 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"2350\" \"250\" \"28\" \"0.02\" \"500\" \"UPDATING\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"OPTIONS /nginx_status HTTP/1.0\" 502 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.0\" \"350\" \"500\" \"28\" \"0.01\" \"502\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"OPTIONS /nginx_status HTTP/2\" 503 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/2\" \"350\" \"500\" \"28\" \"0.00\" \"503\" \"HIT\" \n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"OPTIONS /nginx_status HTTP/0.9\" 504 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/0.9\" \"350\" \"590\" \"28\" \"0.00\" \"502\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"OPTIONS /nginx_status HTTP/1.1\" 502 98 \"-\" \"Go-http-client/1.1\" \"-\" \"200\" \"100\" \"0.200\" \"-\" \"HTTP/1.1\" \"900\" \"500\" \"28\" \"0.00\" \"200\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"TRACE /nginx_status HTTP/1.1\" 200 98 \"-\" \"Go-http-client/1.1\" \"-\" \"150\" \"105\" \"0.100\" \"-\" \"HTTP/1.1\" \"350\" \"170\" \"28\" \"0.00\" \"200\" \"HIT\"\n",
        "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"TRACE /nginx_status HTTP/1.1\" 200 98 \"-\" \"Go-http-client/1.1\" \"-\" \"150\" \"105\" \"0.100\" \"-\" \"HTTP/1.1\" \"350\" \"500\" \"28\" \"0.00\" \"200\" \"HIT\"\n",
    ];

    fn window(format: &str, nginx_type: &str, lines: &[&str]) -> HashMap<String, f64> {
        let mut window = AccessWindow::new(AccessLogFormat::compile(format).unwrap(), nginx_type);
        for line in lines {
            window.ingest(line);
        }
        window.flush().into_iter().map(|m| (m.name, m.value)).collect()
    }

    fn assert_close(metrics: &HashMap<String, f64>, name: &str, expected: f64) {
        let actual = metrics[name];
        assert!((actual - expected).abs() < 1e-9, "{}: {} != {}", name, actual, expected);
    }

    #[test]
    fn test_compile_combined_format() {
        let format = AccessLogFormat::compile(COMBINED).unwrap();
        let caps = format
            .captures(r#"127.0.0.1 - - [04/Nov/2020:19:40:38 +0000] "GET /500 HTTP/1.1" 500 4 "-" "curl/7.64.1" "-""#)
            .unwrap();
        assert_eq!(&caps["remote_addr"], "127.0.0.1");
        assert_eq!(&caps["time_local"], "04/Nov/2020:19:40:38 +0000");
        assert_eq!(&caps["request"], "GET /500 HTTP/1.1");
        assert_eq!(&caps["status"], "500");
        assert_eq!(&caps["http_user_agent"], "curl/7.64.1");
    }

    #[test]
    fn test_compile_escapes_literals_and_repeats() {
        let format = AccessLogFormat::compile("$status (${status}) $request_time*").unwrap();
        let caps = format.captures("200 (200) 0.5*").unwrap();
        assert_eq!(&caps["status"], "200");
        assert_eq!(&caps["request_time"], "0.5");
        assert!(format.captures("200 [200] 0.5*").is_none());
    }

    #[test]
    fn test_full_format_window() {
        let m = window(FULL, NGINX_TYPE_OSS, &FULL_LINES);

        assert_close(&m, "nginx.http.gzip.ratio", 15.0);
        assert_close(&m, "nginx.http.request.body_bytes_sent", 1372.0);
        assert_close(&m, "nginx.http.request.bytes_sent", 2700.0);
        assert_close(&m, "nginx.http.request.length", 101.78571428571429);
        assert_close(&m, "nginx.http.request.malformed", 1.0);
        assert_close(&m, "nginx.http.request.time", 0.18571428571428572);
        assert_close(&m, "nginx.http.request.time.count", 14.0);
        assert_close(&m, "nginx.http.request.time.median", 0.2);
        assert_close(&m, "nginx.http.request.time.max", 0.3);
        assert_close(&m, "nginx.http.request.time.pctl95", 0.2);

        for (method, count) in [("get", 2.0), ("post", 1.0), ("delete", 2.0), ("put", 2.0), ("head", 1.0), ("options", 4.0), ("others", 2.0)] {
            assert_close(&m, &format!("nginx.http.method.{}", method), count);
        }
        for (status, count) in [
            ("1xx", 0.0),
            ("2xx", 5.0),
            ("3xx", 0.0),
            ("4xx", 4.0),
            ("5xx", 5.0),
            ("403", 1.0),
            ("404", 1.0),
            ("500", 1.0),
            ("502", 2.0),
            ("503", 1.0),
            ("504", 1.0),
            ("discarded", 1.0),
        ] {
            assert_close(&m, &format!("nginx.http.status.{}", status), count);
        }
        for (version, count) in [("v0_9", 1.0), ("v1_0", 1.0), ("v1_1", 11.0), ("v2", 1.0), ("v3", 0.0)] {
            assert_close(&m, &format!("nginx.http.{}", version), count);
        }

        assert_close(&m, "nginx.upstream.connect.time", 514.2857142857143);
        assert_close(&m, "nginx.upstream.connect.time.count", 14.0);
        assert_close(&m, "nginx.upstream.connect.time.max", 2350.0);
        assert_close(&m, "nginx.upstream.connect.time.median", 350.0);
        assert_close(&m, "nginx.upstream.connect.time.pctl95", 900.0);
        assert_close(&m, "nginx.upstream.header.time", 588.9285714285714);
        assert_close(&m, "nginx.upstream.header.time.max", 2000.0);
        assert_close(&m, "nginx.upstream.header.time.median", 500.0);
        assert_close(&m, "nginx.upstream.header.time.pctl95", 730.0);
        assert_close(&m, "nginx.upstream.response.time", 0.005);
        assert_close(&m, "nginx.upstream.response.time.max", 0.03);
        assert_close(&m, "nginx.upstream.response.time.median", 0.0);
        assert_close(&m, "nginx.upstream.response.time.pctl95", 0.02);
        assert_close(&m, "nginx.upstream.response.length", 28.0);
        assert_close(&m, "nginx.upstream.status.2xx", 6.0);
        assert_close(&m, "nginx.upstream.status.4xx", 3.0);
        assert_close(&m, "nginx.upstream.status.5xx", 4.0);
        assert_close(&m, "nginx.cache.hit", 11.0);
        assert_close(&m, "nginx.cache.miss", 2.0);
        assert_close(&m, "nginx.cache.updating", 1.0);
    }

    #[test]
    fn test_combined_format_window() {
        let m = window(
            COMBINED,
            NGINX_TYPE_OSS,
            &[
                "127.0.0.1 - - [19/May/2022:09:30:39 +0000] \"GET /nginx_status HTTP/1.1\" 200 98 \"-\" \"Go-http-client/1.1\" \"-\"\n",
                r#"127.0.0.1 - - [19/May/2022:09:30:39 +0000] "GET /user/register?ahref<Script>p' or 's' = 's</Script> HTTP/1.1" 200 98 "-" "-" "-""#,
            ],
        );
        assert_close(&m, "nginx.http.request.body_bytes_sent", 196.0);
        assert_close(&m, "nginx.http.method.get", 2.0);
        assert_close(&m, "nginx.http.status.2xx", 2.0);
        assert_close(&m, "nginx.http.v1_1", 2.0);
        assert_close(&m, "nginx.http.gzip.ratio", 0.0);
        assert_close(&m, "nginx.http.request.time.count", 0.0);
        assert_close(&m, "nginx.upstream.connect.time.count", 0.0);
    }

    #[test]
    fn test_plus_skips_status_counters() {
        let m = window(FULL, NGINX_TYPE_PLUS, &FULL_LINES);
        assert_close(&m, "nginx.http.status.2xx", 0.0);
        assert_close(&m, "nginx.http.status.discarded", 0.0);
        assert_close(&m, "nginx.http.request.malformed", 0.0);
        assert_close(&m, "nginx.http.method.options", 4.0);
    }

    #[test]
    fn test_bad_request_line_counts_no_method() {
        let m = window(
            COMBINED,
            NGINX_TYPE_OSS,
            &[r#"10.0.0.9 - - [19/May/2022:09:30:39 +0000] "\x16\x03\x01" 400 150 "-" "-" "-""#],
        );
        assert_close(&m, "nginx.http.method.others", 0.0);
        assert_close(&m, "nginx.http.v1_1", 0.0);
        assert_close(&m, "nginx.http.request.malformed", 1.0);
    }

    #[test]
    fn test_window_resets_after_flush() {
        let mut window = AccessWindow::new(AccessLogFormat::compile(FULL).unwrap(), NGINX_TYPE_OSS);
        window.ingest(FULL_LINES[0]);
        window.flush();
        let second: HashMap<String, f64> = window.flush().into_iter().map(|m| (m.name, m.value)).collect();
        assert_close(&second, "nginx.http.method.get", 0.0);
        assert_close(&second, "nginx.http.request.time.count", 0.0);
    }

    #[test]
    fn test_multi_upstream_values() {
        let mut times = Vec::new();
        push_times(&mut times, Some("0.010, 0.020 : -"));
        assert_eq!(times, vec![0.010, 0.020, 0.0]);
    }

    #[test]
    fn test_every_emitted_name_is_catalogued() {
        for name in window(FULL, NGINX_TYPE_OSS, &FULL_LINES).keys() {
            assert!(catalog::lookup(name).is_some(), "uncatalogued: {}", name);
        }
    }

    #[tokio::test]
    async fn test_two_request_times_end_to_end() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("access.log");
        std::fs::write(&path, "").unwrap();
        let path = path.to_string_lossy().into_owned();

        let config = NginxCollectorConfig {
            collection_interval: Duration::from_secs(1),
            access_logs: BTreeMap::from([(
                path.clone(),
                r#"$remote_addr - $remote_user [$time_local] "$request" $status $body_bytes_sent "$request_time""#.to_string(),
            )]),
            ..NginxCollectorConfig::default()
        };
        let watchers = LogWatchers::new("access", access_factory(), config.collection_interval, NGINX_TYPE_OSS)
            .with_poll_interval(Duration::from_millis(10));
        let source = NginxAccessLog::with_watchers(watchers, &config.access_logs, &config);
        assert_eq!(source.watched(), vec![path.clone()]);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(
            b"10.0.0.1 - - [19/May/2022:09:30:39 +0000] \"GET / HTTP/1.1\" 200 10 \"0.1\"\n\
              10.0.0.1 - - [19/May/2022:09:30:39 +0000] \"GET / HTTP/1.1\" 200 10 \"0.3\"\n",
        )
        .unwrap();

        let (tx, rx) = flume::unbounded();
        let ctx = SourceContext::new(Arc::new(CommonDim::default()), CancellationToken::new(), tx);
        let mut found = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            source.collect(&ctx).await.unwrap();
            found = rx
                .drain()
                .find(|e| e.metric("nginx.http.request.time.count").unwrap_or_default() > 0.0);
            if found.is_some() {
                break;
            }
        }
        source.stop().await;

        let entity = found.expect("no window with request times");
        assert_eq!(entity.metric("nginx.http.request.time.count"), Some(2.0));
        assert!((entity.metric("nginx.http.request.time").unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(entity.metric("nginx.http.request.time.max"), Some(0.3));
        assert!((entity.metric("nginx.http.request.time.median").unwrap() - 0.2).abs() < 1e-12);
        assert_eq!(entity.overrides.published_api.as_deref(), Some(path.as_str()));
    }
}
