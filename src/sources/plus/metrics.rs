//! Conversion of two Plus snapshots into entities.
//!
//! Counters go through the delta engine field by field; a zone, peer or
//! slot missing from the previous snapshot counts from zero. Gauges and
//! peer states are reported as read.

use std::collections::BTreeMap;

use super::{
    HttpCache, LimitConn, LimitReq, LocationZone, Peer, PlusStats, Responses, ServerZone, Slab,
    StreamPeer, StreamServerZone, StreamUpstream, Upstream,
};
use crate::delta::counter_delta;
use crate::model::{DimOverrides, Dimension, NamedMetric, SimpleMetric, StatsEntity};
use crate::sources::{NGINX_TYPE_PLUS, NS_NGINX, NS_PLUS};
use crate::stats::WindowStats;

pub const DIM_SERVER_ZONE: &str = "server_zone";
pub const DIM_LOCATION_ZONE: &str = "location_zone";
pub const DIM_CACHE_ZONE: &str = "cache_zone";
pub const DIM_UPSTREAM: &str = "upstream";
pub const DIM_UPSTREAM_ZONE: &str = "upstream_zone";
pub const DIM_PEER_NAME: &str = "peer.name";
pub const DIM_PEER_ADDRESS: &str = "peer.address";
pub const DIM_SLAB_ZONE: &str = "zone";
pub const DIM_LIMIT_CONN_ZONE: &str = "limit_conn_zone";
pub const DIM_LIMIT_REQ_ZONE: &str = "limit_req_zone";

/// Plus API peer states, in reporting order.
pub const PEER_STATES: [&str; 6] = ["up", "draining", "down", "unavail", "checking", "unhealthy"];

#[inline]
fn d(current: u64, previous: u64) -> f64 {
    counter_delta(current, previous) as f64
}

fn bool_value(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

/// Peers are matched across polls by `server-service-name`.
fn peer_key(server: &str, service: &str, name: &str) -> String {
    format!("{}-{}-{}", server, service, name)
}

struct Emitter {
    overrides: DimOverrides,
    entities: Vec<StatsEntity>,
}

impl Emitter {
    fn push(&mut self, dimensions: Vec<Dimension>, metrics: Vec<SimpleMetric>) {
        if !metrics.is_empty() {
            self.entities
                .push(StatsEntity::new(dimensions, metrics).with_overrides(self.overrides.clone()));
        }
    }
}

/// All entities for one poll. `previous` is `current` on the first poll.
pub fn convert(current: &PlusStats, previous: &PlusStats, endpoint: &str) -> Vec<StatsEntity> {
    let mut out = Emitter {
        overrides: DimOverrides::default()
            .published_api(endpoint)
            .nginx_type(NGINX_TYPE_PLUS)
            .build(current.nginx.build.as_str(), current.nginx.version.as_str()),
        entities: Vec::new(),
    };

    instance(&mut out, current, previous);
    common(&mut out, current, previous);
    ssl(&mut out, current, previous);
    server_zones(&mut out, &current.server_zones, &previous.server_zones);
    location_zones(&mut out, &current.location_zones, &previous.location_zones);
    stream_server_zones(&mut out, &current.stream_server_zones, &previous.stream_server_zones);
    caches(&mut out, &current.caches, &previous.caches);
    http_upstreams(&mut out, &current.upstreams, &previous.upstreams);
    stream_upstreams(&mut out, &current.stream_upstreams, &previous.stream_upstreams);
    slabs(&mut out, &current.slabs, &previous.slabs);
    limit_conns(&mut out, &current.limit_conns, &previous.limit_conns);
    limit_reqs(&mut out, &current.limit_reqs, &previous.limit_reqs);

    out.entities
}

// ----------------------------------------------------------------------------
// 12.3 Instance, Connections & SSL
// ----------------------------------------------------------------------------

fn instance(out: &mut Emitter, current: &PlusStats, previous: &PlusStats) {
    let metrics = NamedMetric::new(NS_NGINX, "").convert([
        ("status", 1.0),
        ("config.generation", d(current.nginx.generation, previous.nginx.generation)),
    ]);
    out.push(Vec::new(), metrics);
}

fn common(out: &mut Emitter, current: &PlusStats, previous: &PlusStats) {
    let conn = &current.connections;
    let prev = &previous.connections;
    let metrics = NamedMetric::new(NS_NGINX, "http").convert([
        ("conn.accepted", d(conn.accepted, prev.accepted)),
        ("conn.active", conn.active as f64),
        ("conn.current", (conn.active + conn.idle) as f64),
        ("conn.dropped", d(conn.dropped, prev.dropped)),
        ("conn.idle", conn.idle as f64),
        ("request.current", current.http_requests.current as f64),
        ("request.count", d(current.http_requests.total, previous.http_requests.total)),
    ]);
    out.push(Vec::new(), metrics);
}

fn ssl(out: &mut Emitter, current: &PlusStats, previous: &PlusStats) {
    let (ssl, prev) = (&current.ssl, &previous.ssl);
    let metrics = NamedMetric::new(NS_PLUS, "").convert([
        ("ssl.handshakes", d(ssl.handshakes, prev.handshakes)),
        ("ssl.failed", d(ssl.handshakes_failed, prev.handshakes_failed)),
        ("ssl.reuses", d(ssl.session_reuses, prev.session_reuses)),
    ]);
    out.push(Vec::new(), metrics);
}

// ----------------------------------------------------------------------------
// 12.4 Zones & Caches
// ----------------------------------------------------------------------------

fn status_buckets(cur: &Responses, prev: &Responses) -> [(&'static str, f64); 5] {
    [
        ("status.1xx", d(cur.r1xx, prev.r1xx)),
        ("status.2xx", d(cur.r2xx, prev.r2xx)),
        ("status.3xx", d(cur.r3xx, prev.r3xx)),
        ("status.4xx", d(cur.r4xx, prev.r4xx)),
        ("status.5xx", d(cur.r5xx, prev.r5xx)),
    ]
}

fn server_zones(
    out: &mut Emitter,
    current: &BTreeMap<String, ServerZone>,
    previous: &BTreeMap<String, ServerZone>,
) {
    let named = NamedMetric::new(NS_PLUS, "http");
    for (name, zone) in current {
        let prev = previous.get(name).copied().unwrap_or_default();
        let mut samples = vec![
            ("request.count", d(zone.requests, prev.requests)),
            ("response.count", d(zone.responses.total, prev.responses.total)),
            ("status.discarded", d(zone.discarded, prev.discarded)),
            ("status.processing", zone.processing as f64),
            ("request.bytes_rcvd", d(zone.received, prev.received)),
            ("request.bytes_sent", d(zone.sent, prev.sent)),
        ];
        samples.extend(status_buckets(&zone.responses, &prev.responses));
        out.push(vec![Dimension::new(DIM_SERVER_ZONE, name)], named.convert(samples));
    }
}

fn location_zones(
    out: &mut Emitter,
    current: &BTreeMap<String, LocationZone>,
    previous: &BTreeMap<String, LocationZone>,
) {
    let named = NamedMetric::new(NS_PLUS, "http");
    for (name, zone) in current {
        let prev = previous.get(name).copied().unwrap_or_default();
        let mut samples = vec![
            ("request.count", d(zone.requests, prev.requests)),
            ("response.count", d(zone.responses.total, prev.responses.total)),
            ("status.discarded", d(zone.discarded, prev.discarded)),
            ("request.bytes_rcvd", d(zone.received, prev.received)),
            ("request.bytes_sent", d(zone.sent, prev.sent)),
        ];
        samples.extend(status_buckets(&zone.responses, &prev.responses));
        out.push(vec![Dimension::new(DIM_LOCATION_ZONE, name)], named.convert(samples));
    }
}

fn stream_server_zones(
    out: &mut Emitter,
    current: &BTreeMap<String, StreamServerZone>,
    previous: &BTreeMap<String, StreamServerZone>,
) {
    let named = NamedMetric::new(NS_PLUS, "stream");
    for (name, zone) in current {
        let prev = previous.get(name).copied().unwrap_or_default();
        let metrics = named.convert([
            ("connections", d(zone.connections, prev.connections)),
            ("discarded", d(zone.discarded, prev.discarded)),
            ("processing", zone.processing as f64),
            ("bytes_rcvd", d(zone.received, prev.received)),
            ("bytes_sent", d(zone.sent, prev.sent)),
            ("status.2xx", d(zone.sessions.s2xx, prev.sessions.s2xx)),
            ("status.4xx", d(zone.sessions.s4xx, prev.sessions.s4xx)),
            ("status.5xx", d(zone.sessions.s5xx, prev.sessions.s5xx)),
            ("status.total", d(zone.sessions.total, prev.sessions.total)),
        ]);
        out.push(vec![Dimension::new(DIM_SERVER_ZONE, name)], metrics);
    }
}

fn caches(out: &mut Emitter, current: &BTreeMap<String, HttpCache>, previous: &BTreeMap<String, HttpCache>) {
    let named = NamedMetric::new(NS_PLUS, "cache");
    for (name, cache) in current {
        let prev = previous.get(name).copied().unwrap_or_default();
        let mut samples: Vec<(String, f64)> = vec![
            ("size".into(), cache.size as f64),
            ("max_size".into(), cache.max_size as f64),
        ];
        let classes = [
            ("bypass", cache.bypass, prev.bypass),
            ("expired", cache.expired, prev.expired),
            ("hit", cache.hit, prev.hit),
            ("miss", cache.miss, prev.miss),
            ("revalidated", cache.revalidated, prev.revalidated),
            ("stale", cache.stale, prev.stale),
            ("updating", cache.updating, prev.updating),
        ];
        for (class, cur, before) in classes {
            samples.push((format!("{}.responses", class), d(cur.responses, before.responses)));
            samples.push((format!("{}.bytes", class), d(cur.bytes, before.bytes)));
        }
        let metrics = named.convert(samples.iter().map(|(n, v)| (n.as_str(), *v)));
        out.push(vec![Dimension::new(DIM_CACHE_ZONE, name)], metrics);
    }
}

// ----------------------------------------------------------------------------
// 12.5 Upstreams
// ----------------------------------------------------------------------------

fn state_samples(state: &str) -> impl Iterator<Item = (String, f64)> + '_ {
    PEER_STATES
        .iter()
        .map(move |s| (format!("state.{}", s), bool_value(*s == state)))
}

fn state_totals<'a, I>(states: I) -> Vec<(String, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut totals = [0u64; PEER_STATES.len()];
    for state in states {
        if let Some(i) = PEER_STATES.iter().position(|s| *s == state) {
            totals[i] += 1;
        }
    }
    PEER_STATES
        .iter()
        .zip(totals)
        .map(|(s, n)| (format!("total.{}", s), n as f64))
        .collect()
}

fn upstream_dims(name: &str, zone: &str) -> Vec<Dimension> {
    vec![Dimension::new(DIM_UPSTREAM, name), Dimension::new(DIM_UPSTREAM_ZONE, zone)]
}

fn peer_dims(name: &str, zone: &str, peer_name: &str, server: &str) -> Vec<Dimension> {
    let mut dims = upstream_dims(name, zone);
    dims.push(Dimension::new(DIM_PEER_NAME, peer_name));
    dims.push(Dimension::new(DIM_PEER_ADDRESS, server));
    dims
}

fn as_metrics(named: NamedMetric<'_>, samples: &[(String, f64)]) -> Vec<SimpleMetric> {
    named.convert(samples.iter().map(|(n, v)| (n.as_str(), *v)))
}

fn http_peer_samples(peer: &Peer, prev: &Peer) -> Vec<(String, f64)> {
    let mut samples: Vec<(String, f64)> = vec![("conn.active".into(), peer.active as f64)];
    if let Some(t) = peer.header_time {
        samples.push(("header_time".into(), t as f64));
    }
    if let Some(t) = peer.response_time {
        samples.push(("response.time".into(), t as f64));
    }
    samples.extend([
        ("request.count".into(), d(peer.requests, prev.requests)),
        ("response.count".into(), d(peer.responses.total, prev.responses.total)),
    ]);
    samples.extend(
        status_buckets(&peer.responses, &prev.responses)
            .into_iter()
            .map(|(n, v)| (n.to_string(), v)),
    );
    samples.extend([
        ("bytes_sent".into(), d(peer.sent, prev.sent)),
        ("bytes_rcvd".into(), d(peer.received, prev.received)),
        ("fails".into(), d(peer.fails, prev.fails)),
        ("unavail".into(), d(peer.unavail, prev.unavail)),
        ("health_checks.fails".into(), d(peer.health_checks.fails, prev.health_checks.fails)),
        (
            "health_checks.unhealthy".into(),
            d(peer.health_checks.unhealthy, prev.health_checks.unhealthy),
        ),
        ("health_checks.checks".into(), d(peer.health_checks.checks, prev.health_checks.checks)),
    ]);
    samples.extend(state_samples(&peer.state));
    samples
}

fn http_upstreams(
    out: &mut Emitter,
    current: &BTreeMap<String, Upstream>,
    previous: &BTreeMap<String, Upstream>,
) {
    let peer_metric = NamedMetric::new(NS_PLUS, "http.upstream.peers");
    let upstream_metric = NamedMetric::new(NS_PLUS, "http.upstream");

    for (name, upstream) in current {
        let prev_peers: BTreeMap<String, &Peer> = previous
            .get(name)
            .map(|u| {
                u.peers
                    .iter()
                    .map(|p| (peer_key(&p.server, &p.service, &p.name), p))
                    .collect()
            })
            .unwrap_or_default();

        for peer in &upstream.peers {
            let empty = Peer::default();
            let prev = prev_peers
                .get(&peer_key(&peer.server, &peer.service, &peer.name))
                .copied()
                .unwrap_or(&empty);
            out.push(
                peer_dims(name, &upstream.zone, &peer.name, &peer.server),
                as_metrics(peer_metric, &http_peer_samples(peer, prev)),
            );
        }

        let prev_queue = previous.get(name).map(|u| u.queue).unwrap_or_default();
        let mut samples: Vec<(String, f64)> = vec![
            ("keepalives".into(), upstream.keepalive as f64),
            ("zombies".into(), upstream.zombies as f64),
            ("queue.maxsize".into(), upstream.queue.max_size as f64),
            ("queue.overflows".into(), d(upstream.queue.overflows, prev_queue.overflows)),
            ("queue.size".into(), upstream.queue.size as f64),
        ];
        samples.extend(
            state_totals(upstream.peers.iter().map(|p| p.state.as_str()))
                .into_iter()
                .map(|(n, v)| (format!("peers.{}", n), v)),
        );

        let response_times: Vec<f64> = upstream.peers.iter().filter_map(|p| p.response_time).map(|t| t as f64).collect();
        let header_times: Vec<f64> = upstream.peers.iter().filter_map(|p| p.header_time).map(|t| t as f64).collect();
        samples.extend(WindowStats::compute(&response_times).distribution_samples("peers.response.time"));
        samples.extend(WindowStats::compute(&header_times).distribution_samples("peers.header_time"));

        out.push(upstream_dims(name, &upstream.zone), as_metrics(upstream_metric, &samples));
    }
}

fn stream_peer_samples(peer: &StreamPeer, prev: &StreamPeer) -> Vec<(String, f64)> {
    let mut samples: Vec<(String, f64)> = vec![
        ("conn.active".into(), peer.active as f64),
        ("conn.count".into(), d(peer.connections, prev.connections)),
    ];
    if let Some(t) = peer.connect_time {
        samples.push(("connect_time".into(), t as f64));
    }
    if let Some(t) = peer.first_byte_time {
        samples.push(("ttfb".into(), t as f64));
    }
    if let Some(t) = peer.response_time {
        samples.push(("response.time".into(), t as f64));
    }
    samples.extend([
        ("bytes_sent".into(), d(peer.sent, prev.sent)),
        ("bytes_rcvd".into(), d(peer.received, prev.received)),
        ("fails".into(), d(peer.fails, prev.fails)),
        ("unavail".into(), d(peer.unavail, prev.unavail)),
        ("health_checks.fails".into(), d(peer.health_checks.fails, prev.health_checks.fails)),
        (
            "health_checks.unhealthy".into(),
            d(peer.health_checks.unhealthy, prev.health_checks.unhealthy),
        ),
        ("health_checks.checks".into(), d(peer.health_checks.checks, prev.health_checks.checks)),
    ]);
    samples.extend(state_samples(&peer.state));
    samples
}

fn stream_upstreams(
    out: &mut Emitter,
    current: &BTreeMap<String, StreamUpstream>,
    previous: &BTreeMap<String, StreamUpstream>,
) {
    let peer_metric = NamedMetric::new(NS_PLUS, "stream.upstream.peers");
    let upstream_metric = NamedMetric::new(NS_PLUS, "stream.upstream");

    for (name, upstream) in current {
        let prev_peers: BTreeMap<String, &StreamPeer> = previous
            .get(name)
            .map(|u| {
                u.peers
                    .iter()
                    .map(|p| (peer_key(&p.server, &p.service, &p.name), p))
                    .collect()
            })
            .unwrap_or_default();

        for peer in &upstream.peers {
            let empty = StreamPeer::default();
            let prev = prev_peers
                .get(&peer_key(&peer.server, &peer.service, &peer.name))
                .copied()
                .unwrap_or(&empty);
            out.push(
                peer_dims(name, &upstream.zone, &peer.name, &peer.server),
                as_metrics(peer_metric, &stream_peer_samples(peer, prev)),
            );
        }

        let mut samples: Vec<(String, f64)> = vec![("zombies".into(), upstream.zombies as f64)];
        samples.extend(
            state_totals(upstream.peers.iter().map(|p| p.state.as_str()))
                .into_iter()
                .map(|(n, v)| (format!("peers.{}", n), v)),
        );
        let response_times: Vec<f64> = upstream.peers.iter().filter_map(|p| p.response_time).map(|t| t as f64).collect();
        let connect_times: Vec<f64> = upstream.peers.iter().filter_map(|p| p.connect_time).map(|t| t as f64).collect();
        samples.extend(WindowStats::compute(&response_times).distribution_samples("peers.response.time"));
        samples.extend(WindowStats::compute(&connect_times).distribution_samples("peers.connect_time"));

        out.push(upstream_dims(name, &upstream.zone), as_metrics(upstream_metric, &samples));
    }
}

// ----------------------------------------------------------------------------
// 12.6 Slabs & Limits
// ----------------------------------------------------------------------------

fn slabs(out: &mut Emitter, current: &BTreeMap<String, Slab>, previous: &BTreeMap<String, Slab>) {
    let named = NamedMetric::new(NS_PLUS, "slab");
    for (zone, slab) in current {
        let dims = vec![Dimension::new(DIM_SLAB_ZONE, zone)];
        let total = slab.pages.used + slab.pages.free;
        let pct_used = if total == 0 {
            0.0
        } else {
            (slab.pages.used as f64 / total as f64 * 100.0).round()
        };
        out.push(
            dims.clone(),
            named.convert([
                ("pages.used", slab.pages.used as f64),
                ("pages.free", slab.pages.free as f64),
                ("pages.total", total as f64),
                ("pages.pct_used", pct_used),
            ]),
        );

        let prev_slots = previous.get(zone).map(|s| &s.slots);
        for (size, slot) in &slab.slots {
            let prev = prev_slots.and_then(|s| s.get(size)).copied().unwrap_or_default();
            let samples = [
                (format!("slots.{}.fails", size), d(slot.fails, prev.fails)),
                (format!("slots.{}.free", size), slot.free as f64),
                (format!("slots.{}.reqs", size), d(slot.reqs, prev.reqs)),
                (format!("slots.{}.used", size), slot.used as f64),
            ];
            out.push(dims.clone(), as_metrics(named, &samples));
        }
    }
}

fn limit_conns(
    out: &mut Emitter,
    current: &BTreeMap<String, LimitConn>,
    previous: &BTreeMap<String, LimitConn>,
) {
    let named = NamedMetric::new(NS_PLUS, "http.limit_conns");
    for (zone, limit) in current {
        let prev = previous.get(zone).copied().unwrap_or_default();
        let metrics = named.convert([
            ("passed", d(limit.passed, prev.passed)),
            ("rejected", d(limit.rejected, prev.rejected)),
            ("rejected_dry_run", d(limit.rejected_dry_run, prev.rejected_dry_run)),
        ]);
        out.push(vec![Dimension::new(DIM_LIMIT_CONN_ZONE, zone)], metrics);
    }
}

fn limit_reqs(out: &mut Emitter, current: &BTreeMap<String, LimitReq>, previous: &BTreeMap<String, LimitReq>) {
    let named = NamedMetric::new(NS_PLUS, "http.limit_reqs");
    for (zone, limit) in current {
        let prev = previous.get(zone).copied().unwrap_or_default();
        let metrics = named.convert([
            ("passed", d(limit.passed, prev.passed)),
            ("delayed", d(limit.delayed, prev.delayed)),
            ("rejected", d(limit.rejected, prev.rejected)),
            ("delayed_dry_run", d(limit.delayed_dry_run, prev.delayed_dry_run)),
            ("rejected_dry_run", d(limit.rejected_dry_run, prev.rejected_dry_run)),
        ]);
        out.push(vec![Dimension::new(DIM_LIMIT_REQ_ZONE, zone)], metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::sources::plus::{
        Connections, HealthChecks, HttpRequests, NginxInfo, Queue, SlabPages, SlabSlot,
    };
    use pretty_assertions::assert_eq;

    fn peer(server: &str, state: &str, requests: u64, response_time: Option<u64>) -> Peer {
        Peer {
            server: server.into(),
            name: server.into(),
            state: state.into(),
            active: 3,
            requests,
            response_time,
            header_time: response_time.map(|t| t / 2),
            responses: Responses {
                r2xx: requests,
                total: requests,
                ..Responses::default()
            },
            health_checks: HealthChecks::default(),
            ..Peer::default()
        }
    }

    fn snapshot(requests: u64) -> PlusStats {
        let mut stats = PlusStats {
            nginx: NginxInfo {
                version: "1.25.1".into(),
                build: "nginx-plus-r30".into(),
                generation: 2,
            },
            connections: Connections {
                accepted: 1000 + requests,
                dropped: 0,
                active: 5,
                idle: 7,
            },
            http_requests: HttpRequests {
                total: 5000 + requests,
                current: 4,
            },
            ..PlusStats::default()
        };
        stats.server_zones.insert(
            "api".into(),
            ServerZone {
                processing: 2,
                requests,
                responses: Responses {
                    r2xx: requests,
                    total: requests,
                    ..Responses::default()
                },
                ..ServerZone::default()
            },
        );
        stats.upstreams.insert(
            "backend".into(),
            Upstream {
                peers: vec![
                    peer("10.0.0.1:80", "up", requests, Some(10)),
                    peer("10.0.0.2:80", "up", requests * 2, Some(30)),
                    peer("10.0.0.3:80", "unhealthy", 0, None),
                ],
                keepalive: 4,
                zone: "backend_zone".into(),
                queue: Queue {
                    size: 1,
                    max_size: 10,
                    overflows: requests / 10,
                },
                ..Upstream::default()
            },
        );
        stats.slabs.insert(
            "backend_zone".into(),
            Slab {
                pages: SlabPages { used: 1, free: 2 },
                slots: BTreeMap::from([(
                    "8".to_string(),
                    SlabSlot {
                        used: 5,
                        free: 100,
                        reqs: requests,
                        fails: 0,
                    },
                )]),
            },
        );
        stats
    }

    fn find<'a>(entities: &'a [StatsEntity], dim: (&str, &str), metric: &str) -> Option<f64> {
        entities
            .iter()
            .filter(|e| e.dimensions.iter().any(|d| d.name == dim.0 && d.value == dim.1))
            .find_map(|e| e.metric(metric))
    }

    #[test]
    fn test_first_poll_deltas_are_zero() {
        let stats = snapshot(100);
        let entities = convert(&stats, &stats, "http://127.0.0.1/api");

        assert_eq!(entities[0].metric("nginx.status"), Some(1.0));
        assert_eq!(entities[0].metric("nginx.config.generation"), Some(0.0));
        assert_eq!(find(&entities, (DIM_SERVER_ZONE, "api"), "plus.http.request.count"), Some(0.0));
        assert_eq!(find(&entities, (DIM_SERVER_ZONE, "api"), "plus.http.status.processing"), Some(2.0));
        assert!(entities.iter().all(|e| e.overrides.nginx_build.as_deref() == Some("nginx-plus-r30")));
    }

    #[test]
    fn test_zone_and_peer_deltas() {
        let prev = snapshot(100);
        let cur = snapshot(160);
        let entities = convert(&cur, &prev, "http://127.0.0.1/api");

        assert_eq!(entities[1].metric("nginx.http.request.count"), Some(60.0));
        assert_eq!(entities[1].metric("nginx.http.conn.current"), Some(12.0));
        assert_eq!(find(&entities, (DIM_SERVER_ZONE, "api"), "plus.http.status.2xx"), Some(60.0));
        assert_eq!(
            find(&entities, (DIM_PEER_ADDRESS, "10.0.0.2:80"), "plus.http.upstream.peers.request.count"),
            Some(120.0)
        );
        assert_eq!(
            find(&entities, (DIM_PEER_ADDRESS, "10.0.0.1:80"), "plus.http.upstream.peers.conn.active"),
            Some(3.0)
        );
        assert_eq!(
            find(&entities, (DIM_PEER_ADDRESS, "10.0.0.3:80"), "plus.http.upstream.peers.state.unhealthy"),
            Some(1.0)
        );
        assert_eq!(find(&entities, (DIM_SLAB_ZONE, "backend_zone"), "plus.slab.slots.8.reqs"), Some(60.0));
        assert_eq!(find(&entities, (DIM_SLAB_ZONE, "backend_zone"), "plus.slab.pages.pct_used"), Some(33.0));
    }

    #[test]
    fn test_upstream_aggregate() {
        let prev = snapshot(100);
        let cur = snapshot(200);
        let entities = convert(&cur, &prev, "http://127.0.0.1/api");
        let aggregate = entities
            .iter()
            .find(|e| e.dimensions.len() == 2 && e.dimension(DIM_UPSTREAM) == Some("backend"))
            .unwrap();

        assert_eq!(aggregate.dimension(DIM_UPSTREAM_ZONE), Some("backend_zone"));
        assert_eq!(aggregate.metric("plus.http.upstream.keepalives"), Some(4.0));
        assert_eq!(aggregate.metric("plus.http.upstream.queue.overflows"), Some(10.0));
        assert_eq!(aggregate.metric("plus.http.upstream.peers.total.up"), Some(2.0));
        assert_eq!(aggregate.metric("plus.http.upstream.peers.total.unhealthy"), Some(1.0));
        assert_eq!(aggregate.metric("plus.http.upstream.peers.response.time.count"), Some(2.0));
        assert_eq!(aggregate.metric("plus.http.upstream.peers.response.time.max"), Some(30.0));
        assert_eq!(aggregate.metric("plus.http.upstream.peers.response.time.median"), Some(20.0));
    }

    #[test]
    fn test_restarted_peer_takes_current() {
        let prev = snapshot(500);
        let cur = snapshot(20);
        let entities = convert(&cur, &prev, "http://127.0.0.1/api");
        assert_eq!(
            find(&entities, (DIM_PEER_ADDRESS, "10.0.0.1:80"), "plus.http.upstream.peers.request.count"),
            Some(20.0)
        );
    }

    #[test]
    fn test_new_zone_counts_from_zero() {
        let prev = PlusStats::default();
        let mut cur = PlusStats::default();
        cur.limit_reqs.insert(
            "per_ip".into(),
            LimitReq {
                passed: 40,
                rejected: 2,
                ..LimitReq::default()
            },
        );
        let entities = convert(&cur, &prev, "http://127.0.0.1/api");
        assert_eq!(find(&entities, (DIM_LIMIT_REQ_ZONE, "per_ip"), "plus.http.limit_reqs.passed"), Some(40.0));
    }

    #[test]
    fn test_every_emitted_name_is_catalogued() {
        let mut cur = snapshot(10);
        cur.caches.insert("static".into(), HttpCache::default());
        cur.location_zones.insert("/".into(), LocationZone::default());
        cur.stream_server_zones.insert("tcp".into(), StreamServerZone::default());
        cur.stream_upstreams.insert(
            "db".into(),
            StreamUpstream {
                peers: vec![StreamPeer {
                    server: "10.0.1.1:5432".into(),
                    state: "up".into(),
                    connect_time: Some(1),
                    first_byte_time: Some(2),
                    response_time: Some(3),
                    ..StreamPeer::default()
                }],
                ..StreamUpstream::default()
            },
        );
        cur.limit_conns.insert("addr".into(), LimitConn::default());
        cur.limit_reqs.insert("per_ip".into(), LimitReq::default());

        for entity in convert(&cur, &cur, "http://127.0.0.1/api") {
            for metric in &entity.metrics {
                assert!(catalog::lookup(&metric.name).is_some(), "uncatalogued: {}", metric.name);
            }
        }
    }
}
