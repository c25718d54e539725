use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;

use super::{
    Connections, HttpCache, HttpRequests, LimitConn, LimitReq, LocationZone, NginxInfo, PlusStats,
    ServerZone, Slab, Ssl, StreamServerZone, StreamUpstream, Upstream,
};
use crate::error::{SourceError, SourceResult};
use crate::API_TIMEOUT;

/// Source of Plus API snapshots.
#[async_trait]
pub trait PlusClient: Send + Sync {
    /// Base API URL, reported as `system.published_api`
    fn endpoint(&self) -> &str;

    async fn stats(&self) -> SourceResult<PlusStats>;
}

/// `reqwest` client for `/api/<version>/...`.
pub struct HttpPlusClient {
    base: String,
    version: u32,
    client: reqwest::Client,
}

impl HttpPlusClient {
    pub fn new(base: impl Into<String>, version: u32) -> SourceResult<Self> {
        let base = base.into();
        let client = reqwest::Client::builder()
            .timeout(API_TIMEOUT)
            .gzip(true)
            .build()
            .map_err(|e| SourceError::unreachable(&base, e))?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            version,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}/{}", self.base, self.version, path)
    }

    /// GET one endpoint. Modules the instance was built without answer 404
    /// and decode as empty.
    async fn get<T>(&self, path: &str) -> SourceResult<T>
    where
        T: DeserializeOwned + Default,
    {
        let url = self.url(path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SourceError::unreachable(&url, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(T::default()),
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|e| SourceError::invalid_response(&url, e)),
            status => Err(SourceError::invalid_response(&url, format!("status {}", status))),
        }
    }
}

#[async_trait]
impl PlusClient for HttpPlusClient {
    fn endpoint(&self) -> &str {
        &self.base
    }

    async fn stats(&self) -> SourceResult<PlusStats> {
        let (nginx, connections, http_requests, ssl, slabs, caches, server_zones) = futures::try_join!(
            self.get::<NginxInfo>("nginx"),
            self.get::<Connections>("connections"),
            self.get::<HttpRequests>("http/requests"),
            self.get::<Ssl>("ssl"),
            self.get::<BTreeMap<String, Slab>>("slabs"),
            self.get::<BTreeMap<String, HttpCache>>("http/caches"),
            self.get::<BTreeMap<String, ServerZone>>("http/server_zones"),
        )?;
        let (location_zones, upstreams, stream_server_zones, stream_upstreams, limit_conns, limit_reqs) = futures::try_join!(
            self.get::<BTreeMap<String, LocationZone>>("http/location_zones"),
            self.get::<BTreeMap<String, Upstream>>("http/upstreams"),
            self.get::<BTreeMap<String, StreamServerZone>>("stream/server_zones"),
            self.get::<BTreeMap<String, StreamUpstream>>("stream/upstreams"),
            self.get::<BTreeMap<String, LimitConn>>("http/limit_conns"),
            self.get::<BTreeMap<String, LimitReq>>("http/limit_reqs"),
        )?;

        Ok(PlusStats {
            nginx,
            connections,
            http_requests,
            ssl,
            slabs,
            caches,
            server_zones,
            location_zones,
            upstreams,
            stream_server_zones,
            stream_upstreams,
            limit_conns,
            limit_reqs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::plus::Queue;

    #[test]
    fn test_url_layout() {
        let client = HttpPlusClient::new("http://127.0.0.1:8080/api/", 6).unwrap();
        assert_eq!(client.endpoint(), "http://127.0.0.1:8080/api");
        assert_eq!(client.url("http/upstreams"), "http://127.0.0.1:8080/api/6/http/upstreams");
    }

    #[test]
    fn test_decode_api_documents() {
        let upstreams: BTreeMap<String, Upstream> = serde_json::from_str(
            r#"{"backend":{"peers":[{"id":0,"server":"10.0.0.1:80","name":"10.0.0.1:80","backup":false,
                "weight":1,"state":"up","active":2,"requests":10,"header_time":5,"response_time":7,
                "responses":{"1xx":0,"2xx":9,"3xx":0,"4xx":1,"5xx":0,"codes":{"200":9},"total":10},
                "sent":100,"received":200,"fails":0,"unavail":0,
                "health_checks":{"checks":3,"fails":0,"unhealthy":0},"downtime":0}],
              "keepalive":1,"zombies":0,"zone":"backend"}}"#,
        )
        .unwrap();
        let peer = &upstreams["backend"].peers[0];
        assert_eq!(peer.responses.r2xx, 9);
        assert_eq!(peer.header_time, Some(5));
        assert_eq!(peer.service, "");
        assert_eq!(upstreams["backend"].queue, Queue::default());
    }
}
