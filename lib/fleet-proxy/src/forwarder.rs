//! HTTP request forwarding to upstream targets with connection pooling

use crate::{ProxyError, Result, Target};
use http_body_util::{BodyExt, Full};
use hyper::{body::Bytes, header::HeaderMap, Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout as tokio_timeout;
use tracing::{debug, warn};

/// Forwards buffered requests to a selected target and buffers the response.
pub struct RequestForwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl RequestForwarder {
    /// Create a new request forwarder with connection pooling
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_keepalive(Some(Duration::from_secs(30)));

        let client = Client::builder(TokioExecutor::new()).build::<_, Full<Bytes>>(connector);

        Self { client, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` to `target`, keeping the original path and query.
    ///
    /// Transport failures map to `Upstream`, an elapsed deadline to
    /// `UpstreamTimeout`. Any response the backend produces is returned as-is.
    pub async fn forward(&self, target: &Target, request: Request<Bytes>) -> Result<Response<Bytes>> {
        let (mut parts, body) = request.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let upstream = format!("{}{}", target.url, path_and_query);
        let uri = upstream.parse::<Uri>().map_err(|e| ProxyError::InvalidTarget {
            url: upstream.clone(),
            reason: e.to_string(),
        })?;

        if uri.scheme_str() != Some("http") {
            warn!("Unsupported upstream scheme for {}", upstream);
            return Err(ProxyError::Upstream {
                url: upstream,
                reason: "only http upstreams are supported".to_string(),
            });
        }

        debug!("Forwarding {} {} to {}", parts.method, path_and_query, upstream);

        parts.headers = Self::filter_headers(&parts.headers);
        // Host must name the upstream, not the gateway
        parts.headers.remove(hyper::header::HOST);
        parts.uri = uri;

        let forwarded = Request::from_parts(parts, Full::new(body));

        match tokio_timeout(self.timeout, self.client.request(forwarded)).await {
            Ok(Ok(response)) => {
                debug!("Backend responded with status: {}", response.status());
                let (parts, body) = response.into_parts();
                let bytes = body
                    .collect()
                    .await
                    .map_err(|e| ProxyError::Upstream {
                        url: upstream.clone(),
                        reason: e.to_string(),
                    })?
                    .to_bytes();
                Ok(Response::from_parts(parts, bytes))
            }
            Ok(Err(e)) => {
                warn!("Backend request error: {}", e);
                Err(ProxyError::Upstream {
                    url: upstream,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                warn!("Backend request timeout after {:?}", self.timeout);
                Err(ProxyError::UpstreamTimeout(upstream))
            }
        }
    }

    fn filter_headers(headers: &HeaderMap) -> HeaderMap {
        let mut filtered = HeaderMap::with_capacity(headers.len());
        for (k, v) in headers.iter() {
            if !Self::is_hop_by_hop_header(k.as_str()) {
                filtered.append(k.clone(), v.clone());
            }
        }
        filtered
    }

    /// Check if header is hop-by-hop (should not be forwarded)
    fn is_hop_by_hop_header(name: &str) -> bool {
        matches!(
            name.to_ascii_lowercase().as_str(),
            "connection"
                | "keep-alive"
                | "proxy-authenticate"
                | "proxy-authorization"
                | "te"
                | "trailers"
                | "transfer-encoding"
                | "upgrade"
        )
    }
}
