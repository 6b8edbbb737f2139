//! HTTP surface: operational endpoints plus proxying through the routing table

use anyhow::Result;
use fleet_core::{HealthChecker, ServiceRegistry};
use fleet_proxy::{MetricsCollector, ProxyError, RequestForwarder, RoutingTable};
use fleet_sync::ProxyDiscoveryIntegrator;
use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes, server::conn::http1, service::service_fn, Method, Request, Response, StatusCode,
};
use hyper_util::rt::tokio::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Everything a request handler needs
pub struct GatewayState {
    pub registry: ServiceRegistry,
    pub table: Arc<RoutingTable>,
    pub integrator: Arc<ProxyDiscoveryIntegrator>,
    pub checker: Arc<HealthChecker>,
    pub forwarder: Arc<RequestForwarder>,
    pub metrics: MetricsCollector,
    pub started_at: Instant,
}

/// Accept connections until cancelled
pub async fn serve(
    listener: TcpListener,
    state: Arc<GatewayState>,
    cancel: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("Error accepting connection: {}", e);
                    continue;
                }
            },
        };
        let io = TokioIo::new(stream);
        let state = state.clone();

        tokio::task::spawn(async move {
            let service = service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle_incoming(req, state).await) }
            });

            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                debug!("Error serving HTTP connection from {}: {}", peer_addr, e);
            }
        });
    }
}

async fn handle_incoming(
    req: Request<hyper::body::Incoming>,
    state: Arc<GatewayState>,
) -> Response<Full<Bytes>> {
    let (parts, body) = req.into_parts();
    match body.collect().await {
        Ok(collected) => handle_request(Request::from_parts(parts, collected.to_bytes()), &state).await,
        Err(e) => {
            debug!("Failed to read request body: {}", e);
            text_response(StatusCode::BAD_REQUEST, "Unreadable request body\n")
        }
    }
}

/// Route one buffered request
pub async fn handle_request(req: Request<Bytes>, state: &GatewayState) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    debug!("{} {}", method, path);

    if method == Method::GET {
        match path.as_str() {
            "/health" => return health(state).await,
            "/metrics" => return metrics(state),
            "/routes" => return json_response(StatusCode::OK, &state.table.routes().await),
            "/services" => return services(state).await,
            _ => {}
        }
    }

    proxy(req, &path, state).await
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    uptime_seconds: u64,
    instances: usize,
    routes: usize,
}

async fn health(state: &GatewayState) -> Response<Full<Bytes>> {
    let body = HealthBody {
        status: "ok",
        uptime_seconds: state.started_at.elapsed().as_secs(),
        instances: state.registry.len().await,
        routes: state.table.len().await,
    };
    json_response(StatusCode::OK, &body)
}

fn metrics(state: &GatewayState) -> Response<Full<Bytes>> {
    state.metrics.observe_health(&state.checker.stats());
    match state.metrics.gather() {
        Ok(text) => Response::builder()
            .status(StatusCode::OK)
            .header("Content-Type", "text/plain; version=0.0.4")
            .body(Full::new(Bytes::from(text)))
            .unwrap_or_else(|_| Response::new(Full::new(Bytes::new()))),
        Err(e) => {
            warn!("Failed to gather metrics: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to gather metrics\n")
        }
    }
}

async fn services(state: &GatewayState) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "instances": state.registry.list().await,
        "metrics": state.integrator.service_metrics().await,
        "sync": state.integrator.stats().await,
        "health": state.checker.stats(),
    });
    json_response(StatusCode::OK, &body)
}

async fn proxy(req: Request<Bytes>, path: &str, state: &GatewayState) -> Response<Full<Bytes>> {
    let target = match state.table.resolve(path).await {
        Ok(target) => target,
        Err(e) => {
            debug!("{}", e);
            state.metrics.observe_request("no_route", 0.0);
            return text_response(StatusCode::NOT_FOUND, "No route\n");
        }
    };

    let started = Instant::now();
    let result = state.forwarder.forward(&target, req).await;
    let elapsed = started.elapsed().as_secs_f64();

    let (response, outcome, error) = match result {
        Ok(response) => {
            let status = response.status();
            let (parts, body) = response.into_parts();
            let error = status
                .is_server_error()
                .then(|| format!("upstream answered {}", status));
            let outcome = if error.is_some() { "upstream_error" } else { "success" };
            (Response::from_parts(parts, Full::new(body)), outcome, error)
        }
        Err(e @ ProxyError::UpstreamTimeout(_)) => (
            text_response(StatusCode::GATEWAY_TIMEOUT, "Backend service request timeout\n"),
            "timeout",
            Some(e.to_string()),
        ),
        Err(e) => (
            text_response(StatusCode::BAD_GATEWAY, "Error communicating with backend service\n"),
            "error",
            Some(e.to_string()),
        ),
    };

    state.metrics.observe_request(outcome, elapsed);

    if let Some(instance_id) = &target.instance_id {
        state
            .integrator
            .record_request(instance_id, error.is_none(), error.as_deref())
            .await;
    }

    response
}

fn text_response(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response.headers_mut().insert(
                hyper::header::CONTENT_TYPE,
                hyper::header::HeaderValue::from_static("application/json"),
            );
            response
        }
        Err(e) => {
            warn!("Failed to serialize response: {}", e);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Serialization error\n")
        }
    }
}
