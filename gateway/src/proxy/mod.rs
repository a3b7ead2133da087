use crate::config::RouteRule;
use crate::server::GatewayState;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Maps an incoming request to a service name; `None` means no route (404).
pub type RouteFn = Arc<dyn Fn(&Request<BoxBody>) -> Option<String> + Send + Sync>;

/// Route function over ordered path-prefix rules; first match wins.
pub fn prefix_router(rules: Vec<RouteRule>) -> RouteFn {
    Arc::new(move |req| {
        let path = req.uri().path();
        rules
            .iter()
            .find(|r| path.starts_with(&r.prefix))
            .map(|r| r.service.clone())
    })
}

/// JSON error response in the gateway's `{"error":"..."}` shape.
pub fn error_response(status: StatusCode, msg: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(full_body(serde_json::json!({ "error": msg }).to_string()))
        .unwrap()
}

/// Forwarding path for everything that is not a management endpoint:
/// route → dispatch → stream the backend response back verbatim.
pub async fn handle_request(
    req: Request<BoxBody>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let Some(service) = (state.route)(&req) else {
        debug!("proxy: no route matched, path={}", path);
        return Ok(error_response(StatusCode::NOT_FOUND, "not found"));
    };

    match state.dispatcher.forward(&service, req, peer_addr).await {
        Ok(resp) => {
            tracing::info!(
                client_ip = %peer_addr.ip(),
                method = %method,
                path = %path,
                status = resp.status().as_u16(),
                service = %service,
                latency_ms = %start.elapsed().as_millis(),
                "access"
            );
            Ok(resp)
        }
        Err(e) => {
            warn!("proxy: forward failed, service={}, error={}", service, e);
            Ok(error_response(StatusCode::BAD_GATEWAY, &e.to_string()))
        }
    }
}
