use crate::balancer::Balancer;
use crate::breaker::BreakerClient;
use crate::error::GatewayError;
use crate::proxy::{empty_body, BoxBody};
use http::StatusCode;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use std::net::SocketAddr;
use std::sync::Arc;

/// Composes instance selection with the breaker-guarded forwarder.
///
/// This is the only place that distinguishes "no backend" from "backend
/// failed": the former becomes a synthesized empty 503 response, the latter
/// surfaces as an error for the caller to translate (502 at the edge).
pub struct Dispatcher {
    balancer: Arc<Balancer>,
    client: Arc<BreakerClient>,
}

impl Dispatcher {
    pub fn new(balancer: Arc<Balancer>, client: Arc<BreakerClient>) -> Self {
        Self { balancer, client }
    }

    pub async fn forward(
        &self,
        service: &str,
        req: Request<BoxBody>,
        peer_addr: SocketAddr,
    ) -> Result<Response<BoxBody>, GatewayError> {
        let Some(instance) = self.balancer.select(service, req.headers(), peer_addr) else {
            let resp = Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .body(empty_body())
                .unwrap();
            return Ok(resp);
        };

        let resp = self.client.request(&instance.addr, req).await?;
        Ok(resp.map(|b| b.boxed()))
    }
}
