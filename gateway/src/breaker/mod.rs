pub mod machine;

pub use machine::{Breaker, BreakerSettings, Counts, State};

use crate::error::GatewayError;
use crate::proxy::{full_body, BoxBody};
use crate::retry::RetryConfig;
use dashmap::DashMap;
use http::header::HOST;
use http::Uri;
use hyper::body::Incoming;
use hyper::{Request, Response};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::Arc;
use std::time::Duration;

pub type ForwardClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

/// HTTP client wrapped in per-target circuit breakers.
///
/// Each distinct target address gets its own breaker, so one unhealthy
/// backend can be isolated without cutting traffic to its siblings. Inside
/// the breaker guard, transport failures are retried with exponential
/// backoff; the whole attempt series counts as a single breaker outcome.
pub struct BreakerClient {
    http: ForwardClient,
    breakers: DashMap<String, Arc<Breaker>>,
    settings: BreakerSettings,
    retry: RetryConfig,
    request_timeout: Duration,
}

impl BreakerClient {
    pub fn new(settings: BreakerSettings, retry: RetryConfig, request_timeout: Duration) -> Self {
        Self {
            http: build_forward_client(),
            breakers: DashMap::new(),
            settings,
            retry,
            request_timeout,
        }
    }

    /// Forward `req` to `target` through that target's breaker.
    ///
    /// An HTTP response of any status (5xx included) is a success at the
    /// breaker level — only transport-class failures count against it.
    pub async fn request(
        &self,
        target: &str,
        req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, GatewayError> {
        let breaker = self.breaker(target);
        let generation = breaker.admit()?;
        let result = self.forward_with_retry(target, req).await;
        breaker.record(generation, result.is_ok());
        result
    }

    fn breaker(&self, target: &str) -> Arc<Breaker> {
        // Fast path: key already exists — no allocation.
        if let Some(entry) = self.breakers.get(target) {
            return entry.value().clone();
        }
        self.breakers
            .entry(target.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(self.settings.clone())))
            .clone()
    }

    /// Buffer the request body once, then attempt the forward up to
    /// `1 + max_retries` times, replaying the buffered body on each attempt.
    async fn forward_with_retry(
        &self,
        target: &str,
        req: Request<BoxBody>,
    ) -> Result<Response<Incoming>, GatewayError> {
        let forward_uri = build_forward_uri(target, req.uri().path(), req.uri().query())?;
        let (parts, body) = req.into_parts();
        let body_bytes = body.collect().await.map_err(GatewayError::Body)?.to_bytes();

        let mut attempt = 0;
        loop {
            let mut builder = Request::builder()
                .method(parts.method.clone())
                .uri(forward_uri.clone());
            for (name, value) in &parts.headers {
                // Host is derived from the forward URI, not the client's.
                if name != &HOST {
                    builder = builder.header(name, value);
                }
            }
            let forward_req = builder
                .body(full_body(body_bytes.clone()))
                .map_err(|e| GatewayError::InvalidTarget(e.to_string()))?;

            let err = match tokio::time::timeout(
                self.request_timeout,
                self.http.request(forward_req),
            )
            .await
            {
                Ok(Ok(resp)) => return Ok(resp),
                Ok(Err(e)) => GatewayError::Upstream(e),
                Err(_) => GatewayError::Timeout,
            };

            if attempt >= self.retry.max_retries {
                return Err(err);
            }
            tracing::debug!(
                "forward: transport error (retrying), target={}, attempt={}/{}, error={}",
                target,
                attempt + 1,
                self.retry.max_retries,
                err
            );
            tokio::time::sleep(self.retry.backoff(attempt + 1)).await;
            attempt += 1;
        }
    }
}

/// Build the forward URL for a target: trim one trailing `/`, default the
/// scheme to `http://`, and overwrite the base's path and query with the
/// incoming request's. The same target written as `localhost:8081`,
/// `http://localhost:8081` or `http://localhost:8081/` forwards identically.
fn build_forward_uri(target: &str, path: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
    let base = target.strip_suffix('/').unwrap_or(target);
    let base = if base.starts_with("http://") || base.starts_with("https://") {
        base.to_string()
    } else {
        format!("http://{}", base)
    };
    let parsed: Uri = base
        .parse()
        .map_err(|e: http::uri::InvalidUri| GatewayError::InvalidTarget(e.to_string()))?;
    let authority = parsed
        .authority()
        .ok_or_else(|| GatewayError::InvalidTarget(format!("no authority in '{}'", target)))?;

    let mut url = format!("{}://{}", parsed.scheme_str().unwrap_or("http"), authority);
    url.push_str(path);
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    url.parse::<Uri>()
        .map_err(|e| GatewayError::InvalidTarget(e.to_string()))
}

/// Client used for all forwarded requests. Supports both `http://` and
/// `https://` targets; TLS uses the webpki root store and HTTP/2 is
/// negotiated via ALPN.
fn build_forward_client() -> ForwardClient {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Client::builder(TokioExecutor::new()).build(https)
}
