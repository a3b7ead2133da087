pub mod management;

use crate::dispatcher::Dispatcher;
use crate::proxy::{self, BoxBody, RouteFn};
use crate::registry::Registry;
use anyhow::Result;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info};

/// Shared gateway state, cheaply cloneable. A `None` registry disables the
/// management endpoints (they answer 501).
#[derive(Clone)]
pub struct GatewayState {
    pub registry: Option<Arc<Registry>>,
    pub dispatcher: Arc<Dispatcher>,
    pub route: RouteFn,
}

/// The single gateway listener. `bind` is separate from `serve` so tests can
/// bind port 0 and read the ephemeral address before serving.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl Server {
    pub async fn bind(listen: &str) -> Result<Self> {
        let addr: SocketAddr = listen.parse()?;
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept loop with graceful shutdown: when `shutdown` is notified the
    /// server stops accepting and waits up to `DRAIN_TIMEOUT` for in-flight
    /// connections to finish before returning.
    pub async fn serve(self, state: GatewayState, shutdown: Arc<Notify>) -> Result<()> {
        const DRAIN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

        let active_conns = Arc::new(AtomicI64::new(0));

        loop {
            let accepted = tokio::select! {
                result = self.listener.accept() => result,
                _ = shutdown.notified() => {
                    info!("server: stop accepting new connections, draining...");
                    break;
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(v) => v,
                Err(e) => {
                    error!("server: accept failed, error={}", e);
                    continue;
                }
            };

            active_conns.fetch_add(1, Ordering::Relaxed);
            let state = state.clone();
            let active_conns = active_conns.clone();

            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let state_inner = state.clone();
                let svc = service_fn(move |req: Request<Incoming>| {
                    let state = state_inner.clone();
                    async move { route_request(req, state, peer_addr).await }
                });

                if let Err(e) = auto::Builder::new(TokioExecutor::new())
                    .http1()
                    .keep_alive(true)
                    .http2()
                    .keep_alive_interval(Some(std::time::Duration::from_secs(20)))
                    .serve_connection_with_upgrades(io, svc)
                    .await
                {
                    if !e.to_string().contains("connection closed") {
                        error!(
                            "server: connection error, peer={}, error={}",
                            peer_addr, e
                        );
                    }
                }

                active_conns.fetch_sub(1, Ordering::Relaxed);
            });
        }

        // Drain phase: wait for in-flight connections to finish (or timeout).
        let active = active_conns.load(Ordering::Relaxed);
        if active > 0 {
            info!("server: waiting for {} active connections to drain", active);
            let drain = async {
                while active_conns.load(Ordering::Relaxed) > 0 {
                    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                }
            };
            match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
                Ok(_) => info!("server: all connections drained"),
                Err(_) => info!(
                    "server: drain timeout ({}s), {} connections still active",
                    DRAIN_TIMEOUT.as_secs(),
                    active_conns.load(Ordering::Relaxed)
                ),
            }
        }

        Ok(())
    }
}

/// Top-level request demux: exact management paths first, everything else
/// goes through the route function and the forwarding pipeline.
async fn route_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let req = req.map(|b| b.boxed());
    match req.uri().path() {
        "/register" => Ok(management::handle_register(req, state.registry.as_deref()).await),
        "/services" => Ok(management::handle_services(&req, state.registry.as_deref())),
        _ => proxy::handle_request(req, state, peer_addr).await,
    }
}
