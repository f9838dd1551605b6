use crate::error::RouteError;
use crate::forward::{
    classify_upgrade, full, log_route_error, BoxedBody, Forwarder, TunnelContext,
    UpgradeCheck,
};
use crate::routes::RouteTable;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, UPGRADE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// HTTP front door: health endpoints plus WebSocket upgrades on route paths.
pub struct TunnelRouter {
    routes: Arc<RouteTable>,
    forwarder: Forwarder,
    ctx: Arc<TunnelContext>,
}

impl TunnelRouter {
    pub fn new(routes: Arc<RouteTable>, forwarder: Forwarder, ctx: Arc<TunnelContext>) -> Self {
        Self {
            routes,
            forwarder,
            ctx,
        }
    }

    pub async fn handle(&self, req: Request<Incoming>) -> Result<Response<BoxedBody>, RouteError> {
        let path = req.uri().path();

        if path == "/health" {
            return Ok(text(StatusCode::OK, "ok"));
        }
        if path == "/ready" {
            return Ok(if self.ctx.health.is_ready() {
                text(StatusCode::OK, "ready")
            } else {
                text(StatusCode::SERVICE_UNAVAILABLE, "backend not ready")
            });
        }

        let Some(route) = self.routes.lookup(path) else {
            if req.headers().contains_key(UPGRADE) {
                return Err(RouteError::NoMatch(path.to_string()));
            }
            return Ok(text(StatusCode::NOT_FOUND, "not found"));
        };

        match classify_upgrade(req.method(), req.headers()) {
            UpgradeCheck::Missing => {
                let mut resp = text(StatusCode::UPGRADE_REQUIRED, "upgrade required");
                resp.headers_mut()
                    .insert(UPGRADE, HeaderValue::from_static("websocket"));
                Ok(resp)
            }
            UpgradeCheck::Invalid(reason) => {
                debug!("Rejecting upgrade on {}: {}", route.path, reason);
                Ok(text(StatusCode::BAD_REQUEST, reason))
            }
            UpgradeCheck::WebSocket => self.forwarder.forward_upgrade(req, route, &self.ctx).await,
        }
    }

    /// Accept connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("Accept error: {} (continuing)", e);
                        continue;
                    }
                },
            };
            let _ = stream.set_nodelay(true);

            let router = Arc::clone(&self);
            tokio::task::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let router = Arc::clone(&router);
                    async move {
                        let res = router.handle(req).await;
                        if let Err(e) = &res {
                            log_route_error(e);
                        }
                        res
                    }
                });

                if let Err(err) = http1::Builder::new()
                    .preserve_header_case(true)
                    .title_case_headers(true)
                    .serve_connection(io, service)
                    .with_upgrades()
                    .await
                {
                    debug!("Connection from {} ended: {:?}", peer_addr, err);
                }
            });
        }
        info!("Router stopped accepting connections");
    }

    /// Give open tunnels up to `grace` to finish on their own.
    pub async fn drain(&self, grace: Duration) {
        let active = self.ctx.tracker.active_count();
        if active == 0 {
            return;
        }
        info!("Waiting for {} tunnels to close...", active);

        let step = Duration::from_millis(100);
        let deadline = tokio::time::Instant::now() + grace;
        let mut ticks = 0u32;
        while tokio::time::Instant::now() < deadline {
            tokio::time::sleep(step).await;
            let remaining = self.ctx.tracker.active_count();
            if remaining == 0 {
                info!("All tunnels closed gracefully");
                return;
            }
            ticks += 1;
            if ticks % 50 == 0 {
                info!("Still waiting for {} tunnels... ({}s)", remaining, ticks / 10);
            }
        }

        let remaining = self.ctx.tracker.active_count();
        if remaining > 0 {
            warn!("Forced shutdown with {} tunnels still active", remaining);
        }
    }
}

fn text(status: StatusCode, body: &'static str) -> Response<BoxedBody> {
    let mut resp = Response::new(full(body));
    *resp.status_mut() = status;
    resp
}
