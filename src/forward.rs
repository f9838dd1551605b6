use crate::connection::{BackendHealth, ConnectionGuard, TunnelTracker};
use crate::error::RouteError;
use crate::routes::RouteEntry;
use crate::splice::splice;
use crate::traffic::{TrafficCounters, TrafficRegistry};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, HOST, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_VERSION, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

pub type BoxedBody = BoxBody<Bytes, hyper::Error>;

const MAX_RESPONSE_HEAD: usize = 16 * 1024;
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// How an accepted WebSocket upgrade is carried to the backend.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, clap::ValueEnum)]
pub enum Forwarder {
    /// Replay the client's request, all headers included, through a hyper
    /// client and mirror whatever the backend answers.
    #[default]
    Proxy,
    /// Write a minimal upgrade request by hand and parse the backend's
    /// response head ourselves.
    Handshake,
}

/// State shared by every tunnel the router opens.
#[derive(Debug)]
pub struct TunnelContext {
    pub tracker: Arc<TunnelTracker>,
    pub health: Arc<BackendHealth>,
    pub traffic: Arc<TrafficRegistry>,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
}

/// Result of inspecting the upgrade headers of a request on a route path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpgradeCheck {
    /// No `Upgrade` header at all: answered with 426.
    Missing,
    /// An upgrade we will not forward: answered with 400.
    Invalid(&'static str),
    WebSocket,
}

pub fn classify_upgrade(method: &Method, headers: &HeaderMap) -> UpgradeCheck {
    let Some(upgrade) = headers.get(UPGRADE) else {
        return UpgradeCheck::Missing;
    };
    let is_websocket = upgrade
        .to_str()
        .map(|v| v.trim().eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    if !is_websocket {
        return UpgradeCheck::Invalid("unsupported upgrade protocol");
    }
    if method != Method::GET {
        return UpgradeCheck::Invalid("websocket upgrade requires GET");
    }
    if !headers.contains_key(SEC_WEBSOCKET_KEY) {
        return UpgradeCheck::Invalid("missing Sec-WebSocket-Key");
    }
    let version_ok = headers
        .get(SEC_WEBSOCKET_VERSION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "13")
        .unwrap_or(false);
    if !version_ok {
        return UpgradeCheck::Invalid("unsupported Sec-WebSocket-Version");
    }
    UpgradeCheck::WebSocket
}

impl Forwarder {
    /// Connect `req` to the route's backend and answer the client.
    ///
    /// On `Err` no response is written: the router closes the connection.
    pub async fn forward_upgrade(
        &self,
        req: Request<Incoming>,
        route: &RouteEntry,
        ctx: &TunnelContext,
    ) -> Result<Response<BoxedBody>, RouteError> {
        let addr = route.backend_addr();
        if !ctx.health.is_ready() {
            return Err(RouteError::BackendUnreachable {
                addr,
                reason: "backend not ready".to_string(),
            });
        }

        let guard = ConnectionGuard::try_new(&ctx.tracker)
            .ok_or_else(|| RouteError::Overloaded(ctx.tracker.active_count()))?;
        let tunnel_id = ctx.tracker.next_tunnel_id();
        if ctx.tracker.is_backlog_threshold_exceeded() {
            warn!("High tunnel count: {}", ctx.tracker.active_count());
        }

        let backend = TcpStream::connect(addr)
            .await
            .map_err(|e| RouteError::BackendUnreachable {
                addr,
                reason: e.to_string(),
            })?;
        let _ = backend.set_nodelay(true);

        let tunnel = Tunnel {
            id: tunnel_id,
            path: route.path.clone(),
            counters: ctx.traffic.counters(&route.path),
            idle: ctx.idle_timeout,
            guard,
        };

        match self {
            Forwarder::Proxy => proxy_upgrade(req, backend, tunnel).await,
            Forwarder::Handshake => handshake_upgrade(req, backend, tunnel).await,
        }
    }
}

/// Everything a spawned splice task needs to own.
struct Tunnel {
    id: usize,
    path: String,
    counters: Option<Arc<TrafficCounters>>,
    idle: Option<Duration>,
    guard: ConnectionGuard,
}

impl Tunnel {
    async fn run<C, B>(self, client: C, backend: B)
    where
        C: AsyncRead + AsyncWrite + Unpin,
        B: AsyncRead + AsyncWrite + Unpin,
    {
        let Tunnel {
            id,
            path,
            counters,
            idle,
            mut guard,
        } = self;
        if let Some(c) = &counters {
            c.add_tunnel();
        }
        debug!("Tunnel #{} open on {}", id, path);
        match splice(id, client, backend, idle, counters.as_deref()).await {
            Ok(stats) => debug!(
                "Tunnel #{} on {} closed: {}↑ {}↓ bytes",
                id, path, stats.from_client, stats.from_backend
            ),
            Err(e) => warn!("Tunnel #{} on {} io error: {}", id, path, e),
        }
        guard.decrement();
    }
}

async fn proxy_upgrade(
    mut req: Request<Incoming>,
    backend: TcpStream,
    tunnel: Tunnel,
) -> Result<Response<BoxedBody>, RouteError> {
    let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(backend))
        .await
        .map_err(|e| RouteError::Handshake(e.to_string()))?;
    let tunnel_id = tunnel.id;
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            debug!("Tunnel #{} backend connection error: {:?}", tunnel_id, err);
        }
    });

    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut backend_req = Request::new(Empty::<Bytes>::new());
    *backend_req.method_mut() = req.method().clone();
    *backend_req.uri_mut() = target
        .parse()
        .map_err(|e: http::uri::InvalidUri| RouteError::Handshake(e.to_string()))?;
    *backend_req.version_mut() = Version::HTTP_11;
    *backend_req.headers_mut() = req.headers().clone();

    let mut backend_resp = sender
        .send_request(backend_req)
        .await
        .map_err(|e| RouteError::Handshake(e.to_string()))?;

    if backend_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(
            "Tunnel #{} backend refused upgrade with {}",
            tunnel_id,
            backend_resp.status()
        );
        return Ok(backend_resp.map(|b| b.boxed()));
    }

    let mut client_resp = Response::new(empty());
    *client_resp.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
    *client_resp.headers_mut() = backend_resp.headers().clone();

    tokio::spawn(async move {
        match tokio::try_join!(
            hyper::upgrade::on(&mut req),
            hyper::upgrade::on(&mut backend_resp)
        ) {
            Ok((client, backend)) => {
                tunnel.run(TokioIo::new(client), TokioIo::new(backend)).await;
            }
            Err(e) => warn!("Tunnel #{} upgrade error: {}", tunnel_id, e),
        }
    });

    Ok(client_resp)
}

async fn handshake_upgrade(
    mut req: Request<Incoming>,
    mut backend: TcpStream,
    tunnel: Tunnel,
) -> Result<Response<BoxedBody>, RouteError> {
    let head = build_handshake_request(&req);
    backend
        .write_all(&head)
        .await
        .map_err(|e| RouteError::Handshake(e.to_string()))?;

    let (resp_head, trailing) = tokio::time::timeout(HANDSHAKE_TIMEOUT, read_response_head(&mut backend))
        .await
        .map_err(|_| RouteError::Handshake("timed out waiting for response head".to_string()))??;

    let mut client_resp = Response::new(empty());
    *client_resp.status_mut() = StatusCode::from_u16(resp_head.status)
        .map_err(|_| RouteError::Handshake(format!("invalid status {}", resp_head.status)))?;
    for (name, value) in &resp_head.headers {
        // The body is never relayed, so framing headers would lie.
        if name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        client_resp.headers_mut().append(name.clone(), value.clone());
    }

    if client_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        debug!(
            "Tunnel #{} backend refused upgrade with {}",
            tunnel.id, resp_head.status
        );
        return Ok(client_resp);
    }

    tokio::spawn(async move {
        let tunnel_id = tunnel.id;
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let mut client = TokioIo::new(upgraded);
                if !trailing.is_empty() {
                    if let Err(e) = client.write_all(&trailing).await {
                        debug!("Tunnel #{} early frame write failed: {}", tunnel_id, e);
                        return;
                    }
                    if let Some(c) = &tunnel.counters {
                        c.add_tx(trailing.len() as u64);
                    }
                }
                tunnel.run(client, backend).await;
            }
            Err(e) => warn!("Tunnel #{} upgrade error: {}", tunnel_id, e),
        }
    });

    Ok(client_resp)
}

/// Minimal upgrade request carrying only what a WebSocket backend needs.
pub(crate) fn build_handshake_request<B>(req: &Request<B>) -> Vec<u8> {
    let target = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut head = format!("GET {} HTTP/1.1\r\n", target).into_bytes();

    let headers = req.headers();
    let host = headers
        .get(HOST)
        .cloned()
        .or_else(|| req.uri().authority().and_then(|a| HeaderValue::from_str(a.as_str()).ok()))
        .unwrap_or_else(|| HeaderValue::from_static("localhost"));
    push_header(&mut head, "Host", &host);
    push_header(&mut head, "Upgrade", &HeaderValue::from_static("websocket"));
    push_header(&mut head, "Connection", &HeaderValue::from_static("Upgrade"));
    if let Some(key) = headers.get(SEC_WEBSOCKET_KEY) {
        push_header(&mut head, "Sec-WebSocket-Key", key);
    }
    if let Some(version) = headers.get(SEC_WEBSOCKET_VERSION) {
        push_header(&mut head, "Sec-WebSocket-Version", version);
    }
    head.extend_from_slice(b"\r\n");
    head
}

fn push_header(head: &mut Vec<u8>, name: &str, value: &HeaderValue) {
    head.extend_from_slice(name.as_bytes());
    head.extend_from_slice(b": ");
    head.extend_from_slice(value.as_bytes());
    head.extend_from_slice(b"\r\n");
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub status: u16,
    pub headers: Vec<(HeaderName, HeaderValue)>,
}

/// Read until a full response head is buffered. Returns the head and any
/// bytes the backend sent after it.
async fn read_response_head<S>(stream: &mut S) -> Result<(ResponseHead, Vec<u8>), RouteError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 2048];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| RouteError::Handshake(e.to_string()))?;
        if n == 0 {
            return Err(RouteError::Handshake(
                "backend closed before response head".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((head, consumed)) = parse_response_head(&buf)? {
            let trailing = buf.split_off(consumed);
            return Ok((head, trailing));
        }
        if buf.len() > MAX_RESPONSE_HEAD {
            return Err(RouteError::Handshake("response head too large".to_string()));
        }
    }
}

pub(crate) fn parse_response_head(buf: &[u8]) -> Result<Option<(ResponseHead, usize)>, RouteError> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut resp = httparse::Response::new(&mut headers);
    match resp.parse(buf) {
        Ok(httparse::Status::Complete(len)) => {
            let status = resp
                .code
                .ok_or_else(|| RouteError::Handshake("missing status code".to_string()))?;
            let headers = resp
                .headers
                .iter()
                .filter_map(|h| {
                    let name = HeaderName::from_bytes(h.name.as_bytes()).ok()?;
                    let value = HeaderValue::from_bytes(h.value).ok()?;
                    Some((name, value))
                })
                .collect();
            Ok(Some((ResponseHead { status, headers }, len)))
        }
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(RouteError::Handshake(format!("malformed response head: {e}"))),
    }
}

/// Log a routing failure at a level matching how unusual it is.
pub fn log_route_error(err: &RouteError) {
    match err {
        RouteError::NoMatch(path) => debug!("Upgrade for unregistered path {}, closing", path),
        RouteError::Overloaded(active) => error!("Tunnel limit reached: {} active", active),
        RouteError::BackendUnreachable { .. } => warn!("{}", err),
        RouteError::Handshake(_) => info!("{}", err),
    }
}

pub fn empty() -> BoxedBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> BoxedBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::CONNECTION;

    fn upgrade_request(version: &str) -> Request<()> {
        Request::builder()
            .method(Method::GET)
            .uri("/vless/sub?ed=2048")
            .header(HOST, "edge.example.com")
            .header(UPGRADE, "WebSocket")
            .header(CONNECTION, "keep-alive, Upgrade")
            .header(SEC_WEBSOCKET_KEY, "dGhlIHNhbXBsZSBub25jZQ==")
            .header(SEC_WEBSOCKET_VERSION, version)
            .header("x-forwarded-for", "203.0.113.7")
            .header("sec-websocket-protocol", "chat")
            .body(())
            .unwrap()
    }

    #[test]
    fn classifies_upgrade_headers() {
        let req = upgrade_request("13");
        assert_eq!(classify_upgrade(req.method(), req.headers()), UpgradeCheck::WebSocket);

        let req = upgrade_request("8");
        assert!(matches!(
            classify_upgrade(req.method(), req.headers()),
            UpgradeCheck::Invalid(_)
        ));

        let mut headers = upgrade_request("13").headers().clone();
        headers.remove(UPGRADE);
        assert_eq!(classify_upgrade(&Method::GET, &headers), UpgradeCheck::Missing);

        let mut headers = upgrade_request("13").headers().clone();
        headers.insert(UPGRADE, HeaderValue::from_static("h2c"));
        assert!(matches!(
            classify_upgrade(&Method::GET, &headers),
            UpgradeCheck::Invalid(_)
        ));

        let headers = upgrade_request("13").headers().clone();
        assert!(matches!(
            classify_upgrade(&Method::POST, &headers),
            UpgradeCheck::Invalid(_)
        ));

        let mut headers = upgrade_request("13").headers().clone();
        headers.remove(SEC_WEBSOCKET_KEY);
        assert!(matches!(
            classify_upgrade(&Method::GET, &headers),
            UpgradeCheck::Invalid(_)
        ));
    }

    #[test]
    fn handshake_request_keeps_only_upgrade_headers() {
        let head = String::from_utf8(build_handshake_request(&upgrade_request("13"))).unwrap();
        assert_eq!(
            head,
            "GET /vless/sub?ed=2048 HTTP/1.1\r\n\
             Host: edge.example.com\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n"
        );
    }

    #[test]
    fn parses_head_and_reports_consumed_length() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n\x81\x02hi";
        let (head, consumed) = parse_response_head(raw).unwrap().unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(head.headers.len(), 2);
        assert_eq!(head.headers[0].0, UPGRADE);
        assert_eq!(&raw[consumed..], b"\x81\x02hi");

        assert!(parse_response_head(b"HTTP/1.1 101 Switching").unwrap().is_none());
        assert!(parse_response_head(b"\x00garbage\r\n\r\n").is_err());
    }

    #[tokio::test]
    async fn reads_head_across_chunks_and_keeps_trailing_bytes() {
        let (mut backend, mut ours) = tokio::io::duplex(64);
        tokio::spawn(async move {
            backend.write_all(b"HTTP/1.1 101 Switching Protocols\r\n").await.unwrap();
            backend.write_all(b"Upgrade: websocket\r\n\r\nearly").await.unwrap();
        });
        let (head, trailing) = read_response_head(&mut ours).await.unwrap();
        assert_eq!(head.status, 101);
        assert_eq!(trailing, b"early");
    }

    #[tokio::test]
    async fn oversized_or_truncated_heads_are_rejected() {
        let (mut backend, mut ours) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            backend.write_all(b"HTTP/1.1 101 OK\r\n").await.unwrap();
            let filler = format!("X-Pad: {}\r\n", "a".repeat(1000));
            for _ in 0..20 {
                if backend.write_all(filler.as_bytes()).await.is_err() {
                    break;
                }
            }
        });
        assert!(matches!(
            read_response_head(&mut ours).await,
            Err(RouteError::Handshake(_))
        ));

        let (backend, mut ours) = tokio::io::duplex(64);
        drop(backend);
        assert!(matches!(
            read_response_head(&mut ours).await,
            Err(RouteError::Handshake(_))
        ));
    }
}
