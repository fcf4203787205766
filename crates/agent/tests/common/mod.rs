//! Shared fixtures for integration tests: a minimal HTTP responder, a local
//! WebSocket server and a sleeper that counts instead of waiting.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent::files::{PathResolver, TransferExecutor};
use agent::network::{SessionConfig, SessionManager, Sleeper};
use agent::router::CommandDispatcher;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use url::Url;

// =============================================================================
// HTTP responder
// =============================================================================

/// What the HTTP responder answers for a path.
#[derive(Debug, Clone)]
pub enum Route {
    /// 200 with this body.
    Body(Vec<u8>),
    /// 200 with `len` copies of `byte`, written in 64KB pieces.
    Repeat { byte: u8, len: usize },
    /// 200 announcing `declared` bytes but closing after `body`.
    Truncated { declared: usize, body: Vec<u8> },
    /// Empty response with this status.
    Status(u16),
}

/// Serve `routes` on an ephemeral local port. Unknown paths get a 404.
pub async fn spawn_http_server(routes: HashMap<String, Route>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let routes = Arc::new(routes);

    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            let routes = Arc::clone(&routes);
            tokio::spawn(async move {
                let _ = serve_http(socket, &routes).await;
            });
        }
    });

    addr
}

async fn serve_http(mut socket: TcpStream, routes: &HashMap<String, Route>) -> std::io::Result<()> {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = socket.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        head.extend_from_slice(&buf[..n]);
    }

    let head = String::from_utf8_lossy(&head);
    let target = head.split_whitespace().nth(1).unwrap_or("/");
    let path = target.split('?').next().unwrap_or(target).to_string();

    match routes.get(&path) {
        Some(Route::Body(body)) => {
            write_head(&mut socket, 200, body.len()).await?;
            socket.write_all(body).await?;
        }
        Some(Route::Repeat { byte, len }) => {
            write_head(&mut socket, 200, *len).await?;
            let piece = vec![*byte; 64 * 1024];
            let mut remaining = *len;
            while remaining > 0 {
                let n = remaining.min(piece.len());
                socket.write_all(&piece[..n]).await?;
                remaining -= n;
            }
        }
        Some(Route::Truncated { declared, body }) => {
            write_head(&mut socket, 200, *declared).await?;
            socket.write_all(body).await?;
        }
        Some(Route::Status(code)) => write_head(&mut socket, *code, 0).await?,
        None => write_head(&mut socket, 404, 0).await?,
    }

    socket.flush().await?;
    socket.shutdown().await
}

async fn write_head(socket: &mut TcpStream, status: u16, len: usize) -> std::io::Result<()> {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
        status, reason, len
    );
    socket.write_all(head.as_bytes()).await
}

// =============================================================================
// WebSocket server
// =============================================================================

/// Handshake headers seen by the test server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeenHeaders {
    pub authorization: Option<String>,
    pub client_id: Option<String>,
}

/// A local command channel server.
pub struct WsServer {
    pub addr: SocketAddr,
    /// Number of TCP connections accepted.
    pub connections: Arc<AtomicUsize>,
    /// Headers of every handshake, in order.
    pub headers: Arc<Mutex<Vec<SeenHeaders>>>,
}

impl WsServer {
    pub fn url(&self) -> Url {
        Url::parse(&format!("ws://{}/api/ws", self.addr)).unwrap()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

/// Accept WebSocket connections and hand each one to `handler`.
///
/// When `reject_with` is set every handshake is refused with that status.
pub async fn spawn_ws_server<F, Fut>(reject_with: Option<u16>, handler: F) -> WsServer
where
    F: Fn(WebSocketStream<TcpStream>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let headers = Arc::new(Mutex::new(Vec::new()));
    let handler = Arc::new(handler);

    let accepted = Arc::clone(&connections);
    let seen = Arc::clone(&headers);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            accepted.fetch_add(1, Ordering::SeqCst);
            let seen = Arc::clone(&seen);
            let handler = Arc::clone(&handler);

            tokio::spawn(async move {
                let callback = move |request: &Request, response: Response| {
                    let header = |name: &str| {
                        request
                            .headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string)
                    };
                    seen.lock().unwrap().push(SeenHeaders {
                        authorization: header("authorization"),
                        client_id: header("x-client-id"),
                    });

                    match reject_with {
                        Some(status) => {
                            let mut error = ErrorResponse::new(Some("rejected".to_string()));
                            *error.status_mut() = StatusCode::from_u16(status).unwrap();
                            Err(error)
                        }
                        None => Ok(response),
                    }
                };

                if let Ok(ws) = tokio_tungstenite::accept_hdr_async(socket, callback).await {
                    (handler.as_ref())(ws).await;
                }
            });
        }
    });

    WsServer {
        addr,
        connections,
        headers,
    }
}

// =============================================================================
// Session helpers
// =============================================================================

/// Sleeper that records requested delays, returns at once and cancels
/// `token` after `stop_after` sleeps.
pub struct CountingSleeper {
    pub durations: Mutex<Vec<Duration>>,
    stop_after: usize,
    token: CancellationToken,
}

impl CountingSleeper {
    pub fn new(stop_after: usize, token: CancellationToken) -> Self {
        Self {
            durations: Mutex::new(Vec::new()),
            stop_after,
            token,
        }
    }

    pub fn count(&self) -> usize {
        self.durations.lock().unwrap().len()
    }
}

impl Sleeper for CountingSleeper {
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        let mut durations = self.durations.lock().unwrap();
        durations.push(duration);
        if durations.len() >= self.stop_after {
            self.token.cancel();
        }
        Box::pin(tokio::task::yield_now())
    }
}

/// Reconnect delay used by test sessions.
pub const TEST_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Build a session against `server_url` confined to `root`.
pub fn build_session(
    server_url: Url,
    root: &Path,
    sleeper: Arc<dyn Sleeper>,
) -> Arc<SessionManager> {
    let resolver = PathResolver::new(root).unwrap();
    let executor = TransferExecutor::new(&server_url, 64 * 1024).unwrap();
    let config = SessionConfig {
        server_url,
        api_key: "secret".to_string(),
        client_id: "desk-1".to_string(),
        reconnect_delay: TEST_RECONNECT_DELAY,
    };

    Arc::new(SessionManager::new(
        config,
        Arc::new(CommandDispatcher::new(resolver, executor)),
        sleeper,
    ))
}

/// Build a dispatcher whose relative locators resolve against `http_addr`.
pub fn build_dispatcher(http_addr: SocketAddr, root: &Path, chunk_size: usize) -> CommandDispatcher {
    let endpoint = Url::parse(&format!("ws://{}/api/ws", http_addr)).unwrap();
    let resolver = PathResolver::new(root).unwrap();
    let executor = TransferExecutor::new(&endpoint, chunk_size).unwrap();
    CommandDispatcher::new(resolver, executor)
}
