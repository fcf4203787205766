//! Command channel session.
//!
//! [`SessionManager::run`] keeps exactly one WebSocket open to the server for
//! as long as the process lives. Every text or binary frame is handed to the
//! [`CommandDispatcher`] and any acknowledgement is written back on the same
//! connection before the next frame is read. Whenever the connection ends,
//! for whatever reason, the loop waits a fixed delay and connects again.
//! Only the cancellation token stops it.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use protocol::error::{ProtocolError, Result};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, RwLock};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::header::{HeaderName, HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::Sleeper;
use crate::config::Config;
use crate::router::CommandDispatcher;
use protocol::messages::CorrelationId;

/// Header carrying the agent identifier during the handshake.
pub const CLIENT_ID_HEADER: &str = "x-client-id";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection state of the command channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected; a reconnect is pending.
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected and processing commands.
    Connected,
    /// The loop has exited and will not reconnect.
    Stopped,
}

/// Events emitted by the session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Connection state changed.
    StateChanged(ConnectionState),
    /// An acknowledgement was written to the channel.
    Acknowledged(CorrelationId),
}

/// Settings for the command channel.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint.
    pub server_url: Url,
    /// Value of the `Authorization` header.
    pub api_key: String,
    /// Value of the `X-Client-ID` header.
    pub client_id: String,
    /// Fixed wait before every reconnection attempt.
    pub reconnect_delay: Duration,
}

impl SessionConfig {
    /// Build session settings from the agent configuration.
    pub fn from_config(config: &Config) -> Result<Self> {
        let server_url = Url::parse(&config.server_url)
            .map_err(|e| ProtocolError::InvalidEndpoint(format!("{}: {}", config.server_url, e)))?;

        Ok(Self {
            server_url,
            api_key: config.api_key.clone(),
            client_id: config.client_id.clone(),
            reconnect_delay: config.reconnect_delay(),
        })
    }

    /// Build the handshake request with the authentication headers.
    pub fn handshake_request(&self) -> Result<Request> {
        let mut request = self
            .server_url
            .as_str()
            .into_client_request()
            .map_err(|e| ProtocolError::InvalidEndpoint(e.to_string()))?;

        let api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| ProtocolError::HandshakeFailed("api_key is not a valid header value".into()))?;
        let client_id = HeaderValue::from_str(&self.client_id).map_err(|_| {
            ProtocolError::HandshakeFailed("client_id is not a valid header value".into())
        })?;

        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, api_key);
        headers.insert(HeaderName::from_static(CLIENT_ID_HEADER), client_id);

        Ok(request)
    }
}

/// Runs the connect, serve, wait, reconnect loop.
pub struct SessionManager {
    config: SessionConfig,
    dispatcher: Arc<CommandDispatcher>,
    sleeper: Arc<dyn Sleeper>,
    state: Arc<RwLock<ConnectionState>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionManager {
    /// Create a session manager. Nothing happens until [`run`](Self::run).
    pub fn new(
        config: SessionConfig,
        dispatcher: Arc<CommandDispatcher>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);

        Self {
            config,
            dispatcher,
            sleeper,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            event_tx,
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        // Sync accessor; a contended lock reads as Disconnected.
        match self.state.try_read() {
            Ok(state) => *state,
            Err(_) => ConnectionState::Disconnected,
        }
    }

    /// Subscribe to session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// The session settings.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    async fn set_state(&self, new_state: ConnectionState) {
        {
            let mut state = self.state.write().await;
            if *state == new_state {
                return;
            }
            *state = new_state;
        }

        tracing::debug!(state = ?new_state, "Session state changed");
        // No subscribers is fine.
        let _ = self.event_tx.send(SessionEvent::StateChanged(new_state));
    }

    /// Run until `shutdown` is cancelled.
    ///
    /// Connection failures never end the loop; they are logged and retried
    /// after the configured delay, forever.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut attempt: u64 = 0;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            attempt += 1;
            self.set_state(ConnectionState::Connecting).await;
            tracing::info!(url = %self.config.server_url, attempt, "Connecting to command channel");

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.connect() => result,
            };

            match connected {
                Ok(stream) => {
                    self.set_state(ConnectionState::Connected).await;
                    tracing::info!(
                        attempt,
                        root = %self.dispatcher.resolver().root().display(),
                        "Command channel connected"
                    );

                    match self.serve(stream, &shutdown).await {
                        Ok(()) => tracing::info!("Command channel closed"),
                        Err(e) => tracing::warn!(error = %e, "Command channel lost"),
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "Command channel handshake failed");
                }
            }

            if shutdown.is_cancelled() {
                break;
            }

            self.set_state(ConnectionState::Disconnected).await;
            tracing::info!("Reconnecting in {:?}", self.config.reconnect_delay);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.sleeper.sleep(self.config.reconnect_delay) => {}
            }
        }

        self.set_state(ConnectionState::Stopped).await;
        tracing::info!("Command channel stopped");
    }

    async fn connect(&self) -> Result<WsStream> {
        let request = self.config.handshake_request()?;

        let (stream, response) = connect_async(request).await.map_err(|e| match e {
            WsError::Http(response) => ProtocolError::HandshakeFailed(format!(
                "server rejected handshake with status {}",
                response.status()
            )),
            other => ProtocolError::HandshakeFailed(other.to_string()),
        })?;

        tracing::debug!(status = %response.status(), "Handshake accepted");
        Ok(stream)
    }

    /// Process frames until the connection ends.
    ///
    /// Returns `Ok` for an orderly close (close frame, end of stream or exit
    /// request) and `Err` when the transport fails.
    async fn serve(&self, stream: WsStream, shutdown: &CancellationToken) -> Result<()> {
        let (mut sink, mut source) = stream.split();

        loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                frame = source.next() => frame,
            };

            let payload = match frame {
                None => return Ok(()),
                Some(Err(WsError::Io(e))) => return Err(e.into()),
                Some(Err(e)) => return Err(ProtocolError::ConnectionClosed(e.to_string())),
                Some(Ok(WsMessage::Text(text))) => text.into_bytes(),
                Some(Ok(WsMessage::Binary(data))) => data,
                Some(Ok(WsMessage::Close(frame))) => {
                    tracing::debug!(?frame, "Server closed the command channel");
                    return Ok(());
                }
                // Pings are answered by tungstenite.
                Some(Ok(_)) => continue,
            };

            tracing::debug!(bytes = payload.len(), "Received command frame");

            let result = tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::warn!("Exit requested while a command was in progress");
                    let _ = sink.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                result = self.dispatcher.handle(&payload) => result,
            };

            let Some(result) = result else {
                continue;
            };

            let json = match result.to_json() {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode acknowledgement");
                    continue;
                }
            };

            if let Err(e) = sink.send(WsMessage::Text(json)).await {
                tracing::warn!(
                    correlation_id = %result.correlation_id(),
                    error = %e,
                    "Acknowledgement lost"
                );
                return Err(ProtocolError::ConnectionClosed(e.to_string()));
            }

            tracing::debug!(correlation_id = %result.correlation_id(), "Acknowledgement sent");
            let _ = self
                .event_tx
                .send(SessionEvent::Acknowledged(result.correlation_id().clone()));
        }
    }
}
