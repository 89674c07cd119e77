//! WebSocket transport: accepts sockets, issues sessions and routes
//! requests to a [`ConnectionService`].
//!
//! Per accepted socket:
//! ```text
//! accept ──► sessionInfo ──► service.open_session ──┬── fail ──► close 1008
//!                                                   │
//!                                                   ▼
//!            ┌──────────── select! ────────────────────────────┐
//!            │ frame (predict)  ─► check sid ─► spawn request   │
//!            │ response channel ─► write reply                  │
//!            │ heartbeat tick   ─► write "h"                    │
//!            └──────────────────────────────────────────────────┘
//!                                                   │ socket ends
//!                                                   ▼
//!                                     service.close_session
//! ```
//!
//! Requests on one socket run concurrently; responses are written in
//! completion order.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, RwLock};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

use crate::config::{parse_var, ConfigError, ENV_HEARTBEAT_SECS, ENV_WS_HOST, ENV_WS_PORT};
use crate::hub::ConnectionService;
use crate::protocol::{
    Frame, Message, PredictRequest, PredictResponse, Session, SessionInfo,
    CLOSE_POLICY_VIOLATION, CLOSE_REASON_SESSION_MISMATCH, ERROR_CODE_INTERNAL, HEARTBEAT_FRAME,
};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

/// Transport configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Close the socket (1008) on a session mismatch instead of dropping
    /// the frame
    pub close_on_session_mismatch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
            close_on_session_mismatch: false,
        }
    }
}

impl ServerConfig {
    /// Listen address and heartbeat from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = lookup(ENV_WS_HOST)
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0".to_string());
        let port = parse_var::<u16>(&lookup, ENV_WS_PORT)?.unwrap_or(8080);
        let heartbeat_interval_secs = match parse_var::<u64>(&lookup, ENV_HEARTBEAT_SECS)? {
            Some(0) => {
                return Err(ConfigError::Invalid {
                    name: ENV_HEARTBEAT_SECS,
                    value: "0".into(),
                })
            }
            Some(secs) => secs,
            None => 30,
        };

        Ok(Self {
            bind_addr: format!("{host}:{port}"),
            heartbeat_interval_secs,
            close_on_session_mismatch: false,
        })
    }

    fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }
}

/// Transport statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_requests: u64,
    /// Frames dropped as malformed, unexpected or mismatched
    pub dropped_frames: u64,
    pub heartbeats_sent: u64,
}

/// The WebSocket transport.
pub struct Transport {
    config: ServerConfig,
    service: Arc<dyn ConnectionService>,
    /// Server-wide statistics
    stats: Arc<RwLock<ServerStats>>,
    shutdown: Arc<Notify>,
}

impl Transport {
    pub fn new(config: ServerConfig, service: Arc<dyn ConnectionService>) -> Self {
        Self {
            config,
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Stop accepting new sockets. Sockets already accepted run to
    /// completion.
    pub fn shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Bind `bind_addr` and serve until [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Transport listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.notified() => {
                    log::info!("Transport shutting down");
                    return Ok(());
                }
            };
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<dyn ConnectionService>,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, ws_receiver) = ws_stream.split();

        let session = Session::generate();
        log::info!("WebSocket connection from {addr} assigned session {session}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let hello = Message::SessionInfo(SessionInfo::new(session.clone())).encode()?;
        let outcome = match ws_sender.send(WsMessage::text(hello)).await {
            Ok(()) => match service.open_session(&session).await {
                Ok(()) => {
                    let outcome = Self::serve_session(
                        ws_sender,
                        ws_receiver,
                        &session,
                        service.clone(),
                        stats.clone(),
                        &config,
                    )
                    .await;
                    service.close_session(&session).await;
                    outcome
                }
                Err(e) => {
                    log::warn!("Session {session} rejected: {e}");
                    let reason = format!("unauthorized or connection error: {e}");
                    let _ = send_close(&mut ws_sender, CLOSE_POLICY_VIOLATION, reason).await;
                    Ok(())
                }
            },
            Err(e) => Err(e.into()),
        };

        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {session} from {addr} ended");
        outcome
    }

    async fn serve_session(
        mut ws_sender: WsSink,
        mut ws_receiver: futures_util::stream::SplitStream<WebSocketStream<TcpStream>>,
        session: &Session,
        service: Arc<dyn ConnectionService>,
        stats: Arc<RwLock<ServerStats>>,
        config: &ServerConfig,
    ) -> Result<(), BoxError> {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();
        let period = config.heartbeat_period();
        let mut heartbeat = interval_at(Instant::now() + period, period);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(WsMessage::Text(text))) => match Frame::decode(text.as_str()) {
                        Ok(Frame::Message(Message::Predict(request))) => {
                            let matches = request.session.as_ref().is_some_and(|s| s.sid == session.sid);
                            if !matches {
                                stats.write().await.dropped_frames += 1;
                                log::warn!(
                                    "Session {session}: request {} carried session {:?}",
                                    request.id,
                                    request.session.as_ref().map(|s| s.sid.as_str())
                                );
                                if config.close_on_session_mismatch {
                                    send_close(
                                        &mut ws_sender,
                                        CLOSE_POLICY_VIOLATION,
                                        CLOSE_REASON_SESSION_MISMATCH.into(),
                                    )
                                    .await?;
                                    return Ok(());
                                }
                                continue;
                            }
                            stats.write().await.total_requests += 1;
                            tokio::spawn(Self::answer(
                                service.clone(),
                                session.clone(),
                                request,
                                reply_tx.clone(),
                            ));
                        }
                        Ok(Frame::Heartbeat) => {}
                        Ok(Frame::Message(other)) => {
                            stats.write().await.dropped_frames += 1;
                            log::warn!("Session {session}: unexpected {} message", other.event());
                        }
                        Err(e) => {
                            stats.write().await.dropped_frames += 1;
                            log::warn!("Session {session}: dropped frame: {e}");
                        }
                    },
                    Some(Ok(WsMessage::Ping(data))) => {
                        ws_sender.send(WsMessage::Pong(data)).await?;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        log::debug!("Session {session}: peer closed");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(reply) = reply_rx.recv() => {
                    ws_sender.send(WsMessage::text(reply)).await?;
                }
                _ = heartbeat.tick() => {
                    ws_sender.send(WsMessage::text(HEARTBEAT_FRAME)).await?;
                    stats.write().await.heartbeats_sent += 1;
                }
            }
        }
    }

    /// Run one request through the service. Service failures become an
    /// `errorCode` 500 reply carrying the caller's id.
    async fn answer(
        service: Arc<dyn ConnectionService>,
        session: Session,
        request: PredictRequest,
        reply_tx: mpsc::UnboundedSender<String>,
    ) {
        let id = request.id.clone();
        let response = match service.send_request(&session, request).await {
            Ok(response) => response,
            Err(e) => {
                log::warn!("Session {session}: request {id} failed: {e}");
                PredictResponse::failure(id, Some(session.clone()), ERROR_CODE_INTERNAL, e.to_string())
            }
        };
        match Message::PredictResponse(response).encode() {
            Ok(encoded) => {
                // socket may have closed while the request was in flight
                let _ = reply_tx.send(encoded);
            }
            Err(e) => log::error!("Session {session}: failed to encode response: {e}"),
        }
    }
}

async fn send_close(ws_sender: &mut WsSink, code: u16, reason: String) -> Result<(), BoxError> {
    let frame = CloseFrame {
        code: CloseCode::from(code),
        reason: reason.into(),
    };
    ws_sender.send(WsMessage::Close(Some(frame))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(!config.close_on_session_mismatch);
    }

    #[test]
    fn test_server_config_from_env_defaults() {
        let config = ServerConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.heartbeat_interval_secs, 30);
    }

    #[test]
    fn test_server_config_from_env_overrides() {
        let config = ServerConfig::from_lookup(env(&[
            (ENV_WS_HOST, "127.0.0.1"),
            (ENV_WS_PORT, "9100"),
            (ENV_HEARTBEAT_SECS, "5"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:9100");
        assert_eq!(config.heartbeat_interval_secs, 5);
    }

    #[test]
    fn test_server_config_invalid_port() {
        let result = ServerConfig::from_lookup(env(&[(ENV_WS_PORT, "eighty")]));
        assert!(matches!(result, Err(ConfigError::Invalid { name, .. }) if name == ENV_WS_PORT));
    }

    #[test]
    fn test_server_stats_default() {
        let stats = ServerStats::default();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.dropped_frames, 0);
    }
}
