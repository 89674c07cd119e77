//! Client-side WebSocket connection with request/response correlation.
//!
//! Provides:
//! - Session tracking from the server's unsolicited `sessionInfo`
//! - `predict` requests settled exactly once (response, timeout or teardown)
//! - An idle watchdog that closes silent connections
//! - Close and error handlers that fire once per connection
//!
//! ```text
//!   send() ──► PendingRequests ──► out_tx ──► writer task ──► socket
//!                    ▲                                          │
//!                    └──────── settle(id) ◄── reader task ◄─────┘
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use crate::config::{validate_url, LinkConfig};
use crate::error::LinkError;
use crate::pending::PendingRequests;
use crate::protocol::{
    Frame, Message, PredictRequest, PredictResponse, Session, CLOSE_NORMAL,
    CLOSE_POLICY_VIOLATION, CLOSE_REASON_SESSION_MISMATCH,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTGOING_CAPACITY: usize = 256;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Why a connection ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// WebSocket close code, when one was exchanged.
    pub code: Option<u16>,
    pub reason: String,
    /// `true` for `close()` and the idle watchdog.
    pub initiated_locally: bool,
    /// The socket closed before any `sessionInfo` arrived.
    pub before_session: bool,
}

impl CloseReason {
    /// The peer closed because a request named a session it did not issue.
    pub fn is_session_mismatch(&self) -> bool {
        !self.initiated_locally
            && self.code == Some(CLOSE_POLICY_VIOLATION)
            && self.reason == CLOSE_REASON_SESSION_MISMATCH
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "{} ({code})", self.reason)?,
            None => f.write_str(&self.reason)?,
        }
        if self.before_session {
            f.write_str(", before session was established")?;
        }
        Ok(())
    }
}

pub type CloseHandler = Arc<dyn Fn(&CloseReason) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&LinkError) + Send + Sync>;

enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

enum Termination {
    Closed(CloseReason),
    Failed(LinkError),
}

/// Handlers and the recorded close reason share one lock so that a
/// handler installed during teardown fires exactly once.
#[derive(Default)]
struct Handlers {
    on_close: Option<CloseHandler>,
    on_error: Option<ErrorHandler>,
    close_reason: Option<CloseReason>,
}

struct Inner {
    id: u64,
    config: LinkConfig,
    session: watch::Sender<Option<Session>>,
    established: AtomicBool,
    pending: PendingRequests,
    outgoing: mpsc::Sender<Outbound>,
    activity: watch::Sender<Instant>,
    closed: watch::Sender<bool>,
    terminated: AtomicBool,
    handlers: Mutex<Handlers>,
}

/// A live client connection. Cheap to clone; clones share the socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("url", &self.inner.config.url)
            .field("session", &self.session())
            .field("open", &self.is_open())
            .finish()
    }
}

impl Connection {
    /// Open a socket to `config.url` and start the background tasks.
    ///
    /// Resolves once the WebSocket handshake completes; the session
    /// arrives asynchronously afterwards.
    pub async fn open(config: LinkConfig) -> Result<Self, LinkError> {
        Self::open_with_handlers(config, Handlers::default()).await
    }

    /// Like [`open`](Self::open) with a close handler installed before any
    /// frame is read, so an early close can never be missed.
    pub async fn open_with_close_handler(
        config: LinkConfig,
        on_close: impl Fn(&CloseReason) + Send + Sync + 'static,
    ) -> Result<Self, LinkError> {
        let handlers = Handlers {
            on_close: Some(Arc::new(on_close)),
            ..Handlers::default()
        };
        Self::open_with_handlers(config, handlers).await
    }

    async fn open_with_handlers(config: LinkConfig, handlers: Handlers) -> Result<Self, LinkError> {
        validate_url(&config.url)?;

        let (ws, _) = tokio_tungstenite::connect_async(config.url.as_str())
            .await
            .map_err(|e| LinkError::Connect {
                url: config.url.clone(),
                reason: e.to_string(),
            })?;
        let (ws_writer, ws_reader) = ws.split();

        let (out_tx, out_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let idle_timeout = config.idle_timeout;
        let inner = Arc::new(Inner {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            config,
            session: watch::Sender::new(None),
            established: AtomicBool::new(false),
            pending: PendingRequests::new(),
            outgoing: out_tx,
            activity: watch::Sender::new(Instant::now()),
            closed: watch::Sender::new(false),
            terminated: AtomicBool::new(false),
            handlers: Mutex::new(handlers),
        });

        log::info!("Connection {} opened to {}", inner.id, inner.config.url);

        tokio::spawn(write_loop(ws_writer, out_rx, Arc::downgrade(&inner)));
        tokio::spawn(read_loop(ws_reader, inner.clone()));
        if let Some(idle) = idle_timeout {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(idle_watchdog(
                inner.activity.subscribe(),
                inner.closed.subscribe(),
                idle,
                move || {
                    if let Some(inner) = weak.upgrade() {
                        log::info!("Connection {} idle for {:?}, closing", inner.id, idle);
                        inner.close_locally(CLOSE_NORMAL, "idle timeout");
                    }
                },
            ));
        }

        Ok(Self { inner })
    }

    /// Process-unique id of this connection.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.config.url
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    /// Whether two handles share the same underlying socket.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    pub fn is_open(&self) -> bool {
        !self.inner.terminated.load(Ordering::Acquire)
    }

    /// The server-issued session, once `sessionInfo` has arrived.
    pub fn session(&self) -> Option<Session> {
        self.inner.session.borrow().clone()
    }

    /// Wait until the server has issued a session.
    pub async fn wait_for_session(&self, timeout: Duration) -> Result<Session, LinkError> {
        let mut session_rx = self.inner.session.subscribe();
        let mut closed_rx = self.inner.closed.subscribe();

        let wait = async {
            tokio::select! {
                res = session_rx.wait_for(Option::is_some) => match res {
                    Ok(session) => session.clone().ok_or(LinkError::NoSession),
                    Err(_) => Err(LinkError::NoSession),
                },
                _ = closed_rx.wait_for(|closed| *closed) => {
                    Err(LinkError::SocketClosed("closed before session was established".into()))
                }
            }
        };

        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or(Err(LinkError::NoSession))
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.pending.len()
    }

    /// Send with the configured request timeout.
    pub async fn send(&self, request: PredictRequest) -> Result<PredictResponse, LinkError> {
        let timeout = self.inner.config.request_timeout;
        self.send_with_timeout(request, timeout).await
    }

    /// Send a `predict` request and wait for the matching response.
    ///
    /// An empty `id` is replaced with a fresh UUID. A response with a
    /// non-zero `errorCode` resolves to [`LinkError::Server`].
    pub async fn send_with_timeout(
        &self,
        mut request: PredictRequest,
        timeout: Duration,
    ) -> Result<PredictResponse, LinkError> {
        if !self.is_open() {
            return Err(LinkError::NotOpen);
        }
        if request.id.is_empty() {
            request.id = Uuid::new_v4().to_string();
        }
        let id = request.id.clone();
        let encoded = Message::Predict(request).encode()?;

        let mut rx = self.inner.pending.register(&id)?;
        let _abandon = self.inner.pending.guard(&id);
        // teardown may have drained the table before we registered
        if !self.is_open() {
            self.inner.pending.settle(&id, Err(LinkError::NotOpen));
        } else if self.inner.outgoing.send(Outbound::Text(encoded)).await.is_err() {
            self.inner.pending.settle(&id, Err(LinkError::NotOpen));
        } else {
            self.inner.touch();
            log::debug!("Connection {} sent predict {}", self.inner.id, id);
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(LinkError::SocketClosed("request abandoned".into())),
            Err(_) => {
                let expired = LinkError::RequestTimeout {
                    id: id.clone(),
                    timeout,
                };
                if self.inner.pending.settle(&id, Err(expired.clone())) {
                    log::warn!("Connection {} request {} timed out after {:?}", self.inner.id, id, timeout);
                }
                // a response may have won the race; take whichever settled first
                rx.try_recv().unwrap_or(Err(expired))
            }
        }
    }

    /// Close with code 1000. Pending requests are rejected and the close
    /// handler fires. Idempotent.
    pub fn close(&self) {
        self.close_with(CLOSE_NORMAL, "client initiated close");
    }

    pub fn close_with(&self, code: u16, reason: &str) {
        self.inner.close_locally(code, reason);
    }

    /// Install the close handler. If the connection has already ended the
    /// handler is invoked immediately with the recorded reason.
    pub fn set_close_handler(&self, handler: impl Fn(&CloseReason) + Send + Sync + 'static) {
        let handler: CloseHandler = Arc::new(handler);
        let recorded = {
            let mut handlers = self.inner.lock_handlers();
            handlers.on_close = Some(handler.clone());
            handlers.close_reason.clone()
        };
        if let Some(reason) = recorded {
            handler(&reason);
        }
    }

    pub fn set_error_handler(&self, handler: impl Fn(&LinkError) + Send + Sync + 'static) {
        self.inner.lock_handlers().on_error = Some(Arc::new(handler));
    }
}

impl Inner {
    fn lock_handlers(&self) -> std::sync::MutexGuard<'_, Handlers> {
        self.handlers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.activity.send_replace(Instant::now());
    }

    fn close_locally(&self, code: u16, reason: &str) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }
        let _ = self.outgoing.try_send(Outbound::Close {
            code,
            reason: reason.to_string(),
        });
        self.terminate(Termination::Closed(CloseReason {
            code: Some(code),
            reason: reason.to_string(),
            initiated_locally: true,
            before_session: false,
        }));
    }

    fn handle_text(&self, text: &str) {
        let message = match Frame::decode(text) {
            Ok(Frame::Heartbeat) => {
                log::trace!("Connection {} heartbeat", self.id);
                return;
            }
            Ok(Frame::Message(message)) => message,
            Err(e) => {
                log::warn!("Connection {} dropped frame: {}", self.id, e);
                return;
            }
        };
        self.touch();

        match message {
            Message::SessionInfo(info) => {
                if self.established.swap(true, Ordering::AcqRel) {
                    log::warn!("Connection {} ignored repeated session {}", self.id, info.session);
                    return;
                }
                log::info!("Connection {} established session {}", self.id, info.session);
                self.session.send_replace(Some(info.session));
            }
            Message::PredictResponse(response) => {
                let id = response.id.clone();
                let outcome = if response.is_success() {
                    Ok(response)
                } else {
                    Err(LinkError::Server {
                        code: response.error_code,
                        message: response.error_message.unwrap_or_default(),
                    })
                };
                if !self.pending.settle(&id, outcome) {
                    log::debug!("Connection {} dropped response for unknown request {}", self.id, id);
                }
            }
            Message::Predict(request) => {
                log::warn!("Connection {} ignored unexpected predict {}", self.id, request.id);
            }
        }
    }

    /// Single-fire teardown: reject pending requests, clear the session,
    /// then run the error handler (if failed) and the close handler.
    fn terminate(&self, cause: Termination) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.closed.send_replace(true);

        let before_session = !self.established.load(Ordering::Acquire);
        self.session.send_replace(None);

        let (reason, error) = match cause {
            Termination::Closed(mut reason) => {
                reason.before_session = before_session && !reason.initiated_locally;
                (reason, None)
            }
            Termination::Failed(error) => {
                let reason = CloseReason {
                    code: None,
                    reason: error.to_string(),
                    initiated_locally: false,
                    before_session,
                };
                (reason, Some(error))
            }
        };

        let rejection = if reason.is_session_mismatch() {
            LinkError::SessionMismatch(reason.reason.clone())
        } else {
            LinkError::SocketClosed(reason.to_string())
        };
        let rejected = self.pending.reject_all(&rejection);
        if error.is_some() {
            log::error!("Connection {} failed: {} ({} pending rejected)", self.id, reason, rejected);
        } else {
            log::info!("Connection {} closed: {} ({} pending rejected)", self.id, reason, rejected);
        }

        let (on_close, on_error) = {
            let mut handlers = self.lock_handlers();
            handlers.close_reason = Some(reason.clone());
            (handlers.on_close.clone(), handlers.on_error.clone())
        };
        if let (Some(error), Some(on_error)) = (error.as_ref(), on_error) {
            on_error(error);
        }
        if let Some(on_close) = on_close {
            on_close(&reason);
        }
    }
}

async fn write_loop(
    mut ws_writer: SplitSink<WsStream, WsMessage>,
    mut out_rx: mpsc::Receiver<Outbound>,
    inner: Weak<Inner>,
) {
    while let Some(outbound) = out_rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = ws_writer.send(WsMessage::text(text)).await {
                    if let Some(inner) = inner.upgrade() {
                        inner.terminate(Termination::Failed(LinkError::Socket(e.to_string())));
                    }
                    break;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                };
                let _ = ws_writer.send(WsMessage::Close(Some(frame))).await;
                let _ = ws_writer.close().await;
                break;
            }
        }
    }
}

async fn read_loop(mut ws_reader: SplitStream<WsStream>, inner: Arc<Inner>) {
    let mut closed_rx = inner.closed.subscribe();
    loop {
        tokio::select! {
            _ = closed_rx.wait_for(|closed| *closed) => break,
            frame = ws_reader.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => inner.handle_text(text.as_str()),
                Some(Ok(WsMessage::Close(frame))) => {
                    let (code, reason) = frame
                        .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_string()))
                        .unwrap_or((None, "closed by peer".to_string()));
                    inner.terminate(Termination::Closed(CloseReason {
                        code,
                        reason,
                        initiated_locally: false,
                        before_session: false,
                    }));
                    break;
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    log::warn!("Connection {} ignored binary frame", inner.id);
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    inner.terminate(Termination::Failed(LinkError::Socket(e.to_string())));
                    break;
                }
                None => {
                    inner.terminate(Termination::Closed(CloseReason {
                        code: None,
                        reason: "stream ended".to_string(),
                        initiated_locally: false,
                        before_session: false,
                    }));
                    break;
                }
            },
        }
    }
    // wake the writer so it can finish the closing handshake
    let _ = inner.outgoing.try_send(Outbound::Close {
        code: CLOSE_NORMAL,
        reason: String::new(),
    });
}

/// Run `on_idle` once `idle` has passed since the last sent or received
/// message. Heartbeats do not count as activity.
async fn idle_watchdog(
    mut activity_rx: watch::Receiver<Instant>,
    mut closed_rx: watch::Receiver<bool>,
    idle: Duration,
    on_idle: impl FnOnce(),
) {
    let expired = loop {
        let deadline = *activity_rx.borrow_and_update() + idle;
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                if activity_rx.has_changed().unwrap_or(false) {
                    continue;
                }
                break true;
            }
            changed = activity_rx.changed() => {
                if changed.is_err() {
                    break false;
                }
            }
            _ = closed_rx.wait_for(|closed| *closed) => break false,
        }
    };
    if expired {
        on_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;
    use tokio::time::sleep;

    fn spawn_watchdog(
        activity: &watch::Sender<Instant>,
        closed: &watch::Sender<bool>,
        idle: Duration,
    ) -> oneshot::Receiver<Instant> {
        let (fired_tx, fired_rx) = oneshot::channel();
        tokio::spawn(idle_watchdog(activity.subscribe(), closed.subscribe(), idle, move || {
            let _ = fired_tx.send(Instant::now());
        }));
        fired_rx
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_fires_at_last_activity_plus_window() {
        let idle = Duration::from_millis(300);
        let activity = watch::Sender::new(Instant::now());
        let closed = watch::Sender::new(false);
        let fired = spawn_watchdog(&activity, &closed, idle);

        sleep(Duration::from_millis(120)).await;
        activity.send_replace(Instant::now());
        sleep(Duration::from_millis(250)).await;
        let last = Instant::now();
        activity.send_replace(last);

        assert_eq!(fired.await.unwrap(), last + idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_activity_fires_after_window() {
        let idle = Duration::from_millis(200);
        let opened = Instant::now();
        let activity = watch::Sender::new(opened);
        let closed = watch::Sender::new(false);
        let fired = spawn_watchdog(&activity, &closed, idle);

        assert_eq!(fired.await.unwrap(), opened + idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_connection_stops_watchdog() {
        let activity = watch::Sender::new(Instant::now());
        let closed = watch::Sender::new(false);
        let mut fired = spawn_watchdog(&activity, &closed, Duration::from_millis(100));

        sleep(Duration::from_millis(50)).await;
        closed.send_replace(true);
        sleep(Duration::from_millis(500)).await;

        assert!(matches!(fired.try_recv(), Err(oneshot::error::TryRecvError::Closed)));
    }

    #[test]
    fn test_session_mismatch_close_reason() {
        let mismatch = CloseReason {
            code: Some(CLOSE_POLICY_VIOLATION),
            reason: CLOSE_REASON_SESSION_MISMATCH.to_string(),
            initiated_locally: false,
            before_session: false,
        };
        assert!(mismatch.is_session_mismatch());

        let rejected_open = CloseReason {
            reason: "backend unavailable".to_string(),
            ..mismatch.clone()
        };
        assert!(!rejected_open.is_session_mismatch());
    }
}
