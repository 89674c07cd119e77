//! Keyed registry of upstream connections.
//!
//! ```text
//! get_connection("k") ──┐
//! get_connection("k") ──┼──► Shared<connect future> ──► Connection
//! get_connection("k") ──┘          (one per key)
//! ```
//!
//! Concurrent callers for the same key await one memoized attempt. A
//! failed attempt or a closed connection evicts the key so the next
//! caller starts fresh. Each entry carries a generation so that a stale
//! close handler never evicts its replacement.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::config::LinkConfig;
use crate::connection::{CloseReason, Connection};
use crate::error::LinkError;
use crate::protocol::{PredictRequest, PredictResponse, Session};

type ConnectFuture = Shared<BoxFuture<'static, Result<Connection, LinkError>>>;
type EntryMap = HashMap<String, Entry>;

struct Entry {
    generation: u64,
    connecting: ConnectFuture,
}

/// What a transport needs from whatever serves its sessions.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    /// Prepare resources for a freshly accepted session.
    async fn open_session(&self, session: &Session) -> Result<(), LinkError>;

    /// Answer one request on behalf of `session`.
    async fn send_request(
        &self,
        session: &Session,
        request: PredictRequest,
    ) -> Result<PredictResponse, LinkError>;

    /// Release whatever `session` holds. Never fails.
    async fn close_session(&self, session: &Session);
}

/// Lazily opened, de-duplicated connections keyed by an arbitrary string.
pub struct Hub {
    config: LinkConfig,
    entries: Arc<Mutex<EntryMap>>,
    next_generation: AtomicU64,
}

impl Hub {
    /// Every connection opened by this hub uses `config`.
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            entries: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, EntryMap> {
        lock_entries(&self.entries)
    }

    /// Return the connection for `key`, opening it if needed.
    pub async fn get_connection(&self, key: &str) -> Result<Connection, LinkError> {
        let (generation, connecting) = self.entry_for(key);
        let result = connecting.await;
        if let Err(e) = &result {
            log::warn!("Hub connect for '{}' failed: {}", key, e);
            evict(&self.entries, key, generation);
        }
        result
    }

    fn entry_for(&self, key: &str) -> (u64, ConnectFuture) {
        let mut entries = self.lock();

        if let Some(entry) = entries.get(key) {
            let stale = matches!(entry.connecting.peek(), Some(Ok(conn)) if !conn.is_open());
            if !stale {
                return (entry.generation, entry.connecting.clone());
            }
            entries.remove(key);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let connecting = connect(
            self.config.clone(),
            Arc::downgrade(&self.entries),
            key.to_string(),
            generation,
        )
        .boxed()
        .shared();
        entries.insert(
            key.to_string(),
            Entry {
                generation,
                connecting: connecting.clone(),
            },
        );
        (generation, connecting)
    }

    /// Remove `key` and close its connection. Failures are logged only.
    pub async fn terminate_connection(&self, key: &str) {
        let Some(entry) = self.lock().remove(key) else {
            return;
        };
        match entry.connecting.await {
            Ok(conn) => {
                log::info!("Hub closing connection {} for '{}'", conn.id(), key);
                conn.close();
            }
            Err(e) => log::debug!("Hub terminate '{}': connection never opened: {}", key, e),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

fn lock_entries(entries: &Mutex<EntryMap>) -> MutexGuard<'_, EntryMap> {
    entries.lock().unwrap_or_else(PoisonError::into_inner)
}

fn evict(entries: &Mutex<EntryMap>, key: &str, generation: u64) {
    let mut entries = lock_entries(entries);
    if entries.get(key).is_some_and(|e| e.generation == generation) {
        entries.remove(key);
    }
}

async fn connect(
    config: LinkConfig,
    entries: Weak<Mutex<EntryMap>>,
    key: String,
    generation: u64,
) -> Result<Connection, LinkError> {
    let close_key = key.clone();
    let on_close = move |reason: &CloseReason| {
        log::debug!("Hub connection for '{}' closed: {}", close_key, reason);
        if let Some(entries) = entries.upgrade() {
            evict(&entries, &close_key, generation);
        }
    };
    log::debug!("Hub opening connection for '{}' to {}", key, config.url);
    Connection::open_with_close_handler(config, on_close).await
}

/// Relay: each downstream session gets its own upstream connection. The
/// request is re-tagged with the upstream session, and the reply gets the
/// caller's id and session back.
#[async_trait]
impl ConnectionService for Hub {
    async fn open_session(&self, session: &Session) -> Result<(), LinkError> {
        self.get_connection(&session.sid).await.map(|_| ())
    }

    async fn send_request(
        &self,
        session: &Session,
        request: PredictRequest,
    ) -> Result<PredictResponse, LinkError> {
        let conn = self.get_connection(&session.sid).await?;
        let upstream = conn.wait_for_session(self.config.session_timeout).await?;

        let client_id = request.id.clone();
        let forwarded = PredictRequest {
            id: String::new(),
            session: Some(upstream),
            ..request
        };

        let mut response = conn.send(forwarded).await?;
        response.id = client_id;
        response.session = Some(session.clone());
        Ok(response)
    }

    async fn close_session(&self, session: &Session) {
        self.terminate_connection(&session.sid).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unreachable_config() -> LinkConfig {
        // port 9 (discard) is almost never listening
        LinkConfig::new("ws://127.0.0.1:9").with_request_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_failed_connect_is_evicted() {
        let hub = Hub::new(unreachable_config());
        let result = hub.get_connection("k").await;
        assert!(matches!(result, Err(LinkError::Connect { .. })));
        assert!(!hub.contains("k"));
        assert!(hub.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let hub = Hub::new(LinkConfig::new("http://nope"));
        assert!(matches!(
            hub.get_connection("k").await,
            Err(LinkError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_terminate_unknown_key_is_noop() {
        let hub = Hub::new(unreachable_config());
        hub.terminate_connection("missing").await;
        assert!(hub.is_empty());
    }

    #[test]
    fn test_evict_respects_generation() {
        let entries: Mutex<EntryMap> = Mutex::new(HashMap::new());
        let pending: ConnectFuture = futures_util::future::pending().boxed().shared();
        lock_entries(&entries).insert(
            "k".into(),
            Entry {
                generation: 2,
                connecting: pending,
            },
        );

        evict(&entries, "k", 1);
        assert!(lock_entries(&entries).contains_key("k"));
        evict(&entries, "k", 2);
        assert!(!lock_entries(&entries).contains_key("k"));
    }
}
