//! Correlation table of in-flight requests.
//!
//! Each registered id owns a oneshot sender. Removing the entry is the
//! only way to settle it, so whichever of response, timeout or socket
//! teardown removes it first wins and every later attempt is a no-op.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

use crate::error::LinkError;
use crate::protocol::PredictResponse;

pub type Settlement = Result<PredictResponse, LinkError>;

#[derive(Debug, Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Settlement>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Settlement>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `id` and return the receiving half of its settlement.
    pub fn register(&self, id: &str) -> Result<oneshot::Receiver<Settlement>, LinkError> {
        let mut waiters = self.lock();
        if waiters.contains_key(id) {
            return Err(LinkError::DuplicateRequestId(id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        waiters.insert(id.to_string(), tx);
        Ok(rx)
    }

    /// Settle `id`. Returns `false` if it was already settled or never
    /// registered.
    pub fn settle(&self, id: &str, outcome: Settlement) -> bool {
        let Some(tx) = self.lock().remove(id) else {
            return false;
        };
        // receiver may have been dropped by a cancelled caller
        let _ = tx.send(outcome);
        true
    }

    /// Settle every outstanding request with `error`.
    pub fn reject_all(&self, error: &LinkError) -> usize {
        let drained: Vec<_> = self.lock().drain().collect();
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(error.clone()));
        }
        count
    }

    /// Settle `id` as abandoned when the returned guard drops, unless
    /// something settled it first. Holding one keeps a cancelled caller
    /// from leaving its entry behind.
    pub fn guard<'a>(&'a self, id: &'a str) -> PendingGuard<'a> {
        PendingGuard { pending: self, id }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    id: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let abandoned = LinkError::SocketClosed("request abandoned".into());
        if self.pending.settle(self.id, Err(abandoned)) {
            log::debug!("Request {} abandoned by its caller", self.id);
        }
    }
}
