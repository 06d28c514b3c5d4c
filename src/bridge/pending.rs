//! Pending-request table.
//!
//! One lock guards the table and is shared by request issue, response
//! arrival and the timeout sweep. An entry can only leave the table once,
//! through [`PendingTable::take`], [`PendingTable::take_expired`] or
//! [`PendingTable::drain`], so its completion runs at most once no matter how
//! a late response and the sweep race. Completions are always invoked after
//! the lock is released.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::error;
use uuid::Uuid;

use crate::error::BridgeError;
use crate::utils::panic::format_panic;

/// Raw outcome of a bridge request
pub type RequestOutcome = std::result::Result<Vec<u8>, BridgeError>;

/// Callback receiving a request's outcome
pub type Completion = Box<dyn FnOnce(RequestOutcome) + Send + 'static>;

/// An issued request waiting for its response.
pub struct PendingRequest {
    pub id: Uuid,
    pub peer: SocketAddr,
    pub handler_id: String,
    pub issued_at: Instant,
    /// `None` when the timeout reaches past what `Instant` can represent
    pub deadline: Option<Instant>,
    completion: Completion,
}

impl PendingRequest {
    pub fn new(
        id: Uuid,
        peer: SocketAddr,
        handler_id: impl Into<String>,
        timeout: Duration,
        completion: Completion,
    ) -> Self {
        let issued_at = Instant::now();
        Self {
            id,
            peer,
            handler_id: handler_id.into(),
            issued_at,
            deadline: issued_at.checked_add(timeout),
            completion,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| now > deadline)
    }

    /// Consume the entry and deliver `outcome` to its callback.
    ///
    /// A panicking callback is logged and swallowed.
    pub fn complete(self, outcome: RequestOutcome) {
        let id = self.id;
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| (self.completion)(outcome))) {
            error!(request = %id, panic = %format_panic(panic), "Request completion panicked");
        }
    }
}

impl std::fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("handler_id", &self.handler_id)
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// Requests in flight, keyed by correlation id.
#[derive(Debug, Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<Uuid, PendingRequest>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, PendingRequest>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, request: PendingRequest) {
        self.lock().insert(request.id, request);
    }

    /// Remove the entry for `id`, if it is still pending.
    pub fn take(&self, id: &Uuid) -> Option<PendingRequest> {
        self.lock().remove(id)
    }

    /// Remove every entry whose deadline has passed.
    pub fn take_expired(&self, now: Instant) -> Vec<PendingRequest> {
        let mut entries = self.lock();
        let expired: Vec<Uuid> = entries
            .values()
            .filter(|request| request.is_expired(now))
            .map(|request| request.id)
            .collect();
        expired
            .iter()
            .filter_map(|id| entries.remove(id))
            .collect()
    }

    /// Remove every entry.
    pub fn drain(&self) -> Vec<PendingRequest> {
        self.lock().drain().map(|(_, request)| request).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting(counter: &Arc<AtomicUsize>, timeout: Duration) -> PendingRequest {
        let counter = Arc::clone(counter);
        PendingRequest::new(
            Uuid::new_v4(),
            "127.0.0.1:1".parse().unwrap(),
            "echo",
            timeout,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_take_is_at_most_once() {
        let table = PendingTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let request = counting(&fired, Duration::from_secs(5));
        let id = request.id;
        table.insert(request);

        table.take(&id).unwrap().complete(Ok(vec![]));
        assert!(table.take(&id).is_none());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_sweep_takes_only_expired() {
        let table = PendingTable::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let short = counting(&fired, Duration::from_millis(0));
        let long = counting(&fired, Duration::from_secs(60));
        let short_id = short.id;
        table.insert(short);
        table.insert(long);

        let expired = table.take_expired(Instant::now() + Duration::from_millis(1));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, short_id);
        assert_eq!(table.len(), 1);

        // The late response finds nothing
        assert!(table.take(&short_id).is_none());
    }

    #[test]
    fn test_unbounded_timeout_never_expires() {
        let fired = Arc::new(AtomicUsize::new(0));
        let request = counting(&fired, Duration::MAX);

        assert!(request.deadline.is_none());
        assert!(!request.is_expired(Instant::now() + Duration::from_secs(3600 * 24 * 365)));
    }

    #[test]
    fn test_panicking_completion_is_contained() {
        let request = PendingRequest::new(
            Uuid::new_v4(),
            "127.0.0.1:1".parse().unwrap(),
            "echo",
            Duration::from_secs(1),
            Box::new(|_| panic!("callback failed")),
        );
        request.complete(Err(BridgeError::Timeout));
    }
}
