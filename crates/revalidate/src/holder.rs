use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;
use tokio::sync::MutexGuard;

/// Per-key mutable state, shared by every caller resolving the same key.
///
/// All field transitions happen either under [`lock`](Self::lock) or through
/// an atomic, never as bare writes. The holder outlives its store entry: a
/// background task keeps its own `Arc` and finishes updating the holder even
/// after an eviction removed it from the map.
pub struct ResponseHolder<O> {
    /// Serializes the decision-and-claim sequence for this key only.
    lock: tokio::sync::Mutex<()>,
    /// `None` until the first result or default is stored.
    last_update: AtomicCell<Option<Instant>>,
    result: Mutex<Option<O>>,
    default_result: Mutex<Option<O>>,
    first_request: AtomicBool,
    pending: AtomicBool,
}

impl<O: Clone> ResponseHolder<O> {
    pub fn new() -> Self {
        ResponseHolder {
            lock: tokio::sync::Mutex::new(()),
            last_update: AtomicCell::new(None),
            result: Mutex::new(None),
            default_result: Mutex::new(None),
            first_request: AtomicBool::new(true),
            pending: AtomicBool::new(false),
        }
    }

    pub async fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().await
    }

    pub fn result(&self) -> Option<O> {
        self.result.lock().unwrap().clone()
    }

    /// The current result, provided it is still within the freshness cutoff.
    pub fn fresh_result(&self, freshness: Duration) -> Option<O> {
        if self.expired(freshness) {
            return None;
        }
        self.result()
    }

    pub fn default_result(&self) -> Option<O> {
        self.default_result.lock().unwrap().clone()
    }

    pub fn store_result(&self, result: O) {
        *self.result.lock().unwrap() = Some(result);
        self.last_update.store(Some(Instant::now()));
    }

    /// Caches the lazily computed default. Also counts as an update, keeping
    /// the holder alive through sweeps.
    pub fn store_default(&self, result: O) {
        *self.default_result.lock().unwrap() = Some(result);
        self.last_update.store(Some(Instant::now()));
    }

    pub fn expired(&self, freshness: Duration) -> bool {
        match self.last_update.load() {
            Some(updated) => updated.elapsed() > freshness,
            None => true,
        }
    }

    /// Whether the holder has seen no store for longer than `window`.
    /// A holder that never stored anything counts as idle.
    pub fn idle_longer_than(&self, window: Duration) -> bool {
        match self.last_update.load() {
            Some(updated) => updated.elapsed() > window,
            None => true,
        }
    }

    pub fn is_first_request(&self) -> bool {
        self.first_request.load(Ordering::Acquire)
    }

    pub fn finish_first_request(&self) {
        self.first_request.store(false, Ordering::Release);
    }

    /// Claims the single-flight refresh token. Returns `true` for exactly one
    /// claimant until [`clear_pending`](Self::clear_pending) releases it.
    pub fn claim_refresh(&self) -> bool {
        self.pending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn clear_pending(&self) {
        self.pending.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_result() {
        let holder = ResponseHolder::new();
        assert_eq!(holder.fresh_result(Duration::from_secs(1)), None);

        holder.store_result("value".to_string());
        assert_eq!(
            holder.fresh_result(Duration::from_secs(1)),
            Some("value".to_string())
        );
        // A zero cutoff makes the value immediately stale, but it stays
        // available as a stale result.
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(holder.fresh_result(Duration::ZERO), None);
        assert_eq!(holder.result(), Some("value".to_string()));
    }

    #[test]
    fn test_refresh_claim_is_exclusive() {
        let holder = ResponseHolder::<String>::new();
        assert!(holder.claim_refresh());
        assert!(!holder.claim_refresh());
        assert!(holder.is_pending());

        holder.clear_pending();
        assert!(holder.claim_refresh());
    }

    #[test]
    fn test_idleness() {
        let holder = ResponseHolder::<String>::new();
        // Never updated counts as idle for any window.
        assert!(holder.idle_longer_than(Duration::from_secs(3600)));

        holder.store_result("value".into());
        assert!(!holder.idle_longer_than(Duration::from_secs(3600)));

        std::thread::sleep(Duration::from_millis(10));
        assert!(holder.idle_longer_than(Duration::from_millis(1)));
    }

    #[test]
    fn test_default_store_counts_as_update() {
        let holder = ResponseHolder::<String>::new();
        holder.store_default("fallback".into());
        assert!(!holder.idle_longer_than(Duration::from_secs(60)));
        // The default does not become the result.
        assert_eq!(holder.result(), None);
        assert_eq!(holder.default_result(), Some("fallback".into()));
    }
}
