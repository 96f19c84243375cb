use std::sync::Arc;
use std::time::Instant;

use crossbeam_utils::atomic::AtomicCell;

use crate::config::StoreConfig;
use crate::holder::ResponseHolder;
use crate::key::RequestKey;

/// The shared map of per-key response holders.
///
/// One store is owned by a function instance and shared by reference across
/// every with-style variant derived from it, so all variants of the same
/// function identity coalesce onto the same holders.
///
/// The map is bounded: under capacity pressure the underlying cache evicts
/// entries, and an evicted entry behaves exactly as if the key had never been
/// resolved. On top of that, an opportunistic throttled sweep evicts holders
/// that have been idle past the fixed sweep window.
pub struct ResponseStore<O> {
    name: Arc<str>,
    holders: moka::sync::Cache<RequestKey, Arc<ResponseHolder<O>>>,
    config: StoreConfig,
    last_sweep: AtomicCell<Instant>,
}

impl<O: Clone + Send + Sync + 'static> ResponseStore<O> {
    pub fn new(name: Arc<str>, config: StoreConfig) -> Self {
        let holders = moka::sync::Cache::builder()
            .max_capacity(config.capacity)
            .name(&name)
            .build();

        ResponseStore {
            name,
            holders,
            config,
            last_sweep: AtomicCell::new(Instant::now()),
        }
    }

    /// Looks the holder for `key` up, creating it on first use. Concurrent
    /// creations for the same key are coalesced into one holder.
    pub fn get_or_create(&self, key: &RequestKey) -> Arc<ResponseHolder<O>> {
        self.holders
            .entry_by_ref(key)
            .or_insert_with(|| Arc::new(ResponseHolder::new()))
            .into_value()
    }

    /// Evicts holders that have been idle for longer than the sweep window.
    ///
    /// Unless `force` is set, the sweep is throttled to run at most once per
    /// window. Holders with a pending refresh are never evicted here.
    pub fn sweep(&self, force: bool) {
        let now = Instant::now();
        if !force && now.duration_since(self.last_sweep.load()) < self.config.sweep_window {
            return;
        }
        self.last_sweep.store(now);

        for (key, holder) in self.holders.iter() {
            if holder.is_pending() {
                continue;
            }
            if holder.idle_longer_than(self.config.sweep_window) {
                metric!(counter("store.evicted") += 1, "function" => &self.name);
                tracing::trace!(function = &*self.name, key = %key, "evicting idle holder");
                self.holders.invalidate(key.as_ref());
            }
        }
    }

    /// Drops every holder unconditionally.
    pub fn clear(&self) {
        metric!(
            counter("store.cleared") += self.holders.entry_count() as i64,
            "function" => &self.name,
        );
        self.holders.invalidate_all();
    }

    /// The number of retained holders, synced for test determinism.
    #[cfg(test)]
    pub fn holder_count(&self) -> u64 {
        self.holders.run_pending_tasks();
        self.holders.entry_count()
    }
}
