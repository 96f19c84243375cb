use std::time::Duration;

use serde::Deserialize;

/// Behavior knobs of one [`AsyncFunction`](crate::AsyncFunction) instance.
///
/// The config is plain data; with-style derivation clones it into the new
/// instance, so existing instances are never mutated.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FunctionConfig {
    /// Maximum synchronous wait on the very first resolution of a key.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,

    /// Nominal freshness window of a cached value.
    ///
    /// The effective cutoff is `expiration - timeout`, see
    /// [`freshness`](Self::freshness).
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,

    /// Substitute the default value for *any* failure, not just timeouts and
    /// connectivity errors.
    pub use_default_with_failures: bool,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        FunctionConfig {
            timeout: Duration::from_millis(100),
            expiration: Duration::from_secs(5),
            use_default_with_failures: false,
        }
    }
}

impl FunctionConfig {
    /// The effective freshness cutoff, `expiration - timeout` saturating at
    /// zero. A timeout at or above the expiration makes every cached value
    /// immediately stale.
    pub fn freshness(&self) -> Duration {
        self.expiration.saturating_sub(self.timeout)
    }
}

/// Tuning of the shared response store.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StoreConfig {
    /// Upper bound on retained holders. Entries evicted under capacity
    /// pressure behave as if they were never cached.
    pub capacity: u64,

    /// The fixed sweep window: the opportunistic sweep runs at most once per
    /// window and evicts holders that have been idle for longer than it.
    /// Independent of any per-instance `expiration`.
    #[serde(with = "humantime_serde")]
    pub sweep_window: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            capacity: 100 * 1024,
            sweep_window: Duration::from_secs(5 * 60),
        }
    }
}
