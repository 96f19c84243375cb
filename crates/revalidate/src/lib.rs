//! # Request-coalescing, self-refreshing function cache
//!
//! This crate wraps an expensive or blocking async computation, typically a
//! remote call, into an [`AsyncFunction`] that callers invoke like the
//! computation itself, while the crate takes care of coalescing, caching and
//! refreshing behind the scenes.
//!
//! ## Behavior
//!
//! The wrapper gives three guarantees, per logical input:
//!
//! - **Single-flight**: concurrently-arriving callers for the same input never
//!   trigger more than one concurrent execution of the underlying computation.
//! - **Bounded first wait**: only the very first resolution of an input ever
//!   waits synchronously, and that wait is capped by the configured timeout.
//! - **Stale-while-revalidate**: once a value has been computed, later callers
//!   get the (possibly stale) cached value instantly; when the value is past
//!   its freshness cutoff, one caller claims a background refresh and everyone
//!   keeps being served the previous value until the refresh lands.
//!
//! On failure or timeout the function can degrade to a configured default
//! value instead of surfacing an error, see [`ResolveError`] for the exact
//! substitution policy.
//!
//! A call flows through the following layers:
//!
//! - The input is turned into a [`RequestKey`] by the identifier provider.
//! - The key is looked up in the shared response store, a concurrent map of
//!   per-key holders. The lookup coalesces concurrent holder creation.
//! - If the holder carries a result inside its freshness window, that result
//!   is returned without taking any lock.
//! - Otherwise the holder's decision lock decides exactly one caller into
//!   claiming an execution; the computation itself always runs on the runtime,
//!   never on the deciding caller's stack frame.
//!
//! ## Freshness cutoff
//!
//! A cached value counts as fresh while `now - last_update` stays within
//! `expiration - timeout` (saturating). The cutoff deliberately couples both
//! knobs: values expire *earlier* than the nominal expiration whenever the
//! timeout is non-trivial. With `timeout >= expiration` every value is
//! immediately stale and each call triggers a refresh.
//!
//! ## Metrics
//!
//! Metrics are sent through the crate's [`metric!`] macro once a statsd sink
//! has been installed via [`metrics::configure_statsd`]. Every metric is
//! tagged with a `function` tag carrying the function id:
//!
//! - `requests.access`: all calls.
//! - `requests.fresh_hit`: calls served lock-free from a fresh value.
//! - `requests.stale_hit`: calls served a stale value while a refresh runs.
//! - `requests.coalesced`: calls that found a refresh already claimed.
//! - `requests.computation`: executions of the wrapped computation.
//! - `requests.timeout`: first-request waits that exceeded the timeout.
//! - `requests.soft_failure`: refreshes that failed with a timeout or
//!   connectivity error.
//! - `requests.failure`: refreshes that failed with any other error while
//!   default substitution for failures is enabled.
//! - `requests.default_used`: calls answered with the default value.
//! - `store.evicted` / `store.cleared`: sweep and clear activity.
//! - `resolve.duration` / `default.duration`: computation timers.

#[macro_use]
pub mod metrics;

mod config;
mod error;
mod function;
mod holder;
mod key;
mod store;
mod task;
mod utils;

#[cfg(test)]
mod tests;

pub use config::{FunctionConfig, StoreConfig};
pub use error::{ResolveError, ResolveResult};
pub use function::{
    AsyncFunction, BeforeHook, Context, DefaultValueSupplier, IdentifierProvider, Resolver,
};
pub use key::RequestKey;
