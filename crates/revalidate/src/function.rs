use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tokio::runtime::Handle;

use crate::config::{FunctionConfig, StoreConfig};
use crate::error::{ResolveError, ResolveResult};
use crate::holder::ResponseHolder;
use crate::key::{self, RequestKey};
use crate::store::ResponseStore;
use crate::task::BackgroundTask;

/// An ephemeral per-call context, threaded explicitly from the caller into
/// the before-hook of the matching background execution.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Derives the cache identifier of an input.
pub type IdentifierProvider<I> = Arc<dyn Fn(&I) -> String + Send + Sync>;

/// Produces the default value substituted for failed or timed-out
/// resolutions. Computed lazily, at most once per key, then cached.
pub type DefaultValueSupplier<O> = Arc<dyn Fn() -> O + Send + Sync>;

/// Invoked inside the background execution, before the computation, with the
/// input and the per-call context of the call that claimed the refresh.
pub type BeforeHook<I> = Arc<dyn Fn(&I, Option<&Context>) + Send + Sync>;

/// The wrapped computation.
///
/// Implementations are cheaply cloneable handles; a clone is moved into every
/// background execution.
pub trait Resolver: Clone + Send + Sync + 'static {
    type Input: Clone + Send + Sync + 'static;
    type Output: Clone + Send + Sync + 'static;

    /// Computes the value for one input. Failures must be classified into
    /// [`ResolveError`], see the [`From`] conversions there.
    fn resolve<'a>(&'a self, input: &'a Self::Input) -> BoxFuture<'a, ResolveResult<Self::Output>>;
}

/// A request-coalescing, self-refreshing cache around a [`Resolver`].
///
/// Calling [`apply`](Self::apply) resolves a value for an input: served
/// lock-free from cache while fresh, refreshed in the background once stale,
/// and computed synchronously (bounded by the timeout) only on the very first
/// resolution of a key.
///
/// With-style methods derive new instances carrying different knob values.
/// All variants derived from one instance share the same response store, so
/// they coalesce and cache together.
pub struct AsyncFunction<R: Resolver> {
    pub(crate) resolver: R,
    pub(crate) name: Arc<str>,
    pub(crate) config: FunctionConfig,
    identifier: IdentifierProvider<R::Input>,
    default_value: Option<DefaultValueSupplier<R::Output>>,
    pub(crate) on_before: Option<BeforeHook<R::Input>>,
    runtime: Option<Handle>,
    store: Arc<ResponseStore<R::Output>>,
    request_count: Arc<AtomicUsize>,
    resolved_count: Arc<AtomicUsize>,
}

impl<R: Resolver> fmt::Debug for AsyncFunction<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncFunction")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("requests", &self.request_count.load(Ordering::Relaxed))
            .field("resolved", &self.resolved_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl<R: Resolver> Clone for AsyncFunction<R> {
    fn clone(&self) -> Self {
        AsyncFunction {
            resolver: self.resolver.clone(),
            name: Arc::clone(&self.name),
            config: self.config.clone(),
            identifier: Arc::clone(&self.identifier),
            default_value: self.default_value.clone(),
            on_before: self.on_before.clone(),
            runtime: self.runtime.clone(),
            store: Arc::clone(&self.store),
            request_count: Arc::clone(&self.request_count),
            resolved_count: Arc::clone(&self.resolved_count),
        }
    }
}

impl<R: Resolver> AsyncFunction<R>
where
    R::Input: Hash,
{
    /// Creates a function with default configuration and the default
    /// identifier provider, a stable digest of the input's [`Hash`].
    ///
    /// # Panics
    ///
    /// Panics if `id` normalizes to an empty identifier.
    pub fn new(id: &str, resolver: R) -> Self {
        Self::with_config(id, resolver, Default::default(), Default::default())
    }

    /// Creates a function with explicit configuration.
    pub fn with_config(
        id: &str,
        resolver: R,
        config: FunctionConfig,
        store_config: StoreConfig,
    ) -> Self {
        let name: Arc<str> = key::to_identifier(id).into();
        assert!(
            !name.is_empty(),
            "function id must contain at least one alphanumeric character"
        );

        AsyncFunction {
            resolver,
            store: Arc::new(ResponseStore::new(Arc::clone(&name), store_config)),
            name,
            config,
            identifier: Arc::new(|input: &R::Input| key::default_identifier(input)),
            default_value: None,
            on_before: None,
            runtime: None,
            request_count: Arc::new(AtomicUsize::new(0)),
            resolved_count: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<R: Resolver> AsyncFunction<R> {
    /// The normalized function id.
    pub fn id(&self) -> &str {
        &self.name
    }

    /// Derives an instance with a different first-request timeout.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let mut copy = self.clone();
        copy.config.timeout = timeout;
        copy
    }

    /// Derives an instance with a different expiration window.
    pub fn with_expiration(&self, expiration: Duration) -> Self {
        let mut copy = self.clone();
        copy.config.expiration = expiration;
        copy
    }

    /// Derives an instance with a different identifier provider.
    pub fn with_identifier(
        &self,
        provider: impl Fn(&R::Input) -> String + Send + Sync + 'static,
    ) -> Self {
        let mut copy = self.clone();
        copy.identifier = Arc::new(provider);
        copy
    }

    /// Derives an instance substituting `supplier`'s value for any failed or
    /// timed-out resolution.
    pub fn with_default_value(
        &self,
        supplier: impl Fn() -> R::Output + Send + Sync + 'static,
    ) -> Self {
        self.with_default_value_policy(supplier, true)
    }

    /// Derives an instance with a default value and an explicit substitution
    /// policy. When `use_default_with_failures` is false, only timeouts and
    /// connectivity errors are substituted.
    pub fn with_default_value_policy(
        &self,
        supplier: impl Fn() -> R::Output + Send + Sync + 'static,
        use_default_with_failures: bool,
    ) -> Self {
        let mut copy = self.clone();
        copy.default_value = Some(Arc::new(supplier));
        copy.config.use_default_with_failures = use_default_with_failures;
        copy
    }

    /// Derives an instance running its background executions on `runtime`
    /// instead of the caller's runtime.
    pub fn with_runtime(&self, runtime: Handle) -> Self {
        let mut copy = self.clone();
        copy.runtime = Some(runtime);
        copy
    }

    /// Derives an instance invoking `hook` before every background execution.
    pub fn with_on_before(
        &self,
        hook: impl Fn(&R::Input, Option<&Context>) + Send + Sync + 'static,
    ) -> Self {
        let mut copy = self.clone();
        copy.on_before = Some(Arc::new(hook));
        copy
    }

    /// Resolves the value for `input`.
    ///
    /// Serves the cached value while fresh; past the freshness cutoff the
    /// call triggers a background refresh and keeps serving the previous
    /// value. Only the very first resolution of a key blocks, bounded by the
    /// configured timeout.
    pub async fn apply(&self, input: R::Input) -> ResolveResult<R::Output> {
        self.apply_with_context(input, None).await
    }

    /// Like [`apply`](Self::apply), with an ephemeral per-call context that
    /// is handed to the before-hook of the matching background execution.
    pub async fn apply_with_context(
        &self,
        input: R::Input,
        context: Option<Context>,
    ) -> ResolveResult<R::Output> {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.store.sweep(false);

        let key = self.request_key(&input)?;
        metric!(counter("requests.access") += 1, "function" => &self.name);

        let holder = self.store.get_or_create(&key);
        if let Some(result) = holder.fresh_result(self.config.freshness()) {
            metric!(counter("requests.fresh_hit") += 1, "function" => &self.name);
            return Ok(result);
        }
        self.execute(key, input, context, holder).await
    }

    /// Whether a result is cached for `input`, expired or not. Never
    /// triggers a computation.
    pub fn has_result(&self, input: &R::Input) -> bool {
        let Ok(key) = self.request_key(input) else {
            return false;
        };
        !self.store.get_or_create(&key).is_first_request()
    }

    /// Whether `input` currently has no usable fresh result. Never triggers
    /// a computation.
    pub fn is_expired(&self, input: &R::Input) -> bool {
        let Ok(key) = self.request_key(input) else {
            return true;
        };
        let holder = self.store.get_or_create(&key);
        holder.is_first_request() || holder.expired(self.config.freshness())
    }

    /// The cached result for `input`, if any. Never blocks and never
    /// triggers a computation; combine with [`has_result`](Self::has_result)
    /// or [`is_expired`](Self::is_expired) to judge the value.
    pub fn get_result(&self, input: &R::Input) -> Option<R::Output> {
        let key = self.request_key(input).ok()?;
        self.store.get_or_create(&key).result()
    }

    /// The number of times the function was called.
    pub fn request_count(&self) -> usize {
        self.request_count.load(Ordering::Relaxed)
    }

    /// The number of times a caller synchronously received a freshly
    /// computed value.
    pub fn resolved_count(&self) -> usize {
        self.resolved_count.load(Ordering::Relaxed)
    }

    /// Evicts idle holders from the shared store; `force` bypasses the sweep
    /// throttle.
    pub fn cleanup(&self, force: bool) {
        self.store.sweep(force);
    }

    /// Wipes the shared store. Every key resolves from scratch afterwards.
    pub fn clear(&self) {
        self.store.clear();
    }

    fn request_key(&self, input: &R::Input) -> ResolveResult<RequestKey> {
        let input_id = (self.identifier)(input);
        if input_id.is_empty() {
            return Err(ResolveError::Failed(
                "identifier provider returned an empty id".into(),
            ));
        }
        Ok(RequestKey::from_parts(&self.name, &input_id))
    }

    fn runtime(&self) -> Handle {
        self.runtime.clone().unwrap_or_else(Handle::current)
    }

    /// The locked path: decides between claiming an execution, waiting on it
    /// (first request only), and serving the stale value.
    async fn execute(
        &self,
        key: RequestKey,
        input: R::Input,
        context: Option<Context>,
        holder: Arc<ResponseHolder<R::Output>>,
    ) -> ResolveResult<R::Output> {
        let _decision = holder.lock().await;

        // Another caller may have finished a computation while this one was
        // waiting for the lock.
        if let Some(result) = holder.fresh_result(self.config.freshness()) {
            return Ok(result);
        }

        let stale = holder.result();
        let first_request = holder.is_first_request();
        let claimed = first_request || holder.claim_refresh();
        if !claimed {
            metric!(counter("requests.coalesced") += 1, "function" => &self.name);
            return self.serve_stale(stale, &holder);
        }

        let task = BackgroundTask {
            function: self.clone(),
            key,
            input,
            context,
            holder: Arc::clone(&holder),
        };
        let execution = self.runtime().spawn(task.run());

        if first_request {
            match tokio::time::timeout(self.config.timeout, execution).await {
                Ok(Ok(Ok(value))) => {
                    self.resolved_count.fetch_add(1, Ordering::Relaxed);
                    Ok(value)
                }
                Ok(Ok(Err(error))) => {
                    if error.is_interrupted() {
                        return Err(error);
                    }
                    self.handle_failure(error, &holder)
                }
                Ok(Err(join_error)) => {
                    let error = ResolveError::from_join_error(join_error);
                    if error.is_interrupted() {
                        return Err(error);
                    }
                    self.handle_failure(error, &holder)
                }
                // The wait is abandoned but the execution is not: it keeps
                // running and updates the holder for future callers.
                Err(_elapsed) => {
                    metric!(counter("requests.timeout") += 1, "function" => &self.name);
                    self.handle_failure(ResolveError::Timeout(self.config.timeout), &holder)
                }
            }
        } else {
            metric!(counter("requests.stale_hit") += 1, "function" => &self.name);
            self.serve_stale(stale, &holder)
        }
    }

    fn serve_stale(
        &self,
        stale: Option<R::Output>,
        holder: &ResponseHolder<R::Output>,
    ) -> ResolveResult<R::Output> {
        match stale {
            Some(value) => Ok(value),
            // The previous value was evicted while a refresh is in flight.
            // The caller must not wait, so the miss classifies as a
            // bounded-wait timeout and goes through default substitution.
            None => self.handle_failure(ResolveError::Timeout(self.config.timeout), holder),
        }
    }

    fn handle_failure(
        &self,
        error: ResolveError,
        holder: &ResponseHolder<R::Output>,
    ) -> ResolveResult<R::Output> {
        let default_result = self.default_result(holder);
        if self.config.use_default_with_failures || error.is_soft() {
            if let Some(value) = default_result {
                metric!(counter("requests.default_used") += 1, "function" => &self.name);
                return Ok(value);
            }
        }
        Err(error)
    }

    /// The cached default value, computing and caching it on first use.
    /// `None` when no supplier is configured.
    fn default_result(&self, holder: &ResponseHolder<R::Output>) -> Option<R::Output> {
        if let Some(value) = holder.default_result() {
            return Some(value);
        }
        let supplier = self.default_value.as_ref()?;
        let started = Instant::now();
        let value = supplier();
        metric!(timer("default.duration") = started.elapsed(), "function" => &self.name);
        holder.store_default(value.clone());
        Some(value)
    }

    pub(crate) fn cache_default(&self, holder: &ResponseHolder<R::Output>) {
        let _ = self.default_result(holder);
    }

    pub(crate) fn substitutes_failures(&self) -> bool {
        self.config.use_default_with_failures
    }
}
