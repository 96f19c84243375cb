use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use revalidate_test::{eventually, setup};

use crate::config::{FunctionConfig, StoreConfig};
use crate::error::{ResolveError, ResolveResult};
use crate::function::{AsyncFunction, Resolver};

/// A resolver that counts its executions and embeds the execution number in
/// the produced value, so tests can tell refreshed values apart.
#[derive(Clone, Default)]
struct TestResolver {
    computations: Arc<AtomicUsize>,
    delay: Duration,
    failure: Arc<Mutex<Option<ResolveError>>>,
}

impl TestResolver {
    fn new(delay: Duration) -> Self {
        TestResolver {
            delay,
            ..Default::default()
        }
    }

    fn failing(delay: Duration, error: ResolveError) -> Self {
        TestResolver {
            delay,
            failure: Arc::new(Mutex::new(Some(error))),
            ..Default::default()
        }
    }

    fn recover(&self) {
        *self.failure.lock().unwrap() = None;
    }

    fn computations(&self) -> usize {
        self.computations.load(Ordering::SeqCst)
    }
}

impl Resolver for TestResolver {
    type Input = String;
    type Output = String;

    fn resolve<'a>(&'a self, input: &'a String) -> BoxFuture<'a, ResolveResult<String>> {
        let run = self.computations.fetch_add(1, Ordering::SeqCst) + 1;

        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            if let Some(error) = self.failure.lock().unwrap().clone() {
                return Err(error);
            }
            Ok(format!("{input} #{run}"))
        })
    }
}

fn function(resolver: &TestResolver, timeout: Duration, expiration: Duration) -> AsyncFunction<TestResolver> {
    AsyncFunction::with_config(
        "test",
        resolver.clone(),
        FunctionConfig {
            timeout,
            expiration,
            ..Default::default()
        },
        StoreConfig::default(),
    )
}

/// N callers hitting a brand-new key concurrently share one execution and
/// one result.
#[tokio::test(flavor = "multi_thread")]
async fn test_single_flight() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(100));
    let function = function(&resolver, Duration::from_millis(500), Duration::from_secs(5));

    let calls = (0..8).map(|_| {
        let function = function.clone();
        tokio::spawn(async move { function.apply("EUR".to_string()).await })
    });
    let results = futures::future::join_all(calls).await;

    for result in results {
        assert_eq!(result.unwrap().unwrap(), "EUR #1");
    }
    assert_eq!(resolver.computations(), 1);
}

/// Within the freshness cutoff the cached value is served without invoking
/// the computation again.
#[tokio::test]
async fn test_freshness_fast_path() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5));

    let first = function.apply("EUR".to_string()).await.unwrap();
    let second = function.apply("EUR".to_string()).await.unwrap();

    assert_eq!(first, "EUR #1");
    assert_eq!(second, "EUR #1");
    assert_eq!(resolver.computations(), 1);
}

/// Past the cutoff a call returns the previous value immediately and kicks
/// off exactly one background refresh.
#[tokio::test]
async fn test_stale_while_revalidate() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(20));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_millis(200));

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    tokio::time::sleep(Duration::from_millis(150)).await;

    let started = Instant::now();
    let stale = function.apply("EUR".to_string()).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(40), "stale call must not block");
    assert_eq!(stale, "EUR #1");

    assert!(eventually(Duration::from_secs(2), || resolver.computations() == 2).await);
    assert!(
        eventually(Duration::from_secs(2), || {
            function.get_result(&"EUR".to_string()) == Some("EUR #2".to_string())
        })
        .await
    );
    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #2");
}

/// A slow computation bounds the first caller's wait and still finishes in
/// the background.
#[tokio::test]
async fn test_bounded_first_wait() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(300));
    let function = function(&resolver, Duration::from_millis(50), Duration::from_secs(5));

    let started = Instant::now();
    let result = function.apply("EUR".to_string()).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(ResolveError::Timeout(Duration::from_millis(50))));
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(250), "the wait must abandon, not ride along");

    // The abandoned execution still completes and populates the cache.
    assert!(
        eventually(Duration::from_secs(2), || {
            function.has_result(&"EUR".to_string())
        })
        .await
    );
    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    assert_eq!(resolver.computations(), 1);
}

/// With a default configured for all failures, `apply` never surfaces an
/// error; the default is computed once and then cached.
#[tokio::test]
async fn test_default_substitution() {
    setup();

    let resolver = TestResolver::failing(
        Duration::from_millis(10),
        ResolveError::Failed("boom".into()),
    );
    let supplier_calls = Arc::new(AtomicUsize::new(0));
    let calls = Arc::clone(&supplier_calls);
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_default_value(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            "fallback".to_string()
        });

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "fallback");
    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "fallback");

    assert_eq!(supplier_calls.load(Ordering::SeqCst), 1);
    assert_eq!(resolver.computations(), 2);
}

/// Hard failures propagate as the computation's own error when substitution
/// for failures is disabled.
#[tokio::test]
async fn test_hard_failure_propagates() {
    setup();

    let resolver = TestResolver::failing(
        Duration::from_millis(10),
        ResolveError::Failed("boom".into()),
    );
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_default_value_policy(|| "fallback".to_string(), false);

    assert_eq!(
        function.apply("EUR".to_string()).await,
        Err(ResolveError::Failed("boom".into()))
    );
}

/// Connectivity failures are soft: the default applies even with
/// substitution for failures disabled.
#[tokio::test]
async fn test_soft_failure_uses_default() {
    setup();

    let resolver = TestResolver::failing(
        Duration::from_millis(10),
        ResolveError::Connectivity("unplugged".into()),
    );
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_default_value_policy(|| "fallback".to_string(), false);

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "fallback");
}

/// A key served by the default keeps retrying; once the computation
/// recovers, callers get the real value.
#[tokio::test]
async fn test_recovery_after_failure() {
    setup();

    let resolver = TestResolver::failing(
        Duration::from_millis(10),
        ResolveError::Connectivity("unplugged".into()),
    );
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_default_value(|| "fallback".to_string());

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "fallback");

    resolver.recover();
    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #2");
}

/// `clear` wipes every cached value and default; the next call resolves
/// from scratch.
#[tokio::test]
async fn test_clear_resets_state() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_default_value(|| "fallback".to_string());

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    function.clear();

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #2");
    assert_eq!(resolver.computations(), 2);
}

/// End to end: function id `rate`, timeout 100ms, expiration 5s, four calls
/// covering first resolution, fresh hit, stale hit and refreshed value.
#[tokio::test(flavor = "multi_thread")]
async fn test_rate_scenario() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(30));
    let rate = AsyncFunction::new("rate", resolver.clone())
        .with_timeout(Duration::from_millis(100))
        .with_expiration(Duration::from_secs(5));

    // Call 1 blocks at most 100ms and resolves live.
    let started = Instant::now();
    assert_eq!(rate.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    assert!(started.elapsed() < Duration::from_millis(100));

    // Call 2 shortly after returns the identical value with no wait.
    tokio::time::sleep(Duration::from_millis(10)).await;
    let started = Instant::now();
    assert_eq!(rate.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    assert!(started.elapsed() < Duration::from_millis(20));
    assert_eq!(resolver.computations(), 1);

    // Call 3 after the freshness window serves the prior value and refreshes
    // in the background; call 4 sees the refreshed value.
    tokio::time::sleep(Duration::from_secs(5)).await;
    let started = Instant::now();
    assert_eq!(rate.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    assert!(started.elapsed() < Duration::from_millis(20));

    assert!(
        eventually(Duration::from_secs(2), || {
            rate.get_result(&"EUR".to_string()) == Some("EUR #2".to_string())
        })
        .await
    );
    assert_eq!(rate.apply("EUR".to_string()).await.unwrap(), "EUR #2");
    assert_eq!(resolver.computations(), 2);
}

/// Introspection reports state without ever triggering a computation.
#[tokio::test]
async fn test_introspection_never_computes() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5));
    let input = "EUR".to_string();

    assert!(!function.has_result(&input));
    assert!(function.is_expired(&input));
    assert_eq!(function.get_result(&input), None);
    assert_eq!(resolver.computations(), 0);

    function.apply(input.clone()).await.unwrap();

    assert!(function.has_result(&input));
    assert!(!function.is_expired(&input));
    assert_eq!(function.get_result(&input), Some("EUR #1".to_string()));
    assert_eq!(resolver.computations(), 1);
}

/// Derived variants share the response store of the instance they came from.
#[tokio::test]
async fn test_variants_share_store() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let base = function(&resolver, Duration::from_millis(100), Duration::from_secs(5));
    let variant = base.with_timeout(Duration::from_millis(200));

    assert_eq!(base.apply("EUR".to_string()).await.unwrap(), "EUR #1");

    assert!(variant.has_result(&"EUR".to_string()));
    assert_eq!(variant.apply("EUR".to_string()).await.unwrap(), "EUR #1");
    assert_eq!(resolver.computations(), 1);
}

/// Counters track calls and synchronous resolutions across variants.
#[tokio::test]
async fn test_counters() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5));

    function.apply("EUR".to_string()).await.unwrap();
    function.apply("EUR".to_string()).await.unwrap();
    function.apply("USD".to_string()).await.unwrap();

    assert_eq!(function.request_count(), 3);
    assert_eq!(function.resolved_count(), 2);
}

/// A forced cleanup evicts idle holders, after which the key resolves from
/// scratch.
#[tokio::test]
async fn test_forced_cleanup_evicts_idle_holders() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = AsyncFunction::with_config(
        "test",
        resolver.clone(),
        FunctionConfig::default(),
        StoreConfig {
            sweep_window: Duration::from_millis(50),
            ..Default::default()
        },
    );

    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #1");

    tokio::time::sleep(Duration::from_millis(80)).await;
    function.cleanup(true);

    assert!(!function.has_result(&"EUR".to_string()));
    assert_eq!(function.apply("EUR".to_string()).await.unwrap(), "EUR #2");
}

/// The per-call context reaches the before-hook of the matching background
/// execution.
#[tokio::test]
async fn test_before_hook_receives_context() {
    setup();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_on_before(move |input: &String, context| {
            let tag = context
                .and_then(|c| c.downcast_ref::<u32>())
                .copied();
            sink.lock().unwrap().push((input.clone(), tag));
        });

    function
        .apply_with_context("EUR".to_string(), Some(Arc::new(42u32)))
        .await
        .unwrap();
    function.apply("USD".to_string()).await.unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![("EUR".to_string(), Some(42)), ("USD".to_string(), None)]
    );
}

/// An identifier provider yielding an empty id is rejected before any holder
/// is created.
#[tokio::test]
async fn test_empty_identifier_is_rejected() {
    setup();

    let resolver = TestResolver::new(Duration::from_millis(10));
    let function = function(&resolver, Duration::from_millis(100), Duration::from_secs(5))
        .with_identifier(|_input: &String| String::new());

    assert!(matches!(
        function.apply("EUR".to_string()).await,
        Err(ResolveError::Failed(_))
    ));
    assert_eq!(resolver.computations(), 0);
}
