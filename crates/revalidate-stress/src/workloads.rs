use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use revalidate::{ResolveError, ResolveResult, Resolver};

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    /// Number of concurrent callers.
    pub concurrency: usize,
    /// Number of distinct inputs the callers rotate through.
    pub keys: usize,
    /// How long one computation takes.
    #[serde(with = "humantime_serde")]
    pub resolve_delay: Duration,
    /// First-request timeout of the function under test.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Expiration window of the function under test.
    #[serde(with = "humantime_serde")]
    pub expiration: Duration,
    /// Fail every n-th computation with a connectivity error.
    #[serde(default)]
    pub fail_every: Option<usize>,
}

impl Default for WorkloadsConfig {
    fn default() -> Self {
        WorkloadsConfig {
            workloads: vec![
                // Cache-friendly: few hot keys, generous freshness.
                Workload {
                    concurrency: 64,
                    keys: 8,
                    resolve_delay: Duration::from_millis(50),
                    timeout: Duration::from_millis(100),
                    expiration: Duration::from_secs(2),
                    fail_every: None,
                },
                // Churny: wide key space forces frequent first requests.
                Workload {
                    concurrency: 32,
                    keys: 512,
                    resolve_delay: Duration::from_millis(20),
                    timeout: Duration::from_millis(100),
                    expiration: Duration::from_millis(500),
                    fail_every: None,
                },
                // Flaky: every fourth computation loses its connection.
                Workload {
                    concurrency: 32,
                    keys: 16,
                    resolve_delay: Duration::from_millis(30),
                    timeout: Duration::from_millis(60),
                    expiration: Duration::from_secs(1),
                    fail_every: Some(4),
                },
            ],
        }
    }
}

/// The computation under stress: a sleep standing in for a remote call, with
/// optional injected connectivity failures.
#[derive(Clone)]
pub struct StressResolver {
    delay: Duration,
    fail_every: Option<usize>,
    computations: Arc<AtomicUsize>,
}

impl StressResolver {
    pub fn new(delay: Duration, fail_every: Option<usize>) -> Self {
        StressResolver {
            delay,
            fail_every,
            computations: Default::default(),
        }
    }

    pub fn computations(&self) -> usize {
        self.computations.load(Ordering::Relaxed)
    }
}

impl Resolver for StressResolver {
    type Input = String;
    type Output = String;

    fn resolve<'a>(&'a self, input: &'a String) -> BoxFuture<'a, ResolveResult<String>> {
        let run = self.computations.fetch_add(1, Ordering::Relaxed) + 1;

        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            if self.fail_every.is_some_and(|n| run % n == 0) {
                return Err(ResolveError::Connectivity("injected failure".into()));
            }
            Ok(format!("{input}:{run}"))
        })
    }
}
