use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use revalidate::{AsyncFunction, FunctionConfig, StoreConfig};

use crate::workloads::{StressResolver, Workload, WorkloadsConfig};

pub async fn perform_stresstest(workloads: WorkloadsConfig, duration: Duration) -> Result<()> {
    let mut tasks = Vec::with_capacity(workloads.workloads.len());
    for (index, workload) in workloads.workloads.into_iter().enumerate() {
        tasks.push(tokio::spawn(run_workload(index, workload, duration)));
    }

    for task in tasks {
        let report = task.await?;
        println!("{report}");
    }

    Ok(())
}

async fn run_workload(index: usize, workload: Workload, duration: Duration) -> Report {
    let resolver = StressResolver::new(workload.resolve_delay, workload.fail_every);
    let function = AsyncFunction::with_config(
        &format!("workload {index}"),
        resolver.clone(),
        FunctionConfig {
            timeout: workload.timeout,
            expiration: workload.expiration,
            ..Default::default()
        },
        StoreConfig::default(),
    )
    .with_default_value(|| "default".to_string());

    // Warm every key once so the steady-state loop measures cache behavior,
    // not a burst of cold first requests.
    let warmup_started = Instant::now();
    let warmup = (0..workload.keys).map(|key| function.apply(format!("key {key}")));
    let _results = futures::future::join_all(warmup).await;
    let warmup = warmup_started.elapsed();

    let latencies = Arc::new(Mutex::new(DDSketch::default()));
    let calls = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let next_key = Arc::new(AtomicUsize::new(0));
    let semaphore = Arc::new(Semaphore::new(workload.concurrency));
    let deadline = Instant::now() + duration;

    while Instant::now() < deadline {
        let permit = Arc::clone(&semaphore).acquire_owned().await.unwrap();
        let function = function.clone();
        let latencies = Arc::clone(&latencies);
        let calls = Arc::clone(&calls);
        let errors = Arc::clone(&errors);
        let key = next_key.fetch_add(1, Ordering::Relaxed) % workload.keys;

        tokio::spawn(async move {
            let started = Instant::now();
            let result = function.apply(format!("key {key}")).await;

            latencies
                .lock()
                .unwrap()
                .add(started.elapsed().as_secs_f64());
            calls.fetch_add(1, Ordering::Relaxed);
            if result.is_err() {
                errors.fetch_add(1, Ordering::Relaxed);
            }

            drop(permit);
        });
    }

    // Acquiring every permit waits for all outstanding callers to finish.
    let _permits = semaphore
        .acquire_many(workload.concurrency as u32)
        .await
        .unwrap();

    let latencies = std::mem::take(&mut *latencies.lock().unwrap());
    Report {
        index,
        concurrency: workload.concurrency,
        keys: workload.keys,
        warmup,
        calls: calls.load(Ordering::Relaxed),
        errors: errors.load(Ordering::Relaxed),
        computations: resolver.computations(),
        latencies,
    }
}

struct Report {
    index: usize,
    concurrency: usize,
    keys: usize,
    warmup: Duration,
    calls: usize,
    errors: usize,
    computations: usize,
    latencies: DDSketch,
}

impl Report {
    fn quantile_ms(&self, q: f64) -> f64 {
        self.latencies
            .quantile(q)
            .ok()
            .flatten()
            .unwrap_or_default()
            * 1000.0
    }
}

impl std::fmt::Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "workload {} (concurrency {}, keys {}): warmup {:?}",
            self.index, self.concurrency, self.keys, self.warmup
        )?;
        writeln!(
            f,
            "  calls: {}, errors: {}, computations: {}",
            self.calls, self.errors, self.computations
        )?;
        write!(
            f,
            "  latency ms: p50 {:.3}, p95 {:.3}, p99 {:.3}, max {:.3}",
            self.quantile_ms(0.50),
            self.quantile_ms(0.95),
            self.quantile_ms(0.99),
            self.latencies.max().unwrap_or_default() * 1000.0,
        )
    }
}
