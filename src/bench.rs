use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use mlua::Value;
use tokio::time::sleep;

use crate::config::Config;
use crate::error::CallOutcome;
use crate::vm::Vm;

const BENCH_SOURCE: &str = r#"
function echo(s)
    return s
end
"#;

pub struct BenchParams {
    pub calls: usize,
    pub concurrency: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    succeeded: usize,
    mismatched: usize,
    failed: usize,
    faulted: usize,
}

impl Tally {
    fn merge(self, other: Tally) -> Tally {
        Tally {
            succeeded: self.succeeded + other.succeeded,
            mismatched: self.mismatched + other.mismatched,
            failed: self.failed + other.failed,
            faulted: self.faulted + other.faulted,
        }
    }
}

#[derive(Debug)]
pub struct BenchReport {
    pub calls: usize,
    pub succeeded: usize,
    pub mismatched: usize,
    pub failed: usize,
    pub faulted: usize,
    pub elapsed: Duration,
    pub capacity: usize,
    pub peak_live: usize,
    pub live_after_load: usize,
    pub live_after_grace: usize,
}

impl BenchReport {
    pub fn calls_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.calls as f64 / secs
        } else {
            0.0
        }
    }
}

/// Echo random inputs through a pooled VM from many blocking tasks at once.
pub async fn run_benchmark(config: &Config, params: BenchParams) -> Result<BenchReport> {
    validate_params(&params)?;

    let vm = Arc::new(Vm::from_config(config)?);
    vm.load_named("bench", BENCH_SOURCE)?;

    let next = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(vm.live_context_count()));
    let start = Instant::now();

    let mut handles = Vec::with_capacity(params.concurrency);
    for _ in 0..params.concurrency {
        let vm = Arc::clone(&vm);
        let next = Arc::clone(&next);
        let peak = Arc::clone(&peak);
        let calls = params.calls;

        handles.push(tokio::task::spawn_blocking(move || {
            let mut tally = Tally::default();
            loop {
                let i = next.fetch_add(1, Ordering::Relaxed);
                if i >= calls {
                    break;
                }

                let input = format!("call-{}", i);
                match vm.invoke("echo", input.as_str(), 1) {
                    CallOutcome::Success(values) => match values.first() {
                        Some(Value::String(s)) if s.to_string_lossy() == input => {
                            tally.succeeded += 1
                        }
                        _ => tally.mismatched += 1,
                    },
                    CallOutcome::Failed(_) => tally.failed += 1,
                    CallOutcome::Fault(_) => tally.faulted += 1,
                }
                peak.fetch_max(vm.live_context_count(), Ordering::Relaxed);
            }
            tally
        }));
    }

    let mut tally = Tally::default();
    for handle in handles {
        tally = tally.merge(handle.await?);
    }
    let elapsed = start.elapsed();
    let live_after_load = vm.live_context_count();

    // Let parked contexts run out their grace period
    sleep(config.pool.release_timeout() + Duration::from_millis(250)).await;

    Ok(BenchReport {
        calls: params.calls,
        succeeded: tally.succeeded,
        mismatched: tally.mismatched,
        failed: tally.failed,
        faulted: tally.faulted,
        elapsed,
        capacity: config.pool.capacity,
        peak_live: peak.load(Ordering::Relaxed),
        live_after_load,
        live_after_grace: vm.live_context_count(),
    })
}

fn validate_params(params: &BenchParams) -> Result<()> {
    if params.calls == 0 {
        return Err(anyhow!("Must issue at least 1 call"));
    }
    if params.concurrency == 0 {
        return Err(anyhow!("Must have at least 1 concurrent caller"));
    }
    Ok(())
}

pub fn display_report(report: &BenchReport) {
    println!("\n📊 Benchmark Results");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("   Calls:            {}", report.calls);
    println!("   Succeeded:        {}", report.succeeded);
    if report.mismatched > 0 {
        println!("   Mismatched:       {}", report.mismatched);
    }
    if report.failed > 0 {
        println!("   Failed:           {}", report.failed);
    }
    if report.faulted > 0 {
        println!("   Faulted:          {}", report.faulted);
    }
    println!("   Duration:         {:.2}s", report.elapsed.as_secs_f64());
    println!("   Throughput:       {:.0} calls/sec", report.calls_per_sec());
    println!("\n🧵 Contexts (capacity {}):", report.capacity);
    println!("   Peak live:        {}", report.peak_live);
    println!("   After load:       {}", report.live_after_load);
    println!("   After grace:      {}", report.live_after_grace);
}
