//! Rendezvous throughput micro-benchmark.
//!
//! Run with: cargo bench --bench matcher

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use switchyard::matcher::TaskMatcher;
use switchyard::rate_limiter::RateLimiter;
use switchyard::task::{InternalTask, TaskInfo};

const TASKS: u64 = 50_000;
const POLLERS: usize = 8;
const PRODUCERS: usize = 4;

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("runtime");
    runtime.block_on(run());
}

async fn run() {
    let matcher = Arc::new(TaskMatcher::new(
        Arc::new(RateLimiter::new(f64::INFINITY)),
        None,
        Duration::from_millis(50),
    ));
    let received = Arc::new(AtomicU64::new(0));

    let mut pollers = Vec::new();
    for _ in 0..POLLERS {
        let matcher = matcher.clone();
        let received = received.clone();
        pollers.push(tokio::spawn(async move {
            loop {
                match matcher.poll(Duration::from_millis(500), None).await {
                    Some(mut task) => {
                        task.finish(Ok(()));
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                    None => break,
                }
            }
        }));
    }

    let start = Instant::now();
    let mut producers = Vec::new();
    for p in 0..PRODUCERS as u64 {
        let matcher = matcher.clone();
        producers.push(tokio::spawn(async move {
            for i in 0..TASKS / PRODUCERS as u64 {
                let info = TaskInfo::new("bench", "wf", "run", 1, (p * TASKS + i) as i64, None);
                let task = InternalTask::new_sync_match(info, None);
                matcher.offer(task, Duration::from_secs(5)).await;
            }
        }));
    }
    for producer in producers {
        producer.await.expect("producer");
    }
    let elapsed = start.elapsed();
    for poller in pollers {
        poller.await.expect("poller");
    }

    let matched = received.load(Ordering::Relaxed);
    println!(
        "matched {} tasks in {:?} ({:.0} matches/sec)",
        matched,
        elapsed,
        matched as f64 / elapsed.as_secs_f64()
    );
}
