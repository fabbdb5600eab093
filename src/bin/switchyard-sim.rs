//! End-to-end simulation of the matching core over the in-memory store:
//! a handful of producers add activity tasks while pollers drain them,
//! reporting sync-match rate and throughput at the end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use tracing::info;

use switchyard::api::{AddActivityTaskRequest, PollRequest, TaskList, WorkflowExecution};
use switchyard::domain::StaticDomainCache;
use switchyard::engine::MatchingEngine;
use switchyard::settings::AppConfig;
use switchyard::store::memory::MemoryTaskStore;

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Args {
    /// Duration to run the simulation, in seconds
    #[arg(long, default_value = "10")]
    duration_secs: u64,
    /// Number of concurrent producers
    #[arg(long, default_value = "4")]
    producers: usize,
    /// Number of concurrent pollers
    #[arg(long, default_value = "4")]
    pollers: usize,
    /// Delay between adds per producer, in milliseconds
    #[arg(long, default_value = "5")]
    produce_interval_ms: u64,
    /// path to a TOML config file
    #[arg(short = 'c', long = "config")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let cfg = AppConfig::load(args.config.as_deref())?;
    switchyard::trace::init(cfg.log_format.clone());

    let metrics = switchyard::metrics::init()?;
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);
    if cfg.metrics.enabled {
        let addr: SocketAddr = cfg.metrics.addr.parse()?;
        tokio::spawn(switchyard::metrics::run_metrics_server(
            addr,
            metrics.clone(),
            shutdown_tx.subscribe(),
        ));
    }

    let store = MemoryTaskStore::new();
    let domains = Arc::new(StaticDomainCache::new());
    domains.set_name("sim-domain", "sim");
    let engine = MatchingEngine::new(
        store.clone(),
        domains,
        Arc::new(cfg.matching.clone()),
        metrics,
    );

    let deadline = Instant::now() + Duration::from_secs(args.duration_secs);
    let added = Arc::new(AtomicU64::new(0));
    let sync_matched = Arc::new(AtomicU64::new(0));
    let received = Arc::new(AtomicU64::new(0));

    let mut workers = Vec::new();
    for p in 0..args.producers {
        let engine = engine.clone();
        let added = added.clone();
        let sync_matched = sync_matched.clone();
        workers.push(tokio::spawn(async move {
            let mut schedule_id = 0i64;
            while Instant::now() < deadline {
                schedule_id += 1;
                let request = AddActivityTaskRequest {
                    domain_id: "sim-domain".to_string(),
                    task_list: TaskList::normal("sim-tasks"),
                    execution: WorkflowExecution {
                        workflow_id: format!("wf-{p}-{schedule_id}"),
                        run_id: format!("run-{p}"),
                    },
                    schedule_id,
                    schedule_to_start_timeout: Some(Duration::from_secs(60)),
                    forwarded_from: None,
                };
                match engine.add_activity_task(request).await {
                    Ok(response) => {
                        added.fetch_add(1, Ordering::Relaxed);
                        if response.sync_matched {
                            sync_matched.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    Err(err) => info!(error = %err, "add failed"),
                }
                tokio::time::sleep(Duration::from_millis(args.produce_interval_ms)).await;
            }
        }));
    }

    for w in 0..args.pollers {
        let engine = engine.clone();
        let received = received.clone();
        workers.push(tokio::spawn(async move {
            while Instant::now() < deadline {
                let request = PollRequest {
                    domain_id: "sim-domain".to_string(),
                    task_list: TaskList::normal("sim-tasks"),
                    identity: format!("sim-worker-{w}"),
                    poller_id: None,
                    max_tasks_per_second: None,
                    timeout: Some(Duration::from_secs(2)),
                    forwarded_from: None,
                };
                match engine.poll_for_activity_task(request).await {
                    Ok(response) if !response.is_empty() => {
                        received.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(_) => {}
                    Err(err) => info!(error = %err, "poll failed"),
                }
            }
        }));
    }

    for worker in workers {
        let _ = worker.await;
    }
    let _ = shutdown_tx.send(());

    let added = added.load(Ordering::Relaxed);
    let sync_matched = sync_matched.load(Ordering::Relaxed);
    let received = received.load(Ordering::Relaxed);
    info!(
        added,
        sync_matched,
        received,
        sync_match_rate = if added > 0 {
            sync_matched as f64 / added as f64
        } else {
            0.0
        },
        "simulation finished"
    );
    Ok(())
}
