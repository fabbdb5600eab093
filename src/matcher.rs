//! The rendezvous between task producers and long-pollers. A handoff
//! succeeds only when a live poller actually receives the task, which is what
//! lets add_task skip persistence for sync matches.
//!
//! Pollers park a claimable slot on a queue and wait on its receiving end;
//! producers pop slots and claim them with no await point between pop and
//! claim, so a claimed slot either delivers or reports the poller gone.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::debug;

use crate::api::QueryFailedError;
use crate::forwarder::{ForwardError, Forwarder};
use crate::rate_limiter::RateLimiter;
use crate::task::{DispatchResult, InternalTask, QueryResponse};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("no poller available to accept the task")]
    NoPoller,
    #[error("deadline exceeded waiting for a match")]
    DeadlineExceeded,
    #[error("task list is shutting down")]
    Shutdown,
    #[error(transparent)]
    QueryFailed(#[from] QueryFailedError),
}

/// A parked poller. The slot can be claimed exactly once; a poller that
/// times out drops the receiving end, which makes the eventual send fail and
/// the producer move on.
struct Waiter {
    slot: Mutex<Option<oneshot::Sender<InternalTask>>>,
}

impl Waiter {
    fn new(sender: oneshot::Sender<InternalTask>) -> Self {
        Self {
            slot: Mutex::new(Some(sender)),
        }
    }

    fn claim(&self) -> Option<oneshot::Sender<InternalTask>> {
        self.slot.lock().unwrap().take()
    }
}

struct WaiterQueue {
    tx: mpsc::UnboundedSender<Arc<Waiter>>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<Waiter>>>,
}

impl WaiterQueue {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    fn register(&self, waiter: Arc<Waiter>) {
        let _ = self.tx.send(waiter);
    }

    /// Pop live waiters until one claims, without blocking. Contention on the
    /// receiver is treated as "no idle poller right now".
    fn try_pop_claim(&self) -> Option<oneshot::Sender<InternalTask>> {
        let mut rx = self.rx.try_lock().ok()?;
        loop {
            match rx.try_recv() {
                Ok(waiter) => {
                    if let Some(sender) = waiter.claim() {
                        return Some(sender);
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// Pop live waiters until one claims or the wait elapses.
    async fn pop_claim(&self, wait: Duration) -> Option<oneshot::Sender<InternalTask>> {
        let popped = tokio::time::timeout(wait, async {
            let mut rx = self.rx.lock().await;
            loop {
                match rx.recv().await {
                    None => return None,
                    Some(waiter) => {
                        if let Some(sender) = waiter.claim() {
                            return Some(sender);
                        }
                    }
                }
            }
        })
        .await;
        popped.ok().flatten()
    }
}

/// Producer/poller rendezvous for one task list, with rate limiting and
/// optional forwarding to the parent partition.
pub struct TaskMatcher {
    tasks: WaiterQueue,
    queries: WaiterQueue,
    limiter: Arc<RateLimiter>,
    fwdr: Option<Forwarder>,
    forward_retry_interval: Duration,
}

impl TaskMatcher {
    pub fn new(
        limiter: Arc<RateLimiter>,
        fwdr: Option<Forwarder>,
        forward_retry_interval: Duration,
    ) -> Self {
        Self {
            tasks: WaiterQueue::new(),
            queries: WaiterQueue::new(),
            limiter,
            fwdr,
            forward_retry_interval,
        }
    }

    pub fn rate(&self) -> f64 {
        self.limiter.rate()
    }

    /// Apply the latest poller-reported dispatch rate. Last writer wins.
    pub fn update_rate(&self, max_tasks_per_second: Option<f64>) {
        self.limiter.update_rate(max_tasks_per_second);
    }

    pub fn is_forwarding(&self) -> bool {
        self.fwdr.is_some()
    }

    /// Synchronous-match attempt. Takes one rate token without blocking; a
    /// denial or an expired window reports no match and the caller falls back
    /// to persistence. On a match, resolves only after the poller side
    /// finishes the task.
    pub async fn offer(&self, mut task: InternalTask, timeout: Duration) -> bool {
        if !self.limiter.try_consume() {
            debug!("offer rate limited");
            return false;
        }
        let response_rx = task.take_sync_response();

        let mut task = match self.try_deliver(false, task) {
            Ok(()) => return await_sync_response(response_rx).await,
            Err(task) => task,
        };

        if let Some(fwdr) = &self.fwdr {
            if task.forwarded_from.is_none() {
                if fwdr.forward_task(&task).await.is_ok() {
                    task.finish(Ok(()));
                    return true;
                }
            }
        }

        match self.deliver(false, task, timeout).await {
            Ok(()) => await_sync_response(response_rx).await,
            Err(_task) => false,
        }
    }

    /// Backlog path: block on the rate limiter and then on the rendezvous
    /// until the task is accepted somewhere or the task list shuts down.
    pub async fn must_offer(
        &self,
        task: InternalTask,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Result<(), MatchError> {
        tokio::select! {
            _ = self.limiter.consume() => {}
            _ = shutdown.recv() => return Err(MatchError::Shutdown),
        }

        let mut task = task;
        loop {
            let wait = if self.fwdr.is_some() && task.forwarded_from.is_none() {
                self.forward_retry_interval
            } else {
                Duration::from_secs(60)
            };
            let attempt = tokio::select! {
                res = self.deliver(false, task, wait) => res,
                _ = shutdown.recv() => return Err(MatchError::Shutdown),
            };
            match attempt {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    task = returned;
                    if let Some(fwdr) = &self.fwdr {
                        if task.forwarded_from.is_none() && fwdr.forward_task(&task).await.is_ok() {
                            task.finish(Ok(()));
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    /// Dispatch a query and wait for its answer. Bypasses the rate limiter.
    pub async fn offer_query(
        &self,
        mut task: InternalTask,
        timeout: Duration,
    ) -> Result<Bytes, MatchError> {
        let deadline = Instant::now() + timeout;
        let Some(mut rx) = task.take_query_response() else {
            return Err(MatchError::NoPoller);
        };

        let undelivered = match self.try_deliver(true, task) {
            Ok(()) => None,
            Err(task) => Some(task),
        };
        if let Some(task) = undelivered {
            if let Some(fwdr) = &self.fwdr {
                if task.forwarded_from.is_none() {
                    match fwdr.forward_query(&task).await {
                        Ok(response) => return Ok(response.query_result),
                        // A downstream QueryFailedError means a worker saw the
                        // query and failed it; surface it verbatim.
                        Err(ForwardError::Remote(crate::engine::EngineError::QueryFailed(
                            failed,
                        ))) => return Err(MatchError::QueryFailed(failed)),
                        Err(_) => {}
                    }
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Race the response channel against the handoff: the answer can
            // arrive first when the query rides another decision task of the
            // same workflow instead of this dedicated query task.
            let delivered = tokio::select! {
                resolved = &mut rx => return resolve_query_response(resolved),
                delivered = self.deliver(true, task, remaining) => delivered,
            };
            if delivered.is_err() {
                return match rx.try_recv() {
                    Ok(response) => resolve_query_response(Ok(response)),
                    Err(_) => Err(MatchError::DeadlineExceeded),
                };
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx).await {
            Ok(resolved) => resolve_query_response(resolved),
            Err(_) => Err(MatchError::DeadlineExceeded),
        }
    }

    /// Poller side. Parks until a task (and, unless `queries_only`, a normal
    /// task) arrives, the wait elapses, or the poll is cancelled. A timeout
    /// is a normal outcome and returns None rather than an error.
    pub async fn poll(
        &self,
        wait: Duration,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Option<InternalTask> {
        self.poll_inner(wait, cancel, false).await
    }

    /// Poll that only accepts query tasks, used while the owning domain is
    /// not active in this cluster.
    pub async fn poll_for_query(
        &self,
        wait: Duration,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Option<InternalTask> {
        self.poll_inner(wait, cancel, true).await
    }

    async fn poll_inner(
        &self,
        wait: Duration,
        cancel: Option<oneshot::Receiver<()>>,
        queries_only: bool,
    ) -> Option<InternalTask> {
        let (tx, rx) = oneshot::channel();
        let waiter = Arc::new(Waiter::new(tx));
        if queries_only {
            self.queries.register(waiter);
        } else {
            self.tasks.register(waiter.clone());
            self.queries.register(waiter);
        }

        let cancelled = async {
            match cancel {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            got = rx => got.ok(),
            _ = tokio::time::sleep(wait) => None,
            _ = cancelled => None,
            forwarded = self.forwarded_poll_loop() => forwarded,
        }
    }

    async fn forwarded_poll_loop(&self) -> Option<InternalTask> {
        let Some(fwdr) = &self.fwdr else {
            return std::future::pending().await;
        };
        loop {
            match fwdr.forward_poll().await {
                Ok(Some(task)) => return Some(task),
                Ok(None) => {}
                Err(err) => {
                    debug!(error = %err, "forwarded poll failed");
                    tokio::time::sleep(self.forward_retry_interval).await;
                }
            }
        }
    }

    fn try_deliver(&self, queries: bool, mut task: InternalTask) -> Result<(), InternalTask> {
        let queue = if queries { &self.queries } else { &self.tasks };
        loop {
            let Some(sender) = queue.try_pop_claim() else {
                return Err(task);
            };
            match sender.send(task) {
                Ok(()) => return Ok(()),
                Err(returned) => task = returned,
            }
        }
    }

    async fn deliver(
        &self,
        queries: bool,
        mut task: InternalTask,
        wait: Duration,
    ) -> Result<(), InternalTask> {
        let queue = if queries { &self.queries } else { &self.tasks };
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(task);
            }
            let Some(sender) = queue.pop_claim(remaining).await else {
                return Err(task);
            };
            match sender.send(task) {
                Ok(()) => return Ok(()),
                Err(returned) => task = returned,
            }
        }
    }
}

/// A sync match counts once the poller side reports the dispatch outcome. A
/// dropped or failed response means the producer must fall back to
/// persistence.
async fn await_sync_response(rx: Option<oneshot::Receiver<DispatchResult>>) -> bool {
    match rx {
        None => true,
        Some(rx) => matches!(rx.await, Ok(Ok(()))),
    }
}

fn resolve_query_response(
    resolved: Result<QueryResponse, oneshot::error::RecvError>,
) -> Result<Bytes, MatchError> {
    match resolved {
        Ok(Ok(answer)) => Ok(answer),
        Ok(Err(failed)) => Err(MatchError::QueryFailed(failed)),
        Err(_) => Err(MatchError::QueryFailed(QueryFailedError::new(
            "query task abandoned before completion",
        ))),
    }
}
