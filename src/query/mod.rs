//! Synchronous workflow queries. A query rides the decision-task rendezvous;
//! this module owns its state machine, the per-workflow registry, and the
//! TTL-bound lifecycle.

mod lifecycle;
mod registry;

pub use lifecycle::QueryLifecycle;
pub use registry::QueryRegistry;

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::api::QueryInput;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Awaiting dispatch inside a future decision task.
    Buffered,
    /// The decision task carrying the query has been handed to a worker.
    Started,
    /// A result was recorded and its dependent events are durable. Terminal.
    Completed,
    /// The query timed out before completing. Terminal.
    Expired,
}

impl QueryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryState::Completed | QueryState::Expired)
    }
}

/// The only way to change a query's state.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Start,
    Rebuffer,
    /// The history events this query depends on have been durably written.
    PersistenceConditionSatisfied,
    RecordResult(QueryResult),
    Expire,
}

impl QueryEvent {
    fn name(&self) -> &'static str {
        match self {
            QueryEvent::Start => "start",
            QueryEvent::Rebuffer => "rebuffer",
            QueryEvent::PersistenceConditionSatisfied => "persistence_condition_satisfied",
            QueryEvent::RecordResult(_) => "record_result",
            QueryEvent::Expire => "expire",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Answered(Bytes),
    Failed { reason: String },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("query in state {state:?} cannot accept event {event}")]
    InvalidTransition {
        state: QueryState,
        event: &'static str,
    },
    #[error("query result is already recorded")]
    ResultAlreadyRecorded,
    #[error("query could not be found in registry")]
    NotFound,
    #[error("query is already in the target registry state")]
    AlreadyInState,
    #[error("query registry is gone")]
    RegistryGone,
}

pub(crate) type MoveCallback = Arc<dyn Fn(Uuid) -> Result<(), QueryError> + Send + Sync>;
pub(crate) type TerminalCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

/// A single query and its completion latch. Not thread safe on its own;
/// accessed through [`QueryHandle`].
pub struct Query {
    id: Uuid,
    input: QueryInput,
    result: Option<QueryResult>,
    state: QueryState,
    persistence_latch: bool,
    on_buffered_to_started: Option<MoveCallback>,
    on_started_to_buffered: Option<MoveCallback>,
    on_terminal: Option<TerminalCallback>,
}

impl Query {
    pub fn new(input: QueryInput) -> Self {
        Self {
            id: Uuid::new_v4(),
            input,
            result: None,
            state: QueryState::Buffered,
            persistence_latch: false,
            on_buffered_to_started: None,
            on_started_to_buffered: None,
            on_terminal: None,
        }
    }

    pub(crate) fn with_callbacks(
        input: QueryInput,
        on_buffered_to_started: MoveCallback,
        on_started_to_buffered: MoveCallback,
        on_terminal: TerminalCallback,
    ) -> Self {
        let mut query = Self::new(input);
        query.on_buffered_to_started = Some(on_buffered_to_started);
        query.on_started_to_buffered = Some(on_started_to_buffered);
        query.on_terminal = Some(on_terminal);
        query
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> QueryState {
        self.state
    }

    pub fn input(&self) -> &QueryInput {
        &self.input
    }

    pub fn result(&self) -> Option<&QueryResult> {
        self.result.as_ref()
    }

    /// Apply one event. Registry moves run inside the transition, so an entry
    /// is never observable in the wrong map; a callback failure leaves the
    /// state unchanged.
    pub fn apply(&mut self, event: QueryEvent) -> Result<(), QueryError> {
        if self.state.is_terminal() {
            return Err(QueryError::InvalidTransition {
                state: self.state,
                event: event.name(),
            });
        }
        match event {
            QueryEvent::Start => match self.state {
                QueryState::Buffered => {
                    if let Some(cb) = &self.on_buffered_to_started {
                        cb(self.id)?;
                    }
                    self.state = QueryState::Started;
                    self.maybe_complete();
                    Ok(())
                }
                // Starting an already started query is a no-op: the same
                // query can be embedded in a retried decision task.
                QueryState::Started => Ok(()),
                _ => unreachable!("terminal states are rejected above"),
            },
            QueryEvent::Rebuffer => match self.state {
                QueryState::Started => {
                    if let Some(cb) = &self.on_started_to_buffered {
                        cb(self.id)?;
                    }
                    self.state = QueryState::Buffered;
                    Ok(())
                }
                state => Err(QueryError::InvalidTransition {
                    state,
                    event: "rebuffer",
                }),
            },
            QueryEvent::PersistenceConditionSatisfied => {
                self.persistence_latch = true;
                self.maybe_complete();
                Ok(())
            }
            QueryEvent::RecordResult(result) => {
                if self.result.is_some() {
                    return Err(QueryError::ResultAlreadyRecorded);
                }
                self.result = Some(result);
                self.maybe_complete();
                Ok(())
            }
            QueryEvent::Expire => {
                self.state = QueryState::Expired;
                if let Some(cb) = &self.on_terminal {
                    cb(self.id);
                }
                Ok(())
            }
        }
    }

    /// Completion requires all three: the query was started, a result is
    /// recorded, and the dependent events are durable. This keeps a crashed
    /// poller's result from being observed as Completed before the decision
    /// that produced it is persisted.
    fn maybe_complete(&mut self) {
        if self.state == QueryState::Started && self.result.is_some() && self.persistence_latch {
            self.state = QueryState::Completed;
            if let Some(cb) = &self.on_terminal {
                cb(self.id);
            }
        }
    }
}

/// Shared, internally synchronized handle to a query.
#[derive(Clone)]
pub struct QueryHandle {
    inner: Arc<Mutex<Query>>,
}

impl QueryHandle {
    pub fn new(query: Query) -> Self {
        Self {
            inner: Arc::new(Mutex::new(query)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.lock().unwrap().id()
    }

    pub fn state(&self) -> QueryState {
        self.inner.lock().unwrap().state()
    }

    pub fn input(&self) -> QueryInput {
        self.inner.lock().unwrap().input().clone()
    }

    pub fn result(&self) -> Option<QueryResult> {
        self.inner.lock().unwrap().result().cloned()
    }

    pub fn apply(&self, event: QueryEvent) -> Result<(), QueryError> {
        self.inner.lock().unwrap().apply(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> QueryInput {
        QueryInput {
            query_type: "state".to_string(),
            query_args: Bytes::from_static(b"{}"),
        }
    }

    fn answered() -> QueryResult {
        QueryResult::Answered(Bytes::from_static(b"42"))
    }

    #[test]
    fn completion_needs_start_result_and_latch() {
        let mut q = Query::new(input());
        assert_eq!(q.state(), QueryState::Buffered);

        // Result and latch while still buffered: stays buffered.
        q.apply(QueryEvent::RecordResult(answered())).unwrap();
        q.apply(QueryEvent::PersistenceConditionSatisfied).unwrap();
        assert_eq!(q.state(), QueryState::Buffered);

        q.apply(QueryEvent::Start).unwrap();
        assert_eq!(q.state(), QueryState::Completed);
    }

    #[test]
    fn result_before_latch_keeps_the_query_started() {
        let mut q = Query::new(input());
        q.apply(QueryEvent::Start).unwrap();
        q.apply(QueryEvent::RecordResult(answered())).unwrap();
        assert_eq!(q.state(), QueryState::Started);

        q.apply(QueryEvent::PersistenceConditionSatisfied).unwrap();
        assert_eq!(q.state(), QueryState::Completed);
    }

    #[test]
    fn start_is_idempotent_but_rebuffer_requires_started() {
        let mut q = Query::new(input());
        assert_eq!(
            q.apply(QueryEvent::Rebuffer),
            Err(QueryError::InvalidTransition {
                state: QueryState::Buffered,
                event: "rebuffer",
            })
        );
        q.apply(QueryEvent::Start).unwrap();
        q.apply(QueryEvent::Start).unwrap();
        q.apply(QueryEvent::Rebuffer).unwrap();
        assert_eq!(q.state(), QueryState::Buffered);
    }

    #[test]
    fn terminal_states_reject_every_event() {
        let mut q = Query::new(input());
        q.apply(QueryEvent::Expire).unwrap();
        assert_eq!(q.state(), QueryState::Expired);
        for event in [
            QueryEvent::Start,
            QueryEvent::Rebuffer,
            QueryEvent::PersistenceConditionSatisfied,
            QueryEvent::RecordResult(answered()),
            QueryEvent::Expire,
        ] {
            assert!(q.apply(event).is_err());
        }
    }

    #[test]
    fn second_result_is_rejected() {
        let mut q = Query::new(input());
        q.apply(QueryEvent::Start).unwrap();
        q.apply(QueryEvent::RecordResult(answered())).unwrap();
        assert_eq!(
            q.apply(QueryEvent::RecordResult(QueryResult::Failed {
                reason: "boom".to_string()
            })),
            Err(QueryError::ResultAlreadyRecorded)
        );
    }
}
