//! Binds a query to a time-to-live. The expiry timer runs detached, so a
//! buffered query expires even when nothing else ever touches it again.

use std::time::Duration;

use tracing::debug;

use crate::query::{QueryEvent, QueryHandle, QueryResult, QueryError};

pub struct QueryLifecycle {
    handle: QueryHandle,
    ttl: Duration,
}

impl QueryLifecycle {
    /// Arm the TTL for a query. `Expire` fires after `ttl` unless the query
    /// reached a terminal state first, in which case the event is rejected by
    /// the state machine and ignored here.
    pub fn new(handle: QueryHandle, ttl: Duration) -> Self {
        let expire_handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if let Err(err) = expire_handle.apply(QueryEvent::Expire) {
                debug!(query_id = %expire_handle.id(), error = %err, "query already terminal at ttl");
            }
        });
        Self { handle, ttl }
    }

    pub fn query(&self) -> &QueryHandle {
        &self.handle
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Put a started query back in line after its decision task failed.
    pub fn rebuffer(&self) -> Result<(), QueryError> {
        self.handle.apply(QueryEvent::Rebuffer)
    }

    pub fn start(&self) -> Result<(), QueryError> {
        self.handle.apply(QueryEvent::Start)
    }

    pub fn record_result(&self, result: QueryResult) -> Result<(), QueryError> {
        self.handle.apply(QueryEvent::RecordResult(result))
    }

    /// Mark the dependent history events durable, arming the completion
    /// latch.
    pub fn satisfy_persistence_condition(&self) -> Result<(), QueryError> {
        self.handle.apply(QueryEvent::PersistenceConditionSatisfied)
    }
}
