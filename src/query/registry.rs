//! Per-workflow registry of live queries. A query ID is in at most one of
//! the buffered/started maps; terminal queries are removed entirely. The
//! query object moves itself between maps through callbacks captured at
//! construction, so transition and map move happen under the registry lock
//! as one step.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use uuid::Uuid;

use crate::api::QueryInput;
use crate::query::{Query, QueryError, QueryEvent, QueryHandle};

#[derive(Default)]
struct Maps {
    buffered: HashMap<Uuid, QueryHandle>,
    started: HashMap<Uuid, QueryHandle>,
}

fn move_between(
    source: &mut HashMap<Uuid, QueryHandle>,
    target: &mut HashMap<Uuid, QueryHandle>,
    id: Uuid,
) -> Result<(), QueryError> {
    if !source.contains_key(&id) {
        return Err(QueryError::NotFound);
    }
    if target.contains_key(&id) {
        return Err(QueryError::AlreadyInState);
    }
    if let Some(handle) = source.remove(&id) {
        target.insert(id, handle);
    }
    Ok(())
}

/// Registry of outstanding queries for a single workflow execution.
pub struct QueryRegistry {
    maps: Arc<Mutex<Maps>>,
}

impl Default for QueryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryRegistry {
    pub fn new() -> Self {
        Self {
            maps: Arc::new(Mutex::new(Maps::default())),
        }
    }

    /// Buffer a new query and return its handle.
    pub fn buffer_query(&self, input: QueryInput) -> QueryHandle {
        let weak: Weak<Mutex<Maps>> = Arc::downgrade(&self.maps);

        let to_started = {
            let weak = weak.clone();
            Arc::new(move |id: Uuid| {
                let maps = weak.upgrade().ok_or(QueryError::RegistryGone)?;
                let mut maps = maps.lock().unwrap();
                let Maps { buffered, started } = &mut *maps;
                move_between(buffered, started, id)
            }) as crate::query::MoveCallback
        };
        let to_buffered = {
            let weak = weak.clone();
            Arc::new(move |id: Uuid| {
                let maps = weak.upgrade().ok_or(QueryError::RegistryGone)?;
                let mut maps = maps.lock().unwrap();
                let Maps { buffered, started } = &mut *maps;
                move_between(started, buffered, id)
            }) as crate::query::MoveCallback
        };
        let on_terminal = {
            Arc::new(move |id: Uuid| {
                if let Some(maps) = weak.upgrade() {
                    let mut maps = maps.lock().unwrap();
                    maps.buffered.remove(&id);
                    maps.started.remove(&id);
                }
            }) as crate::query::TerminalCallback
        };

        let query = Query::with_callbacks(input, to_started, to_buffered, on_terminal);
        let handle = QueryHandle::new(query);
        self.maps
            .lock()
            .unwrap()
            .buffered
            .insert(handle.id(), handle.clone());
        handle
    }

    /// Start every currently buffered query and return the inputs to embed in
    /// the next decision task. A transition failure surfaces immediately.
    pub fn start_buffered(&self) -> Result<HashMap<Uuid, QueryInput>, QueryError> {
        let snapshot: Vec<QueryHandle> = self.maps.lock().unwrap().buffered.values().cloned().collect();
        let mut inputs = HashMap::with_capacity(snapshot.len());
        for handle in snapshot {
            inputs.insert(handle.id(), handle.input());
            handle.apply(QueryEvent::Start)?;
        }
        Ok(inputs)
    }

    /// Look a live query up in either map.
    pub fn get_query(&self, id: Uuid) -> Result<QueryHandle, QueryError> {
        let maps = self.maps.lock().unwrap();
        maps.buffered
            .get(&id)
            .or_else(|| maps.started.get(&id))
            .cloned()
            .ok_or(QueryError::NotFound)
    }

    pub fn buffered_count(&self) -> usize {
        self.maps.lock().unwrap().buffered.len()
    }

    pub fn started_count(&self) -> usize {
        self.maps.lock().unwrap().started.len()
    }
}
