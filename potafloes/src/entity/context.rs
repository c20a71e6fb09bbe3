//! Per-type instance tables
//!
//! An [`EntityContext`] holds the live instances of one entity type in one
//! [`Context`](crate::Context), together with the queries still waiting for
//! an instance to appear. Registering an instance resolves every pending
//! query whose key it matches.

use super::Entity;
use crate::error::{Error, Result};
use crate::schema::{EntityType, Index};
use crate::types::IndexId;
use crate::value::Value;
use futures_util::future::Shared;
use futures_util::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct QueryKey {
    index: IndexId,
    key: Value,
}

struct PendingSlot {
    index: Index,
    sender: oneshot::Sender<Entity>,
    query: PendingQuery,
}

/// Shared future for "the instance with this key"
///
/// Every caller asking for the same (index, key) gets a clone of the same
/// future. Resolves to `QueryAbandoned` if the context is reset first.
#[derive(Clone)]
pub struct PendingQuery {
    entity_type: Arc<str>,
    index: Arc<str>,
    key: Value,
    future: Shared<oneshot::Receiver<Entity>>,
}

impl PendingQuery {
    /// Whether both handles wait on the same query
    pub fn same_query(&self, other: &PendingQuery) -> bool {
        self.future.ptr_eq(&other.future)
    }

    pub fn key(&self) -> &Value {
        &self.key
    }

    pub fn index_name(&self) -> &str {
        &self.index
    }
}

impl Future for PendingQuery {
    type Output = Result<Entity>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        self.future.poll_unpin(cx).map(|resolved| {
            resolved.map_err(|_| Error::QueryAbandoned {
                entity_type: self.entity_type.to_string(),
                index: self.index.to_string(),
                key: self.key.clone(),
            })
        })
    }
}

impl fmt::Debug for PendingQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingQuery")
            .field("entity_type", &self.entity_type)
            .field("index", &self.index)
            .field("key", &self.key)
            .finish()
    }
}

/// Outcome of an atomic find-or-query
#[derive(Debug)]
pub enum Lookup {
    Found(Entity),
    Pending(PendingQuery),
}

/// Mutable part of an entity context, locked as a whole
pub(crate) struct EntityState {
    entity_type: Arc<str>,
    context: Arc<str>,
    instances: Vec<Entity>,
    queries: HashMap<QueryKey, PendingSlot>,
    frozen: bool,
}

impl EntityState {
    /// First instance whose key under `index` equals `key`
    pub fn find(&self, index: &Index, key: &Value) -> Option<Entity> {
        self.instances
            .iter()
            .find(|instance| index.evaluate(instance) == *key)
            .cloned()
    }

    fn check_writable(&self) -> Result<()> {
        if self.frozen {
            return Err(Error::ContextModifiedAfterFreeze {
                context: self.context.to_string(),
                entity_type: self.entity_type.to_string(),
            });
        }
        Ok(())
    }

    /// Register `instance` and resolve the queries it satisfies
    pub fn insert(&mut self, instance: Entity) -> Result<()> {
        self.check_writable()?;
        self.instances.push(instance.clone());

        let satisfied: Vec<QueryKey> = self
            .queries
            .iter()
            .filter(|(key, slot)| slot.index.evaluate(&instance) == key.key)
            .map(|(key, _)| key.clone())
            .collect();

        for key in satisfied {
            if let Some(slot) = self.queries.remove(&key) {
                debug!(entity_type = %self.entity_type, index = %slot.index.name(), key = %key.key, "query resolved");
                let _ = slot.sender.send(instance.clone());
            }
        }

        debug!(entity_type = %self.entity_type, instance = %instance, "instance registered");
        Ok(())
    }

    fn query(&mut self, index: &Index, key: Value) -> Result<PendingQuery> {
        self.check_writable()?;
        let query_key = QueryKey {
            index: index.id(),
            key: key.clone(),
        };
        if let Some(slot) = self.queries.get(&query_key) {
            return Ok(slot.query.clone());
        }

        let (sender, receiver) = oneshot::channel();
        let query = PendingQuery {
            entity_type: self.entity_type.clone(),
            index: Arc::from(index.name()),
            key,
            future: receiver.shared(),
        };
        debug!(entity_type = %self.entity_type, index = %index.name(), key = %query.key, "query pending");
        self.queries.insert(
            query_key,
            PendingSlot {
                index: index.clone(),
                sender,
                query: query.clone(),
            },
        );
        Ok(query)
    }
}

/// Live instances and pending queries of one type in one context
pub struct EntityContext {
    entity_type: EntityType,
    state: Mutex<EntityState>,
}

impl EntityContext {
    pub(crate) fn new(entity_type: EntityType, context: String, frozen: bool) -> Self {
        Self {
            state: Mutex::new(EntityState {
                entity_type: Arc::from(entity_type.name()),
                context: Arc::from(context),
                instances: Vec::new(),
                queries: HashMap::new(),
                frozen,
            }),
            entity_type,
        }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, EntityState> {
        self.state.lock()
    }

    /// Linear scan for the first instance matching `key`
    pub fn find_instance(&self, index: &Index, key: &Value) -> Result<Entity> {
        self.state().find(index, key).ok_or_else(|| Error::NotFound {
            entity_type: self.entity_type.name().to_string(),
            index: index.name().to_string(),
            key: key.clone(),
        })
    }

    /// Shared future resolving once an instance with `key` is registered
    pub fn add_query(&self, index: &Index, key: impl Into<Value>) -> Result<PendingQuery> {
        self.state().query(index, key.into())
    }

    /// Find, or wait for, the instance with `key`, atomically
    pub fn lookup(&self, index: &Index, key: impl Into<Value>) -> Result<Lookup> {
        let key = key.into();
        let mut state = self.state();
        match state.find(index, &key) {
            Some(instance) => Ok(Lookup::Found(instance)),
            None => state.query(index, key).map(Lookup::Pending),
        }
    }

    pub fn add_instance(&self, instance: Entity) -> Result<()> {
        self.state().insert(instance)
    }

    pub fn is_frozen(&self) -> bool {
        self.state().frozen
    }

    pub fn instances(&self) -> Vec<Entity> {
        self.state().instances.clone()
    }

    pub fn len(&self) -> usize {
        self.state().instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (index name, key) of every unresolved query
    pub fn pending_queries(&self) -> Vec<(String, Value)> {
        self.state()
            .queries
            .values()
            .map(|slot| (slot.index.name().to_string(), slot.query.key.clone()))
            .collect()
    }

    /// Refuse new instances and queries
    pub fn freeze(&self, warn_pending: bool) {
        let mut state = self.state();
        state.frozen = true;
        if warn_pending && !state.queries.is_empty() {
            let pending: Vec<String> = state
                .queries
                .values()
                .map(|slot| format!("{}={}", slot.index.name(), slot.query.key))
                .collect();
            warn!(
                context = %state.context,
                entity_type = %state.entity_type,
                ?pending,
                "frozen with unresolved queries"
            );
        }
    }

    /// Drop instances and queries and unfreeze
    ///
    /// Waiters on dropped queries observe `QueryAbandoned`; dropped
    /// instances are torn down.
    pub fn reset(&self) {
        let (instances, queries) = {
            let mut state = self.state();
            state.frozen = false;
            (
                std::mem::take(&mut state.instances),
                std::mem::take(&mut state.queries),
            )
        };
        info!(
            entity_type = %self.entity_type.name(),
            instances = instances.len(),
            abandoned_queries = queries.len(),
            "entity context reset"
        );
        drop(queries);
        for instance in instances {
            instance.teardown();
        }
    }

    pub fn stats(&self) -> EntityContextStats {
        let state = self.state();
        EntityContextStats {
            entity_type: state.entity_type.to_string(),
            instances: state.instances.len(),
            pending_queries: state.queries.len(),
            frozen: state.frozen,
        }
    }
}

impl fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityContext")
            .field("entity_type", &self.entity_type.name())
            .field("instances", &self.len())
            .finish()
    }
}

/// Statistics about one entity context
#[derive(Debug, Clone, Serialize)]
pub struct EntityContextStats {
    pub entity_type: String,
    pub instances: usize,
    pub pending_queries: usize,
    pub frozen: bool,
}
