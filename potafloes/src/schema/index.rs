//! Indices and implementations
//!
//! An [`Index`] maps an entity to the key that identifies it; two
//! constructions with equal keys under some index denote the same entity.
//! An [`Implementation`] is an async handler scheduled once for every new
//! instance of a type and its subtypes.

use crate::entity::Entity;
use crate::types::IndexId;
use crate::value::Value;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Index key function; must be pure
///
/// Keys of the indices a type declares are computed once per instance,
/// before the instance is registered, and never under the entity context
/// lock. Ad hoc indices passed to `EntityContext::find_instance` or
/// `add_query` are evaluated under that lock, so their functions must not
/// look up entities of the same type.
pub type IndexFn = Arc<dyn Fn(&Entity) -> Value + Send + Sync>;

/// Named identity key over an entity's attributes
///
/// Cloning shares the index; equality is identity, so a subtype inheriting
/// an index can be queried through the ancestor's handle.
#[derive(Clone)]
pub struct Index {
    id: IndexId,
    name: Arc<str>,
    func: IndexFn,
}

impl Index {
    pub fn new<F>(name: impl AsRef<str>, func: F) -> Self
    where
        F: Fn(&Entity) -> Value + Send + Sync + 'static,
    {
        Self {
            id: IndexId::next(),
            name: Arc::from(name.as_ref()),
            func: Arc::new(func),
        }
    }

    /// Index keyed by a single attribute
    pub fn attribute(name: impl AsRef<str>, attribute: impl AsRef<str>) -> Self {
        let attribute: Arc<str> = Arc::from(attribute.as_ref());
        Self::new(name, move |entity| {
            entity.attr(&attribute).cloned().unwrap_or(Value::None)
        })
    }

    pub fn id(&self) -> IndexId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key of `entity` under this index, memoized per instance
    pub fn evaluate(&self, entity: &Entity) -> Value {
        entity.index_value(self)
    }

    pub(crate) fn compute(&self, entity: &Entity) -> Value {
        (self.func)(entity)
    }
}

impl PartialEq for Index {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Index {}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Async handler run for each new instance
pub type ImplementationFn = Arc<dyn Fn(Entity) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct Implementation {
    name: Arc<str>,
    func: ImplementationFn,
}

impl Implementation {
    pub fn new<F, Fut>(name: impl AsRef<str>, func: F) -> Self
    where
        F: Fn(Entity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: Arc::from(name.as_ref()),
            func: Arc::new(move |entity| func(entity).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn call(&self, entity: Entity) -> BoxFuture<'static, anyhow::Result<()>> {
        (self.func)(entity)
    }
}

impl fmt::Debug for Implementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Implementation").field(&self.name).finish()
    }
}
