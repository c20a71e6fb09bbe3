//! Entity instances
//!
//! An [`Entity`] is an immutable attribute map plus one live attachment per
//! attachment field. Entities compare by identity: the construction
//! protocol in [`builder`] guarantees that structurally identical
//! constructions (equal keys under some index) yield the same instance.

pub mod builder;
pub mod context;
pub mod scope;

pub use builder::EntityBuilder;
pub use context::{EntityContext, EntityContextStats, Lookup, PendingQuery};

use crate::attachment::{Attachment, Bag, BoundedStream, Single};
use crate::context::Context;
use crate::error::{Error, Result};
use crate::schema::{EntityType, Index};
use crate::types::{EntityId, IndexId};
use crate::value::Value;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

struct EntityInner {
    id: EntityId,
    entity_type: EntityType,
    context: Context,
    attributes: Vec<(Arc<str>, Value)>,
    /// Bound once, after identity resolution decided the candidate is new
    attachments: OnceCell<HashMap<Arc<str>, Attachment>>,
    index_cache: Mutex<HashMap<IndexId, Value>>,
    label: OnceCell<String>,
}

/// Handle on an entity instance
#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl Entity {
    pub(crate) fn candidate(
        entity_type: EntityType,
        context: Context,
        attributes: Vec<(Arc<str>, Value)>,
    ) -> Self {
        Self {
            inner: Arc::new(EntityInner {
                id: EntityId::new(),
                entity_type,
                context,
                attributes,
                attachments: OnceCell::new(),
                index_cache: Mutex::new(HashMap::new()),
                label: OnceCell::new(),
            }),
        }
    }

    pub fn id(&self) -> EntityId {
        self.inner.id
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.inner.entity_type
    }

    pub fn context(&self) -> &Context {
        &self.inner.context
    }

    pub fn is_instance_of(&self, entity_type: &EntityType) -> bool {
        self.inner.entity_type.is_subtype_of(entity_type)
    }

    /// Attribute value, if the field exists
    pub fn attr(&self, name: &str) -> Option<&Value> {
        self.inner
            .attributes
            .iter()
            .find(|(field, _)| &**field == name)
            .map(|(_, value)| value)
    }

    pub fn attribute(&self, name: &str) -> Result<&Value> {
        self.attr(name).ok_or_else(|| self.unknown(name))
    }

    pub fn attributes(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.inner
            .attributes
            .iter()
            .map(|(field, value)| (&**field, value))
    }

    pub fn attachment(&self, name: &str) -> Result<Attachment> {
        self.inner
            .attachments
            .get()
            .and_then(|attachments| attachments.get(name))
            .cloned()
            .ok_or_else(|| self.unknown(name))
    }

    pub fn bag(&self, name: &str) -> Result<Bag> {
        self.attachment(name)?.as_bag()
    }

    pub fn single(&self, name: &str) -> Result<Single> {
        self.attachment(name)?.as_single()
    }

    pub fn bounded(&self, name: &str) -> Result<BoundedStream> {
        self.attachment(name)?.as_bounded()
    }

    /// Entities whose implementations constructed this one
    pub fn producers(&self) -> Result<Bag> {
        self.bag("producers")
    }

    /// Entities this one constructed
    pub fn products(&self) -> Result<Bag> {
        self.bag("products")
    }

    /// Entities that looked this one up
    pub fn readers(&self) -> Result<Bag> {
        self.bag("readers")
    }

    /// Key of this entity under `index`, computed once
    pub fn index_value(&self, index: &Index) -> Value {
        if let Some(value) = self.inner.index_cache.lock().get(&index.id()) {
            return value.clone();
        }
        // Computed outside the lock; index functions may read other indices
        let value = index.compute(self);
        self.inner
            .index_cache
            .lock()
            .entry(index.id())
            .or_insert(value)
            .clone()
    }

    /// JSON view of the instance for diagnostics
    ///
    /// Entity references inside attributes and attachments are rendered
    /// as labels.
    pub fn snapshot(&self) -> serde_json::Value {
        let attributes: serde_json::Map<String, serde_json::Value> = self
            .attributes()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    serde_json::to_value(value).unwrap_or(serde_json::Value::Null),
                )
            })
            .collect();

        let mut attachments = serde_json::Map::new();
        if let Some(bound) = self.inner.attachments.get() {
            let mut names: Vec<&Arc<str>> = bound.keys().collect();
            names.sort();
            for name in names {
                let items = bound[name].items();
                attachments.insert(
                    name.to_string(),
                    serde_json::to_value(items).unwrap_or(serde_json::Value::Null),
                );
            }
        }

        json!({
            "id": self.id().to_string(),
            "type": self.entity_type().name(),
            "label": self.to_string(),
            "attributes": attributes,
            "attachments": attachments,
        })
    }

    pub(crate) fn bind_attachments(&self, attachments: HashMap<Arc<str>, Attachment>) {
        let _ = self.inner.attachments.set(attachments);
    }

    /// Clear every attachment, breaking cycles through subscribers
    pub(crate) fn teardown(&self) {
        if let Some(attachments) = self.inner.attachments.get() {
            for attachment in attachments.values() {
                attachment.teardown();
            }
        }
    }

    fn unknown(&self, name: &str) -> Error {
        Error::UnknownAttribute {
            entity_type: self.entity_type().name().to_string(),
            attribute: name.to_string(),
        }
    }

    fn render_label(&self) -> String {
        let keys: Vec<String> = self
            .entity_type()
            .resolved()
            .indices
            .iter()
            .map(|index| format!("{}={}", index.name(), self.index_value(index)))
            .collect();
        format!("{}[{}]", self.entity_type().name(), keys.join(", "))
    }
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl Hash for Entity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = self.inner.label.get_or_init(|| self.render_label());
        write!(f, "{}", label)
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Entity({} {})", self, self.inner.id)
    }
}
