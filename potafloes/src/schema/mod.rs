//! Schema: the registry of declared entity types
//!
//! Every schema owns a root type named [`ROOT_TYPE`] that all other types
//! extend. The root carries the provenance bags:
//!
//! - `producers`: entities whose implementations constructed this one
//! - `products`: entities this one constructed (inverse of `producers`)
//! - `readers`: entities that looked this one up, producers included

mod entity_type;
mod field;
mod index;

pub use entity_type::{EntityType, Resolved, TypeBuilder};
pub use field::{AttachmentKind, Field, FieldKind};
pub use index::{Implementation, ImplementationFn, Index, IndexFn};

use crate::entity::Entity;
use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::{debug, error};

/// Name of the implicit base type
pub const ROOT_TYPE: &str = "Entity";

pub(crate) struct SchemaInner {
    name: String,
    root: EntityType,
    types: RwLock<HashMap<String, EntityType>>,
}

/// Registry of entity types, cheap to clone
#[derive(Clone)]
pub struct Schema {
    inner: Arc<SchemaInner>,
}

static GLOBAL: Lazy<Schema> = Lazy::new(|| Schema::new("global"));

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let inner = Arc::new_cyclic(|weak: &Weak<SchemaInner>| SchemaInner {
            name,
            root: EntityType::new(ROOT_TYPE, None, weak.clone()),
            types: RwLock::new(HashMap::new()),
        });
        let schema = Schema { inner };
        if let Err(e) = schema.install_root() {
            error!(schema = %schema.name(), error = %e, "failed to install the root entity type");
        }
        schema
    }

    /// The process-wide schema
    pub fn global() -> Schema {
        GLOBAL.clone()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn root(&self) -> EntityType {
        self.inner.root.clone()
    }

    /// Start declaring a type named `name`
    pub fn entity(&self, name: impl Into<String>) -> TypeBuilder {
        TypeBuilder::new(self.clone(), name)
    }

    pub fn lookup(&self, name: &str) -> Option<EntityType> {
        self.inner.types.read().get(name).cloned()
    }

    pub fn get_type(&self, name: &str) -> Result<EntityType> {
        self.lookup(name)
            .ok_or_else(|| Error::UnknownEntityType(name.to_string()))
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Keep `a_field` on `a_type` and `b_field` on `b_type` inverse to
    /// each other
    ///
    /// Whenever an `a` holds some `b` in `a_field`, the `b` holds the `a`
    /// in `b_field`, and the other way around.
    pub fn double_bind(
        &self,
        a_type: &EntityType,
        a_field: &str,
        b_type: &EntityType,
        b_field: &str,
    ) -> Result<()> {
        require_attachment(a_type, a_field)?;
        require_attachment(b_type, b_field)?;

        a_type.add_implementation(bind_inverse(a_field, b_field))?;
        b_type.add_implementation(bind_inverse(b_field, a_field))?;
        debug!(a = %a_type.name(), a_field, b = %b_type.name(), b_field, "double bind declared");
        Ok(())
    }

    pub(crate) fn register(&self, ty: EntityType) -> Result<()> {
        let mut types = self.inner.types.write();
        if types.contains_key(ty.name()) {
            return Err(Error::DuplicateEntityType(ty.name().to_string()));
        }
        debug!(schema = %self.name(), entity_type = %ty.name(), "entity type declared");
        types.insert(ty.name().to_string(), ty);
        Ok(())
    }

    pub(crate) fn downgrade(&self) -> Weak<SchemaInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(weak: &Weak<SchemaInner>) -> Option<Schema> {
        weak.upgrade().map(|inner| Schema { inner })
    }

    fn install_root(&self) -> Result<()> {
        let root = self.root();
        let any_entity = ValueType::entity(ROOT_TYPE);
        root.add_attachment_field("producers", AttachmentKind::Bag, any_entity.clone())?;
        root.add_attachment_field("products", AttachmentKind::Bag, any_entity.clone())?;
        root.add_attachment_field("readers", AttachmentKind::Bag, any_entity)?;

        self.double_bind(&root, "producers", &root, "products")?;
        root.add_implementation(Implementation::new(
            "producers_are_readers",
            |entity: Entity| async move {
                entity.bag("readers")?.add(entity.bag("producers")?)?;
                Ok(())
            },
        ))?;

        self.register(root)
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("name", &self.inner.name)
            .field("types", &self.type_names())
            .finish()
    }
}

fn require_attachment(ty: &EntityType, field: &str) -> Result<()> {
    match ty.resolved().field(field) {
        Some(f) if f.is_attachment() => Ok(()),
        _ => Err(Error::UnknownAttribute {
            entity_type: ty.name().to_string(),
            attribute: field.to_string(),
        }),
    }
}

/// Implementation sending the bearer into `other_field` of every entity
/// that shows up in its `this_field`
fn bind_inverse(this_field: &str, other_field: &str) -> Implementation {
    let this_field: Arc<str> = Arc::from(this_field);
    let other_field: Arc<str> = Arc::from(other_field);
    let name = format!("bind_{this_field}_{other_field}");

    Implementation::new(name, move |this: Entity| {
        let this_field = this_field.clone();
        let other_field = other_field.clone();
        async move {
            let attachment = this.attachment(&this_field)?;
            let subscription = format!("{this_field}_to_{other_field}");
            let bearer = this.clone();
            attachment.subscribe_named(subscription, move |item: Value| {
                let bearer = bearer.clone();
                let other_field = other_field.clone();
                async move {
                    let Some(other) = item.as_entity() else {
                        anyhow::bail!("{} holds {}, which is not an entity", bearer, item);
                    };
                    other.attachment(&other_field)?.send(bearer)?;
                    Ok(())
                }
            })?;
            Ok(())
        }
    })
}
