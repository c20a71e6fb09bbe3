//! Entity types and their domains
//!
//! A domain (indices, fields, implementations) stays mutable until the
//! first instance of the type, or of one of its subtypes, is constructed.
//! After that every `add_*` call fails with `DomainModifiedAfterFreeze`.

use super::field::{AttachmentKind, Field};
use super::index::{Implementation, Index};
use super::{Schema, SchemaInner};
use crate::error::{Error, Result};
use crate::types::EntityTypeId;
use crate::value::{Value, ValueType};
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

#[derive(Default)]
struct Domain {
    fields: Vec<Field>,
    indices: Vec<Index>,
    implementations: Vec<Implementation>,
}

struct TypeInner {
    id: EntityTypeId,
    name: Arc<str>,
    parent: Option<EntityType>,
    schema: Weak<SchemaInner>,
    domain: RwLock<Domain>,
    frozen: AtomicBool,
    resolved: OnceCell<Arc<Resolved>>,
}

/// A declared entity type
#[derive(Clone)]
pub struct EntityType {
    inner: Arc<TypeInner>,
}

/// The effective domain of a type, ancestors included
#[derive(Debug)]
pub struct Resolved {
    /// Ancestor indices first; a redefined name keeps its first position
    pub indices: Vec<Index>,
    pub fields: Vec<Field>,
    /// Ancestor implementations first, declaration order within a level
    pub implementations: Vec<Implementation>,
}

impl Resolved {
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn index(&self, name: &str) -> Option<&Index> {
        self.indices.iter().find(|i| i.name() == name)
    }

    pub fn has_index(&self, index: &Index) -> bool {
        self.indices.iter().any(|i| i == index)
    }

    pub fn attributes(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| !f.is_attachment())
    }

    pub fn attachments(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_attachment())
    }
}

impl EntityType {
    pub(crate) fn new(name: &str, parent: Option<EntityType>, schema: Weak<SchemaInner>) -> Self {
        Self {
            inner: Arc::new(TypeInner {
                id: EntityTypeId::next(),
                name: Arc::from(name),
                parent,
                schema,
                domain: RwLock::new(Domain::default()),
                frozen: AtomicBool::new(false),
                resolved: OnceCell::new(),
            }),
        }
    }

    pub fn id(&self) -> EntityTypeId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn parent(&self) -> Option<&EntityType> {
        self.inner.parent.as_ref()
    }

    /// The schema this type was declared in, if it is still alive
    pub fn schema(&self) -> Option<Schema> {
        Schema::upgrade(&self.inner.schema)
    }

    pub fn is_frozen(&self) -> bool {
        self.inner.frozen.load(Ordering::SeqCst)
    }

    /// Whether this type is `name` or a subtype of it
    pub fn is_a(&self, name: &str) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty.name() == name {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    pub fn is_subtype_of(&self, other: &EntityType) -> bool {
        let mut current = Some(self);
        while let Some(ty) = current {
            if ty == other {
                return true;
            }
            current = ty.parent();
        }
        false
    }

    /// Root first, `self` last
    pub fn lineage(&self) -> Vec<EntityType> {
        let mut chain = Vec::new();
        let mut current = Some(self.clone());
        while let Some(ty) = current {
            current = ty.parent().cloned();
            chain.push(ty);
        }
        chain.reverse();
        chain
    }

    fn mutate<T>(&self, f: impl FnOnce(&mut Domain) -> Result<T>) -> Result<T> {
        let mut domain = self.inner.domain.write();
        if self.is_frozen() {
            return Err(Error::DomainModifiedAfterFreeze {
                entity_type: self.name().to_string(),
            });
        }
        f(&mut domain)
    }

    fn add_field(&self, field: Field) -> Result<()> {
        self.mutate(|domain| {
            if domain.fields.iter().any(|f| f.name() == field.name()) {
                return Err(Error::DuplicateField {
                    entity_type: self.name().to_string(),
                    field: field.name().to_string(),
                });
            }
            debug!(entity_type = %self.name(), field = %field.name(), "field declared");
            domain.fields.push(field);
            Ok(())
        })
    }

    pub fn add_attribute(&self, name: &str, ty: ValueType) -> Result<()> {
        self.add_field(Field::attribute(name, ty))
    }

    pub fn add_attribute_with_default(&self, name: &str, ty: ValueType, default: impl Into<Value>) -> Result<()> {
        self.add_field(Field::attribute_with_default(name, ty, default))
    }

    pub fn add_attachment_field(&self, name: &str, kind: AttachmentKind, inner: ValueType) -> Result<()> {
        if let AttachmentKind::Bounded { min, max } = kind {
            AttachmentKind::bounded(name, min, max)?;
        }
        self.add_field(Field::attachment(name, kind, inner))
    }

    /// Add an identity index; redefining a name on the same type replaces it
    pub fn add_index(&self, index: Index) -> Result<()> {
        self.mutate(|domain| {
            if let Some(slot) = domain.indices.iter_mut().find(|i| i.name() == index.name()) {
                warn!(entity_type = %self.name(), index = %index.name(), "index redefined, last definition wins");
                *slot = index;
            } else {
                debug!(entity_type = %self.name(), index = %index.name(), "index declared");
                domain.indices.push(index);
            }
            Ok(())
        })
    }

    pub fn add_implementation(&self, implementation: Implementation) -> Result<()> {
        self.mutate(|domain| {
            debug!(entity_type = %self.name(), implementation = %implementation.name(), "implementation declared");
            domain.implementations.push(implementation);
            Ok(())
        })
    }

    /// Seal this type and its ancestors
    pub fn freeze(&self) {
        for ty in self.lineage() {
            if !ty.inner.frozen.swap(true, Ordering::SeqCst) {
                debug!(entity_type = %ty.name(), "domain frozen");
            }
        }
    }

    /// Effective domain; cached once the type is frozen
    pub fn resolved(&self) -> Arc<Resolved> {
        if self.is_frozen() {
            self.inner
                .resolved
                .get_or_init(|| Arc::new(self.compute_resolved()))
                .clone()
        } else {
            Arc::new(self.compute_resolved())
        }
    }

    fn compute_resolved(&self) -> Resolved {
        let mut indices: Vec<Index> = Vec::new();
        let mut fields: Vec<Field> = Vec::new();
        let mut implementations = Vec::new();

        for ty in self.lineage() {
            let domain = ty.inner.domain.read();
            for index in &domain.indices {
                match indices.iter_mut().find(|i| i.name() == index.name()) {
                    Some(slot) => {
                        warn!(entity_type = %self.name(), index = %index.name(), redefined_by = %ty.name(), "inherited index redefined, last definition wins");
                        *slot = index.clone();
                    }
                    None => indices.push(index.clone()),
                }
            }
            for field in &domain.fields {
                match fields.iter_mut().find(|f| f.name() == field.name()) {
                    Some(slot) => {
                        warn!(entity_type = %self.name(), field = %field.name(), redefined_by = %ty.name(), "inherited field redefined, last definition wins");
                        *slot = field.clone();
                    }
                    None => fields.push(field.clone()),
                }
            }
            implementations.extend(domain.implementations.iter().cloned());
        }

        Resolved {
            indices,
            fields,
            implementations,
        }
    }

    /// Effective index by name
    pub fn index(&self, name: &str) -> Option<Index> {
        self.resolved().index(name).cloned()
    }

    pub fn indices(&self) -> Vec<Index> {
        self.resolved().indices.clone()
    }

    pub fn fields(&self) -> Vec<Field> {
        self.resolved().fields.clone()
    }
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for EntityType {}

impl std::hash::Hash for EntityType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntityType")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner.name)
    }
}

/// Declarative builder for a new entity type
///
/// ```
/// use potafloes::{Index, Schema, ValueType};
///
/// let schema = Schema::new("docs");
/// let person = schema
///     .entity("Person")
///     .attribute("name", ValueType::Str)
///     .attribute_with_default("age", ValueType::Int, 0)
///     .bag("parents", ValueType::entity("Person"))
///     .index(Index::attribute("unique_name", "name"))
///     .declare()
///     .unwrap();
/// assert!(person.index("unique_name").is_some());
/// ```
#[must_use = "a type is only registered once `declare` is called"]
pub struct TypeBuilder {
    schema: Schema,
    name: String,
    parent: Option<EntityType>,
    fields: Vec<Result<Field>>,
    indices: Vec<Index>,
    implementations: Vec<Implementation>,
}

impl TypeBuilder {
    pub(crate) fn new(schema: Schema, name: impl Into<String>) -> Self {
        Self {
            schema,
            name: name.into(),
            parent: None,
            fields: Vec::new(),
            indices: Vec::new(),
            implementations: Vec::new(),
        }
    }

    /// Inherit from `parent` instead of the root type
    pub fn extends(mut self, parent: &EntityType) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn attribute(mut self, name: &str, ty: ValueType) -> Self {
        self.fields.push(Ok(Field::attribute(name, ty)));
        self
    }

    pub fn attribute_with_default(mut self, name: &str, ty: ValueType, default: impl Into<Value>) -> Self {
        self.fields.push(Ok(Field::attribute_with_default(name, ty, default)));
        self
    }

    pub fn bag(mut self, name: &str, inner: ValueType) -> Self {
        self.fields.push(Ok(Field::attachment(name, AttachmentKind::Bag, inner)));
        self
    }

    pub fn single(mut self, name: &str, inner: ValueType) -> Self {
        self.fields.push(Ok(Field::attachment(name, AttachmentKind::Single, inner)));
        self
    }

    pub fn bounded(mut self, name: &str, inner: ValueType, min: usize, max: usize) -> Self {
        self.fields.push(
            AttachmentKind::bounded(name, min, max).map(|kind| Field::attachment(name, kind, inner)),
        );
        self
    }

    pub fn index(mut self, index: Index) -> Self {
        self.indices.push(index);
        self
    }

    pub fn implementation<F, Fut>(mut self, name: &str, func: F) -> Self
    where
        F: Fn(crate::entity::Entity) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.implementations.push(Implementation::new(name, func));
        self
    }

    /// Validate and register the type
    pub fn declare(self) -> Result<EntityType> {
        if self.schema.lookup(&self.name).is_some() {
            return Err(Error::DuplicateEntityType(self.name));
        }

        let parent = self.parent.unwrap_or_else(|| self.schema.root());
        let ty = EntityType::new(&self.name, Some(parent), self.schema.downgrade());
        for field in self.fields {
            ty.add_field(field?)?;
        }
        for index in self.indices {
            ty.add_index(index)?;
        }
        for implementation in self.implementations {
            ty.add_implementation(implementation)?;
        }

        self.schema.register(ty.clone())?;
        Ok(ty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn person(schema: &Schema) -> EntityType {
        schema
            .entity("Person")
            .attribute("name", ValueType::Str)
            .bag("parents", ValueType::entity("Person"))
            .index(Index::attribute("unique_name", "name"))
            .declare()
            .unwrap()
    }

    #[test]
    fn test_resolved_includes_root_fields() {
        let schema = Schema::new("test");
        let person = person(&schema);
        let resolved = person.resolved();

        let names: Vec<&str> = resolved.fields.iter().map(|f| f.name()).collect();
        assert_eq!(names, vec!["producers", "products", "readers", "name", "parents"]);
        assert_eq!(resolved.indices.len(), 1);
        assert!(person.is_a("Entity"));
        assert!(person.is_a("Person"));
    }

    #[test]
    fn test_duplicate_field() {
        let schema = Schema::new("test");
        let err = schema
            .entity("Thing")
            .attribute("name", ValueType::Str)
            .bag("name", ValueType::Any)
            .declare()
            .unwrap_err();
        assert_eq!(
            err,
            Error::DuplicateField {
                entity_type: "Thing".to_string(),
                field: "name".to_string()
            }
        );
        assert!(schema.lookup("Thing").is_none());
    }

    #[test]
    fn test_invalid_bounds_at_declaration() {
        let schema = Schema::new("test");
        let err = schema
            .entity("Thing")
            .bounded("scores", ValueType::Int, 2, 1)
            .declare()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidBounds { .. }));
    }

    #[test]
    fn test_frozen_domain_rejects_changes() {
        let schema = Schema::new("test");
        let person = person(&schema);
        person.add_attribute("nickname", ValueType::Str).unwrap();

        person.freeze();
        assert!(schema.root().is_frozen());
        let err = person
            .add_implementation(Implementation::new("late", |_| async { Ok(()) }))
            .unwrap_err();
        assert_eq!(
            err,
            Error::DomainModifiedAfterFreeze {
                entity_type: "Person".to_string()
            }
        );
        assert!(person.add_index(Index::attribute("nick", "nickname")).is_err());
    }

    #[test]
    fn test_inherited_index_last_wins_in_place() {
        let schema = Schema::new("test");
        let person = person(&schema);
        let by_age = Index::attribute("by_age", "age");
        let replacement = Index::attribute("unique_name", "nickname");
        let dad = schema
            .entity("Dad")
            .extends(&person)
            .attribute("nickname", ValueType::Str)
            .index(by_age.clone())
            .index(replacement.clone())
            .declare()
            .unwrap();

        let indices = dad.indices();
        assert_eq!(indices.len(), 2);
        assert_eq!(indices[0], replacement);
        assert_eq!(indices[1], by_age);
        assert!(dad.is_subtype_of(&person));
        assert!(!person.is_subtype_of(&dad));
    }

    #[test]
    fn test_implementations_ancestor_first() {
        let schema = Schema::new("test");
        let base = schema
            .entity("Base")
            .implementation("base_a", |_| async { Ok(()) })
            .implementation("base_b", |_| async { Ok(()) })
            .declare()
            .unwrap();
        let derived = schema
            .entity("Derived")
            .extends(&base)
            .implementation("derived", |_| async { Ok(()) })
            .declare()
            .unwrap();

        let names: Vec<String> = derived
            .resolved()
            .implementations
            .iter()
            .map(|i| i.name().to_string())
            .filter(|n| !n.starts_with("bind_") && n != "producers_are_readers")
            .collect();
        assert_eq!(names, vec!["base_a", "base_b", "derived"]);
    }
}
