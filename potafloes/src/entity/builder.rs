//! Entity construction and lookup
//!
//! Constructing an entity either creates a new instance or returns the
//! existing one that shares a key under some index:
//!
//! 1. classify arguments against the type's fields and check types
//! 2. fill defaults, reject missing required attributes
//! 3. build a candidate holding attributes only
//! 4. freeze the domain; under the entity context lock, look for an
//!    existing instance index by index. On a match every supplied
//!    attribute must agree with it, supplied attachments are double bound
//!    to its own, and it is returned without scheduling anything
//! 5. otherwise bind attachments (supplied ones directly, fresh ones for
//!    the rest) and register the instance, resolving pending queries
//! 6. spawn the implementations in the new entity's scope
//!
//! Construction inside another entity's scope records that entity in the
//! result's `producers`; lookups record the scope entity in `readers`.

use super::context::Lookup;
use super::{scope, Entity};
use crate::attachment::{double_bind, Argument, Attachment};
use crate::context::{park, Context};
use crate::error::{Error, Result};
use crate::schema::{EntityType, FieldKind, Index};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Named arguments for one construction
#[must_use = "nothing is constructed until `build` is called"]
pub struct EntityBuilder {
    entity_type: EntityType,
    context: Context,
    args: Vec<(String, Argument)>,
}

impl EntityType {
    /// Start constructing an instance in `ctx`
    pub fn create(&self, ctx: &Context) -> EntityBuilder {
        EntityBuilder {
            entity_type: self.clone(),
            context: ctx.clone(),
            args: Vec::new(),
        }
    }

    /// The instance with `key` under `index`, waiting for it to be
    /// constructed if necessary
    ///
    /// The wait is a parked suspension point: if the graph settles
    /// without such an instance, the calling task is abandoned. A task
    /// that joins or selects this with other work is abandoned too, and
    /// the other work with it; use [`EntityType::get_unparked`] there.
    pub async fn get(&self, ctx: &Context, index: &Index, key: impl Into<Value>) -> Result<Entity> {
        self.lookup(ctx, index, key.into(), true).await
    }

    /// Like [`EntityType::get`], but the wait does not count as parked
    ///
    /// The context keeps draining while this is pending, so a query
    /// nothing ever resolves holds the run open until the task ends.
    pub async fn get_unparked(
        &self,
        ctx: &Context,
        index: &Index,
        key: impl Into<Value>,
    ) -> Result<Entity> {
        self.lookup(ctx, index, key.into(), false).await
    }

    async fn lookup(&self, ctx: &Context, index: &Index, key: Value, parked: bool) -> Result<Entity> {
        if !self.resolved().has_index(index) {
            return Err(Error::UnregisteredIndex {
                entity_type: self.name().to_string(),
                index: index.name().to_string(),
            });
        }

        let instance = match ctx.entity_context(self).lookup(index, key)? {
            Lookup::Found(instance) => instance,
            Lookup::Pending(query) if parked => park(query).await?,
            Lookup::Pending(query) => query.await?,
        };
        record_reader(&instance)?;
        Ok(instance)
    }

    /// The instance with `key` under `index`, if it already exists
    pub fn find(&self, ctx: &Context, index: &Index, key: impl Into<Value>) -> Result<Entity> {
        ctx.entity_context(self).find_instance(index, &key.into())
    }
}

impl EntityBuilder {
    /// Supply an attribute value or an attachment
    pub fn set(mut self, name: impl Into<String>, arg: impl Into<Argument>) -> Self {
        self.args.push((name.into(), arg.into()));
        self
    }

    /// Resolve to an existing instance or register a new one
    ///
    /// Requires a tokio runtime, since a new instance spawns its
    /// implementations.
    pub fn build(self) -> Result<Entity> {
        let EntityBuilder {
            entity_type,
            context,
            args,
        } = self;

        if tokio::runtime::Handle::try_current().is_err() {
            return Err(Error::NoRuntime {
                task: format!("{}(..)", entity_type.name()),
            });
        }

        let resolved = entity_type.resolved();
        let mut attributes: Vec<(Arc<str>, Value)> = Vec::new();
        let mut supplied: Vec<Arc<str>> = Vec::new();
        let mut bound: HashMap<Arc<str>, Attachment> = HashMap::new();

        for (name, arg) in args {
            let field = resolved.field(&name).ok_or_else(|| Error::UnknownAttribute {
                entity_type: entity_type.name().to_string(),
                attribute: name.clone(),
            })?;

            match (field.kind(), arg) {
                (FieldKind::Attribute { ty, .. }, Argument::Value(value)) => {
                    if !ty.accepts(&value) {
                        return Err(Error::AttributeType {
                            entity_type: entity_type.name().to_string(),
                            attribute: name,
                            expected: ty.to_string(),
                            got: value.type_name(),
                        });
                    }
                    attributes.retain(|(n, _)| **n != *name);
                    supplied.retain(|n| **n != *name);
                    attributes.push((field.shared_name(), value));
                    supplied.push(field.shared_name());
                }
                (FieldKind::Attribute { ty, .. }, Argument::Attachment(attachment)) => {
                    return Err(Error::AttributeType {
                        entity_type: entity_type.name().to_string(),
                        attribute: name,
                        expected: ty.to_string(),
                        got: attachment.to_string(),
                    });
                }
                (FieldKind::Attachment { kind, inner }, Argument::Attachment(attachment)) => {
                    let schema = entity_type.schema();
                    if attachment.kind() != *kind
                        || !attachment.inner_type().is_subtype_of(inner, schema.as_ref())
                    {
                        return Err(Error::InvalidAttachment {
                            entity_type: entity_type.name().to_string(),
                            field: name,
                            expected: format!("{}[{}]", kind.name(), inner),
                            got: attachment.to_string(),
                        });
                    }
                    bound.insert(field.shared_name(), attachment);
                }
                (FieldKind::Attachment { kind, inner }, Argument::Value(value)) => {
                    return Err(Error::InvalidAttachment {
                        entity_type: entity_type.name().to_string(),
                        field: name,
                        expected: format!("{}[{}]", kind.name(), inner),
                        got: value.to_string(),
                    });
                }
            }
        }

        let mut missing = Vec::new();
        for field in resolved.attributes() {
            if attributes.iter().any(|(n, _)| **n == *field.name()) {
                continue;
            }
            match field.kind() {
                FieldKind::Attribute {
                    default: Some(default),
                    ..
                } => attributes.push((field.shared_name(), default.clone())),
                _ => missing.push(field.name().to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(Error::MissingAttributes {
                entity_type: entity_type.name().to_string(),
                names: missing,
            });
        }

        let candidate = Entity::candidate(entity_type.clone(), context.clone(), attributes);
        entity_type.freeze();
        let resolved = entity_type.resolved();

        // Keys are memoized on the candidate before locking, so index
        // functions never run under the entity context lock
        let keys: Vec<Value> = resolved
            .indices
            .iter()
            .map(|index| index.evaluate(&candidate))
            .collect();

        let entity_context = context.entity_context(&entity_type);
        let mut state = entity_context.state();

        let existing = resolved
            .indices
            .iter()
            .zip(&keys)
            .find_map(|(index, key)| state.find(index, key));
        if let Some(existing) = existing {
            drop(state);
            merge_into_existing(&existing, &candidate, &supplied, bound)?;
            record_producer(&existing)?;
            return Ok(existing);
        }

        let label: Arc<str> = Arc::from(candidate.to_string());
        let schema = entity_type.schema();
        let mut attachments = HashMap::new();
        for field in resolved.attachments() {
            let attachment = match bound.remove(field.name()) {
                Some(attachment) => attachment,
                None => {
                    let FieldKind::Attachment { kind, inner } = field.kind() else {
                        continue;
                    };
                    Attachment::create(
                        &context,
                        schema.clone(),
                        label.clone(),
                        field.shared_name(),
                        *kind,
                        inner.clone(),
                    )?
                }
            };
            attachments.insert(field.shared_name(), attachment);
        }
        candidate.bind_attachments(attachments);
        state.insert(candidate.clone())?;
        drop(state);

        for implementation in &resolved.implementations {
            context.spawn_scoped(
                format!("{}({})", implementation.name(), candidate),
                Some(candidate.clone()),
                implementation.call(candidate.clone()),
            )?;
        }

        record_producer(&candidate)?;
        Ok(candidate)
    }
}

fn merge_into_existing(
    existing: &Entity,
    candidate: &Entity,
    supplied: &[Arc<str>],
    bound: HashMap<Arc<str>, Attachment>,
) -> Result<()> {
    for name in supplied {
        let held = existing.attr(name).cloned().unwrap_or_default();
        let attempted = candidate.attr(name).cloned().unwrap_or_default();
        if held != attempted {
            return Err(Error::DoubleSet {
                entity: existing.to_string(),
                attribute: name.to_string(),
                existing: held,
                attempted,
            });
        }
    }

    for (field, attachment) in bound {
        let own = existing.attachment(&field)?;
        if !own.same(&attachment) {
            double_bind(&own, &attachment)?;
        }
    }

    debug!(instance = %existing, "construction resolved to existing instance");
    Ok(())
}

fn record_producer(instance: &Entity) -> Result<()> {
    if let Some(producer) = scope::current() {
        if producer != *instance {
            instance.producers()?.send(producer)?;
        }
    }
    Ok(())
}

fn record_reader(instance: &Entity) -> Result<()> {
    if let Some(reader) = scope::current() {
        if reader != *instance {
            instance.readers()?.send(reader)?;
        }
    }
    Ok(())
}
