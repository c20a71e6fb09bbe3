//! Potafloes - entity resolution and reactive attachments for dataflow models
//!
//! This crate lets a program describe a model as a set of entity types and
//! then grow the model by constructing entities from concurrently running
//! implementations. Construction is idempotent: building an entity whose
//! key under some index matches an existing instance returns that instance.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                           Context                            │
//! │   (task set, settle barrier, captured errors)                │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │  ┌──────────────────┐  ┌──────────────────┐                  │
//! │  │ EntityContext A  │  │ EntityContext B  │  ...             │
//! │  │ instances+queries│  │ instances+queries│                  │
//! │  └────────┬─────────┘  └────────┬─────────┘                  │
//! │           │                     │                            │
//! │           ▼                     ▼                            │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │                       Entities                         │  │
//! │  │  attributes (immutable)   attachments (Bag / Single /  │  │
//! │  │                           BoundedStream, reactive)     │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!              ▲
//!              │ declared by
//!   Schema ── EntityType ── Field / Index / Implementation
//! ```
//!
//! # Core Concepts
//!
//! ## Entity types
//!
//! A [`Schema`] holds named [`EntityType`]s. Each type declares attributes
//! (immutable, typed), attachment fields, indices (key functions used for
//! identity) and implementations (async functions run once per new
//! instance). Types inherit from a single parent; every type descends from
//! the root type `Entity`.
//!
//! ## Attachments
//!
//! An [`Attachment`] is a monotone container bound to an entity field.
//! Subscribers see every element exactly once, and attachments can be
//! chained with [`Attachment::add`] or mirrored with [`double_bind`].
//!
//! ## Settling
//!
//! [`Context::stop`] waits until every tracked task has finished or is
//! parked on an engine future (a pending query, an unset [`Single`], an
//! incomplete [`BoundedStream`]). Parked tasks are then abandoned and the
//! context freezes.
//!
//! # Example
//!
//! ```rust
//! use potafloes::{Context, Index, Schema, ValueType};
//!
//! let schema = Schema::new("people");
//! let person = schema
//!     .entity("Person")
//!     .attribute("name", ValueType::Str)
//!     .index(Index::attribute("unique_name", "name"))
//!     .declare()?;
//!
//! let ctx = Context::new("main");
//! ctx.run(move |ctx| async move {
//!     let a = person.create(&ctx).set("name", "bob").build()?;
//!     let b = person.create(&ctx).set("name", "bob").build()?;
//!     assert_eq!(a, b);
//!     Ok(())
//! })?;
//! assert!(ctx.is_frozen());
//! # Ok::<(), anyhow::Error>(())
//! ```

// Modules
pub mod attachment;
pub mod config;
pub mod context;
pub mod entity;
pub mod error;
pub mod logging;
pub mod schema;
pub mod types;
pub mod value;

// Re-exports for convenience
pub use attachment::{double_bind, Argument, Attachment, Bag, BoundedStream, Single, Subscriber};
pub use config::{ConfigError, ContextConfig};
pub use context::{park, Context, ContextStats, Park, Settled, TaskFailure};
pub use entity::{Entity, EntityBuilder, EntityContext, EntityContextStats, Lookup, PendingQuery};
pub use error::{Error, Result};
pub use logging::init_tracing;
pub use schema::{AttachmentKind, EntityType, Field, FieldKind, Implementation, Index, Schema, TypeBuilder, ROOT_TYPE};
pub use types::{ContextId, EntityId, EntityTypeId, IndexId, TaskId};
pub use value::{Value, ValueType};
