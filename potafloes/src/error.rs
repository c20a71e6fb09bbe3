//! Error types for the potafloes runtime

use crate::value::Value;
use thiserror::Error;

/// Engine error
///
/// `Clone` so that completion futures (bounded streams, shared stop
/// futures) can hand the same failure to every awaiter.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// `init` called twice without a `reset`
    #[error("context {0} is already initialized")]
    AlreadyInitialized(String),

    /// `freeze` called on a frozen context
    #[error("context {0} is already frozen")]
    AlreadyFrozen(String),

    /// Instance or query added to a frozen entity context
    #[error("{entity_type} instances in context {context} are frozen")]
    ContextModifiedAfterFreeze { context: String, entity_type: String },

    /// Index, implementation or field added after the first construction
    #[error("the domain of {entity_type} is frozen, it already has instances")]
    DomainModifiedAfterFreeze { entity_type: String },

    /// Conflicting attribute or single value
    #[error("{entity}.{attribute} is already {existing}, cannot set it to {attempted}")]
    DoubleSet {
        entity: String,
        attribute: String,
        existing: Value,
        attempted: Value,
    },

    /// Attachment element of the wrong type
    #[error("{attachment} expects {expected}, got {value}")]
    AttachmentItemType {
        attachment: String,
        expected: String,
        value: Value,
    },

    /// Attribute value of the wrong type
    #[error("{entity_type}.{attribute} expects {expected}, got {got}")]
    AttributeType {
        entity_type: String,
        attribute: String,
        expected: String,
        got: String,
    },

    /// No live instance matches an index key
    #[error("no {entity_type} with {index} = {key}")]
    NotFound {
        entity_type: String,
        index: String,
        key: Value,
    },

    /// Counted send after a bounded stream completed
    #[error("{attachment} overflowed, it accepts at most {max} item(s)")]
    BoundedStreamOverflow { attachment: String, max: usize },

    /// Bounded stream reached `max` sends with fewer than `min` items
    #[error("{attachment} completed with {len} item(s), fewer than the minimum of {min}")]
    IncompleteBoundedStream {
        attachment: String,
        len: usize,
        min: usize,
    },

    /// Bounded stream declared with `max < min`
    #[error("invalid bounds for {field}: max {max} is lower than min {min}")]
    InvalidBounds { field: String, min: usize, max: usize },

    /// Field not declared on the type
    #[error("{entity_type} has no field {attribute}")]
    UnknownAttribute {
        entity_type: String,
        attribute: String,
    },

    /// Required attributes not supplied at construction
    #[error("{entity_type} is missing required attribute(s): {}", .names.join(", "))]
    MissingAttributes {
        entity_type: String,
        names: Vec<String>,
    },

    /// Query through an index the type does not carry
    #[error("index {index} is not registered on {entity_type}")]
    UnregisteredIndex { entity_type: String, index: String },

    /// Attachment field given a value or a mismatched attachment
    #[error("{entity_type}.{field} expects {expected}, got {got}")]
    InvalidAttachment {
        entity_type: String,
        field: String,
        expected: String,
        got: String,
    },

    /// Augmented union between attachments with incompatible item types
    #[error("cannot add {origin} to {target}, their item types are incompatible")]
    IncompatibleAttachment { target: String, origin: String },

    /// Field declared twice on one type
    #[error("{entity_type} declares field {field} twice")]
    DuplicateField { entity_type: String, field: String },

    /// Type name already taken in the schema
    #[error("entity type {0} is already declared")]
    DuplicateEntityType(String),

    /// Type name not present in the schema
    #[error("unknown entity type {0}")]
    UnknownEntityType(String),

    /// Typed accessor used on the wrong attachment variant
    #[error("{attachment} is a {actual}, not a {expected}")]
    WrongAttachmentKind {
        attachment: String,
        expected: String,
        actual: String,
    },

    /// Pending query dropped by a context reset
    #[error("query for {entity_type} with {index} = {key} was abandoned")]
    QueryAbandoned {
        entity_type: String,
        index: String,
        key: Value,
    },

    /// Attachment dropped while something awaited its completion
    #[error("{0} was dropped before it completed")]
    AttachmentDropped(String),

    /// Spawn attempted outside a tokio runtime
    #[error("no tokio runtime is available to spawn {task}")]
    NoRuntime { task: String },

    /// Tracked task panicked
    #[error("task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },
}

/// Result type using the engine error
pub type Result<T> = std::result::Result<T, Error>;
