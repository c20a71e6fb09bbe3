//! Field declarations: plain attributes and attachment fields

use crate::error::{Error, Result};
use crate::value::{Value, ValueType};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Attachment variant of an attachment field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AttachmentKind {
    /// Distinct elements, unbounded
    Bag,
    /// At most one element
    Single,
    /// Distinct elements with cardinality bounds
    Bounded { min: usize, max: usize },
}

impl AttachmentKind {
    pub fn name(&self) -> &'static str {
        match self {
            AttachmentKind::Bag => "Bag",
            AttachmentKind::Single => "Single",
            AttachmentKind::Bounded { .. } => "BoundedStream",
        }
    }

    /// Bounded kind, rejecting `max < min`
    pub fn bounded(field: &str, min: usize, max: usize) -> Result<Self> {
        if max < min {
            return Err(Error::InvalidBounds {
                field: field.to_string(),
                min,
                max,
            });
        }
        Ok(AttachmentKind::Bounded { min, max })
    }
}

impl fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachmentKind::Bounded { min, max } => write!(f, "BoundedStream({min}..={max})"),
            other => write!(f, "{}", other.name()),
        }
    }
}

/// What a field holds
#[derive(Debug, Clone)]
pub enum FieldKind {
    /// Immutable value fixed at construction
    Attribute {
        ty: ValueType,
        default: Option<Value>,
    },
    /// Live attachment created once per instance
    Attachment { kind: AttachmentKind, inner: ValueType },
}

/// A declared field of an entity type
#[derive(Debug, Clone)]
pub struct Field {
    name: Arc<str>,
    kind: FieldKind,
}

impl Field {
    pub fn attribute(name: impl AsRef<str>, ty: ValueType) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind: FieldKind::Attribute { ty, default: None },
        }
    }

    pub fn attribute_with_default(name: impl AsRef<str>, ty: ValueType, default: impl Into<Value>) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind: FieldKind::Attribute {
                ty,
                default: Some(default.into()),
            },
        }
    }

    pub fn attachment(name: impl AsRef<str>, kind: AttachmentKind, inner: ValueType) -> Self {
        Self {
            name: Arc::from(name.as_ref()),
            kind: FieldKind::Attachment { kind, inner },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        self.name.clone()
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_attachment(&self) -> bool {
        matches!(self.kind, FieldKind::Attachment { .. })
    }

    /// Attribute without a default
    pub fn is_required(&self) -> bool {
        matches!(self.kind, FieldKind::Attribute { default: None, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_rejects_inverted_bounds() {
        assert_eq!(
            AttachmentKind::bounded("scores", 3, 1).unwrap_err(),
            Error::InvalidBounds {
                field: "scores".to_string(),
                min: 3,
                max: 1
            }
        );
        assert_eq!(
            AttachmentKind::bounded("scores", 1, 1).unwrap(),
            AttachmentKind::Bounded { min: 1, max: 1 }
        );
    }

    #[test]
    fn test_required() {
        assert!(Field::attribute("name", ValueType::Str).is_required());
        assert!(!Field::attribute_with_default("age", ValueType::Int, 0).is_required());
        assert!(!Field::attachment("parents", AttachmentKind::Bag, ValueType::Any).is_required());
    }
}
