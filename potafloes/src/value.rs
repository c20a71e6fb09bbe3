//! Dynamic values and type descriptors
//!
//! Attributes, index keys and attachment elements are all [`Value`]s.
//! Every declared field carries a [`ValueType`] that is checked at runtime
//! when values enter the engine.

use crate::entity::Entity;
use crate::schema::Schema;
use serde::ser::{Serialize, SerializeSeq, Serializer};
use std::fmt;
use std::sync::Arc;

/// A dynamically typed value
///
/// Entities compare and hash by identity, so a `Value::Entity` can be an
/// index key or a bag element without inspecting the entity's contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum Value {
    #[default]
    None,
    Bool(bool),
    Int(i64),
    Str(Arc<str>),
    List(Vec<Value>),
    Entity(Entity),
}

impl Value {
    /// Build a string value
    pub fn str(s: impl AsRef<str>) -> Self {
        Value::Str(Arc::from(s.as_ref()))
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_entity(&self) -> Option<&Entity> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }

    /// Short name of the value's runtime type, used in error messages
    pub fn type_name(&self) -> String {
        match self {
            Value::None => "None".to_string(),
            Value::Bool(_) => "bool".to_string(),
            Value::Int(_) => "int".to_string(),
            Value::Str(_) => "str".to_string(),
            Value::List(_) => "list".to_string(),
            Value::Entity(e) => e.entity_type().name().to_string(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::None => write!(f, "None"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Value::Entity(e) => write!(f, "{}", e),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::None => serializer.serialize_none(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Str(s) => serializer.serialize_str(s),
            Value::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            // Entities serialize as their label to keep snapshots acyclic
            Value::Entity(e) => serializer.serialize_str(&e.to_string()),
        }
    }
}

macro_rules! value_from {
    ($($ty:ty => |$v:ident| $body:expr),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from($v: $ty) -> Self {
                    $body
                }
            }
        )*
    };
}

value_from! {
    bool => |v| Value::Bool(v),
    i64 => |v| Value::Int(v),
    i32 => |v| Value::Int(v as i64),
    u32 => |v| Value::Int(v as i64),
    &str => |v| Value::str(v),
    String => |v| Value::Str(Arc::from(v)),
    Entity => |v| Value::Entity(v),
    &Entity => |v| Value::Entity(v.clone()),
    Vec<Value> => |v| Value::List(v),
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::None)
    }
}

/// Declared type of an attribute or attachment element
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueType {
    Any,
    None,
    Bool,
    Int,
    Str,
    List(Box<ValueType>),
    /// Instances of the named entity type or any of its subtypes
    Entity(Arc<str>),
    Union(Vec<ValueType>),
}

impl ValueType {
    /// Entity type reference by name
    pub fn entity(name: impl AsRef<str>) -> Self {
        ValueType::Entity(Arc::from(name.as_ref()))
    }

    pub fn list(inner: ValueType) -> Self {
        ValueType::List(Box::new(inner))
    }

    /// `T | None`
    pub fn optional(inner: ValueType) -> Self {
        ValueType::Union(vec![inner, ValueType::None])
    }

    /// Check a value against this type
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ValueType::Any, _) => true,
            (ValueType::Union(types), v) => types.iter().any(|t| t.accepts(v)),
            (ValueType::None, Value::None) => true,
            (ValueType::Bool, Value::Bool(_)) => true,
            (ValueType::Int, Value::Int(_)) => true,
            (ValueType::Str, Value::Str(_)) => true,
            (ValueType::List(inner), Value::List(items)) => items.iter().all(|i| inner.accepts(i)),
            (ValueType::Entity(name), Value::Entity(e)) => e.entity_type().is_a(name),
            _ => false,
        }
    }

    /// Whether every value of `self` is also accepted by `other`
    ///
    /// Entity names are resolved through `schema`; without one, only
    /// identical names are related.
    pub fn is_subtype_of(&self, other: &ValueType, schema: Option<&Schema>) -> bool {
        match (self, other) {
            (_, ValueType::Any) => true,
            (ValueType::Union(types), _) => types.iter().all(|t| t.is_subtype_of(other, schema)),
            (_, ValueType::Union(types)) => types.iter().any(|t| self.is_subtype_of(t, schema)),
            (ValueType::None, ValueType::None)
            | (ValueType::Bool, ValueType::Bool)
            | (ValueType::Int, ValueType::Int)
            | (ValueType::Str, ValueType::Str) => true,
            (ValueType::List(a), ValueType::List(b)) => a.is_subtype_of(b, schema),
            (ValueType::Entity(a), ValueType::Entity(b)) => {
                a == b
                    || schema
                        .and_then(|s| s.lookup(a))
                        .map(|t| t.is_a(b))
                        .unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueType::Any => write!(f, "any"),
            ValueType::None => write!(f, "None"),
            ValueType::Bool => write!(f, "bool"),
            ValueType::Int => write!(f, "int"),
            ValueType::Str => write!(f, "str"),
            ValueType::List(inner) => write!(f, "list[{}]", inner),
            ValueType::Entity(name) => write!(f, "{}", name),
            ValueType::Union(types) => {
                for (i, t) in types.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{}", t)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_accepts() {
        assert!(ValueType::Int.accepts(&Value::Int(3)));
        assert!(!ValueType::Int.accepts(&Value::str("3")));
        assert!(ValueType::Any.accepts(&Value::None));
        assert!(!ValueType::Str.accepts(&Value::None));
    }

    #[test]
    fn test_optional_accepts_none() {
        let t = ValueType::optional(ValueType::Str);
        assert!(t.accepts(&Value::None));
        assert!(t.accepts(&Value::str("x")));
        assert!(!t.accepts(&Value::Int(1)));
        assert_eq!(t.to_string(), "str | None");
    }

    #[test]
    fn test_list_accepts() {
        let t = ValueType::list(ValueType::Int);
        assert!(t.accepts(&Value::List(vec![Value::Int(1), Value::Int(2)])));
        assert!(!t.accepts(&Value::List(vec![Value::Int(1), Value::Bool(true)])));
    }

    #[test]
    fn test_subtyping_without_schema() {
        assert!(ValueType::Int.is_subtype_of(&ValueType::Any, None));
        assert!(ValueType::Int.is_subtype_of(&ValueType::optional(ValueType::Int), None));
        assert!(!ValueType::optional(ValueType::Int).is_subtype_of(&ValueType::Int, None));
        assert!(ValueType::entity("Person").is_subtype_of(&ValueType::entity("Person"), None));
        assert!(!ValueType::entity("Dad").is_subtype_of(&ValueType::entity("Person"), None));
    }

    #[test]
    fn test_display_and_from() {
        assert_eq!(Value::from("bob").to_string(), "\"bob\"");
        assert_eq!(Value::from(Some(4)).to_string(), "4");
        assert_eq!(Value::from(None::<i64>), Value::None);
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::None]).to_string(),
            "[1, None]"
        );
    }

    #[test]
    fn test_serialize() {
        let v = Value::List(vec![Value::Int(1), Value::str("a"), Value::None]);
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1,\"a\",null]");
    }
}
