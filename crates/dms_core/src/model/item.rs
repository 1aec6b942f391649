//! Item domain model.
//!
//! # Responsibility
//! - Define identity and kind of configuration tree items.
//! - Define typed value arrays held by attribute items.
//! - Define the structural descriptor established by the meta phase.
//!
//! # Invariants
//! - `ItemId` is stable for the lifetime of an engine session.
//! - A `Values` array never mixes element types.
//! - `MetaDescriptor` describes structure only, never element values.

use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Stable identifier for every item in the configuration tree.
pub type ItemId = Uuid;

/// Category of one configuration tree item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// Grouping node without values of its own.
    Container,
    /// Index key space for attribute items.
    DomainUnit,
    /// Value array over exactly one domain unit.
    Attribute,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::DomainUnit => "domain_unit",
            Self::Attribute => "attribute",
        }
    }
}

/// Element type of a value array or domain key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    #[serde(rename = "uint32")]
    UInt32,
    Int32,
    Int64,
    Float64,
    Text,
}

impl ValueType {
    /// Stable string id used by storage backends.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::UInt32 => "uint32",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::Float64 => "float64",
            Self::Text => "text",
        }
    }

    /// Parses the stable string id written by `as_str`.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "bool" => Some(Self::Bool),
            "uint32" => Some(Self::UInt32),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            "float64" => Some(Self::Float64),
            "text" => Some(Self::Text),
            _ => None,
        }
    }
}

impl Display for ValueType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed value array owned by one attribute item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Values {
    Bool(Vec<bool>),
    #[serde(rename = "uint32")]
    UInt32(Vec<u32>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
    Float64(Vec<f64>),
    Text(Vec<String>),
}

impl Values {
    /// Creates an empty array of the given element type.
    pub fn empty(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Bool => Self::Bool(Vec::new()),
            ValueType::UInt32 => Self::UInt32(Vec::new()),
            ValueType::Int32 => Self::Int32(Vec::new()),
            ValueType::Int64 => Self::Int64(Vec::new()),
            ValueType::Float64 => Self::Float64(Vec::new()),
            ValueType::Text => Self::Text(Vec::new()),
        }
    }

    /// Index sequence `0..count`, the value view of a domain unit.
    pub fn index_sequence(count: u32) -> Self {
        Self::UInt32((0..count).collect())
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::UInt32(_) => ValueType::UInt32,
            Self::Int32(_) => ValueType::Int32,
            Self::Int64(_) => ValueType::Int64,
            Self::Float64(_) => ValueType::Float64,
            Self::Text(_) => ValueType::Text,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Bool(values) => values.len(),
            Self::UInt32(values) => values.len(),
            Self::Int32(values) => values.len(),
            Self::Int64(values) => values.len(),
            Self::Float64(values) => values.len(),
            Self::Text(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `len` elements starting at `start`, clamped to the array bounds.
    pub fn slice(&self, start: usize, len: usize) -> Self {
        fn window<T: Clone>(values: &[T], start: usize, len: usize) -> Vec<T> {
            let begin = start.min(values.len());
            let end = start.saturating_add(len).min(values.len());
            values[begin..end].to_vec()
        }

        match self {
            Self::Bool(values) => Self::Bool(window(values, start, len)),
            Self::UInt32(values) => Self::UInt32(window(values, start, len)),
            Self::Int32(values) => Self::Int32(window(values, start, len)),
            Self::Int64(values) => Self::Int64(window(values, start, len)),
            Self::Float64(values) => Self::Float64(window(values, start, len)),
            Self::Text(values) => Self::Text(window(values, start, len)),
        }
    }

    /// Appends `other` to this array.
    ///
    /// # Errors
    /// - Returns `ValueTypeMismatch` when element types differ.
    pub fn append(&mut self, other: Values) -> Result<(), ValueTypeMismatch> {
        match (self, other) {
            (Self::Bool(left), Self::Bool(right)) => left.extend(right),
            (Self::UInt32(left), Self::UInt32(right)) => left.extend(right),
            (Self::Int32(left), Self::Int32(right)) => left.extend(right),
            (Self::Int64(left), Self::Int64(right)) => left.extend(right),
            (Self::Float64(left), Self::Float64(right)) => left.extend(right),
            (Self::Text(left), Self::Text(right)) => left.extend(right),
            (left, right) => {
                return Err(ValueTypeMismatch {
                    expected: left.value_type(),
                    actual: right.value_type(),
                })
            }
        }
        Ok(())
    }
}

/// Element type disagreement between two value arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueTypeMismatch {
    pub expected: ValueType,
    pub actual: ValueType,
}

impl Display for ValueTypeMismatch {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "value type mismatch: expected {}, got {}",
            self.expected, self.actual
        )
    }
}

impl Error for ValueTypeMismatch {}

/// Key space extent of one domain unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainRange {
    pub count: u32,
}

impl DomainRange {
    pub fn new(count: u32) -> Self {
        Self { count }
    }
}

/// Structure established by the meta phase of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetaDescriptor {
    Container,
    Domain {
        range: DomainRange,
        element_type: ValueType,
    },
    Attribute {
        domain: ItemId,
        domain_range: DomainRange,
        value_type: ValueType,
    },
}

impl MetaDescriptor {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::Container => ItemKind::Container,
            Self::Domain { .. } => ItemKind::DomainUnit,
            Self::Attribute { .. } => ItemKind::Attribute,
        }
    }

    /// Element count for domain units and attributes, `None` for containers.
    pub fn element_count(&self) -> Option<u32> {
        match self {
            Self::Container => None,
            Self::Domain { range, .. } => Some(range.count),
            Self::Attribute { domain_range, .. } => Some(domain_range.count),
        }
    }
}

/// Data view returned once an item reaches data readiness.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemData {
    Container,
    Domain(DomainRange),
    Attribute(std::sync::Arc<Values>),
}

impl ItemData {
    /// Returns the value buffer for attribute items.
    pub fn values(&self) -> Option<&std::sync::Arc<Values>> {
        match self {
            Self::Attribute(values) => Some(values),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DomainRange, MetaDescriptor, ValueType, Values};

    #[test]
    fn slice_clamps_to_bounds() {
        let values = Values::Int32(vec![1, 2, 3, 4, 5]);
        assert_eq!(values.slice(1, 2), Values::Int32(vec![2, 3]));
        assert_eq!(values.slice(4, 10), Values::Int32(vec![5]));
        assert_eq!(values.slice(9, 1), Values::Int32(vec![]));
    }

    #[test]
    fn append_rejects_mixed_types() {
        let mut values = Values::Float64(vec![1.0]);
        values
            .append(Values::Float64(vec![2.0]))
            .expect("same type should append");
        assert_eq!(values.len(), 2);

        let err = values
            .append(Values::Text(vec!["x".to_string()]))
            .expect_err("mixed types must fail");
        assert_eq!(err.expected, ValueType::Float64);
        assert_eq!(err.actual, ValueType::Text);
    }

    #[test]
    fn value_type_ids_parse_back() {
        for value_type in [
            ValueType::Bool,
            ValueType::UInt32,
            ValueType::Int32,
            ValueType::Int64,
            ValueType::Float64,
            ValueType::Text,
        ] {
            assert_eq!(ValueType::parse(value_type.as_str()), Some(value_type));
            assert_eq!(Values::empty(value_type).value_type(), value_type);
        }
        assert_eq!(ValueType::parse("float32"), None);
    }

    #[test]
    fn values_serialize_with_type_tag() {
        let json = serde_json::to_string(&Values::UInt32(vec![10, 20])).expect("serialize");
        assert_eq!(json, r#"{"type":"uint32","data":[10,20]}"#);
    }

    #[test]
    fn meta_descriptor_reports_element_count() {
        let meta = MetaDescriptor::Domain {
            range: DomainRange::new(3),
            element_type: ValueType::UInt32,
        };
        assert_eq!(meta.element_count(), Some(3));
        assert_eq!(MetaDescriptor::Container.element_count(), None);
        assert_eq!(Values::index_sequence(3), Values::UInt32(vec![0, 1, 2]));
    }
}
