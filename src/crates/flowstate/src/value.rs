//! Engine-neutral object graph of a suspended computation
//!
//! The engine exposes a suspended computation as a tree of [`Value`]s. Plain
//! data is held by value; everything that lives on the engine's heap and must
//! not be copied into a checkpoint (shared components, compiled script
//! functions) is held as a [`Value::Ref`] to a [`Handle`].
//!
//! A [`Handle`] is a synthetic arena key the engine assigns to a trackable
//! object when it is created or registered. Registries and indexes look
//! objects up by handle, never by in-memory identity.
//!
//! [`WireValue`] is the serializable mirror of [`Value`] produced by the
//! codec: references are replaced by [`Stub`]s and excluded runtime helpers
//! by named markers. Lists and objects nest at most [`MAX_DEPTH`] levels;
//! deserializing a deeper [`WireValue`] fails instead of recursing further.

use crate::stub::Stub;
use serde::de::{self, DeserializeSeed, EnumAccess, SeqAccess, VariantAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Deepest nesting of lists and objects a checkpoint may contain
pub const MAX_DEPTH: usize = 128;

/// Stable synthetic key of a trackable heap object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub u64);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// A node in a suspended computation's object graph
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// A structured object; `class` names its runtime type
    Object {
        class: String,
        fields: Vec<(String, Value)>,
    },
    /// Reference to a heap object that is never embedded by value
    Ref(Handle),
}

impl Value {
    /// Build an object value
    pub fn object<I, K>(class: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Value::Object {
            class: class.into(),
            fields: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    /// Look up a field of an object value
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object { fields, .. } => fields
                .iter()
                .find(|(field, _)| field == name)
                .map(|(_, value)| value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_ref_handle(&self) -> Option<Handle> {
        match self {
            Value::Ref(handle) => Some(*handle),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

/// Serialized form of a [`Value`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WireValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<WireValue>),
    Object {
        class: String,
        fields: Vec<(String, WireValue)>,
    },
    Stub(Stub),
    /// A runtime helper object, rebound by name on load
    Excluded(String),
}

impl WireValue {
    /// Visit every node in the tree, depth first
    pub fn walk<F: FnMut(&WireValue)>(&self, f: &mut F) {
        let mut pending = vec![self];
        while let Some(node) = pending.pop() {
            f(node);
            match node {
                WireValue::List(items) => pending.extend(items.iter().rev()),
                WireValue::Object { fields, .. } => {
                    pending.extend(fields.iter().rev().map(|(_, value)| value))
                }
                _ => {}
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(variant_identifier)]
enum Tag {
    Null,
    Bool,
    Int,
    Float,
    Str,
    Bytes,
    List,
    Object,
    Stub,
    Excluded,
}

const VARIANTS: &[&str] = &[
    "Null", "Bool", "Int", "Float", "Str", "Bytes", "List", "Object", "Stub", "Excluded",
];

const OBJECT_FIELDS: &[&str] = &["class", "fields"];

impl<'de> Deserialize<'de> for WireValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Depth(MAX_DEPTH).deserialize(deserializer)
    }
}

/// Nesting levels still allowed below the value being read
#[derive(Clone, Copy)]
struct Depth(usize);

impl Depth {
    fn nested<E: de::Error>(self) -> Result<Depth, E> {
        match self.0.checked_sub(1) {
            Some(left) => Ok(Depth(left)),
            None => Err(E::custom(format!(
                "value nests deeper than {} levels",
                MAX_DEPTH
            ))),
        }
    }
}

impl<'de> DeserializeSeed<'de> for Depth {
    type Value = WireValue;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<WireValue, D::Error> {
        deserializer.deserialize_enum("WireValue", VARIANTS, self)
    }
}

impl<'de> Visitor<'de> for Depth {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a checkpoint value")
    }

    fn visit_enum<A: EnumAccess<'de>>(self, data: A) -> Result<WireValue, A::Error> {
        let (tag, variant) = data.variant::<Tag>()?;
        let nested = || self.nested::<A::Error>();
        Ok(match tag {
            Tag::Null => {
                variant.unit_variant()?;
                WireValue::Null
            }
            Tag::Bool => WireValue::Bool(variant.newtype_variant()?),
            Tag::Int => WireValue::Int(variant.newtype_variant()?),
            Tag::Float => WireValue::Float(variant.newtype_variant()?),
            Tag::Str => WireValue::Str(variant.newtype_variant()?),
            Tag::Bytes => WireValue::Bytes(variant.newtype_variant()?),
            Tag::List => WireValue::List(variant.newtype_variant_seed(Items(nested()?))?),
            Tag::Object => variant.struct_variant(OBJECT_FIELDS, ObjectVisitor(nested()?))?,
            Tag::Stub => WireValue::Stub(variant.newtype_variant()?),
            Tag::Excluded => WireValue::Excluded(variant.newtype_variant()?),
        })
    }
}

/// Sequence of values one level down
struct Items(Depth);

impl<'de> DeserializeSeed<'de> for Items {
    type Value = Vec<WireValue>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for Items {
    type Value = Vec<WireValue>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of checkpoint values")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(item) = seq.next_element_seed(self.0)? {
            items.push(item);
        }
        Ok(items)
    }
}

/// Object fields as `(name, value)` pairs one level down
struct Fields(Depth);

impl<'de> DeserializeSeed<'de> for Fields {
    type Value = Vec<(String, WireValue)>;

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_seq(self)
    }
}

impl<'de> Visitor<'de> for Fields {
    type Value = Vec<(String, WireValue)>;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a list of object fields")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut fields = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(1024));
        while let Some(field) = seq.next_element_seed(Field(self.0))? {
            fields.push(field);
        }
        Ok(fields)
    }
}

struct Field(Depth);

impl<'de> DeserializeSeed<'de> for Field {
    type Value = (String, WireValue);

    fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<Self::Value, D::Error> {
        deserializer.deserialize_tuple(2, self)
    }
}

impl<'de> Visitor<'de> for Field {
    type Value = (String, WireValue);

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a field name and value")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let name = seq
            .next_element()?
            .ok_or_else(|| <A::Error as de::Error>::invalid_length(0, &self))?;
        let value = seq
            .next_element_seed(self.0)?
            .ok_or_else(|| <A::Error as de::Error>::invalid_length(1, &self))?;
        Ok((name, value))
    }
}

struct ObjectVisitor(Depth);

impl<'de> Visitor<'de> for ObjectVisitor {
    type Value = WireValue;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("a checkpoint object")
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<WireValue, A::Error> {
        let class = seq
            .next_element()?
            .ok_or_else(|| <A::Error as de::Error>::invalid_length(0, &self))?;
        let fields = seq
            .next_element_seed(Fields(self.0))?
            .ok_or_else(|| <A::Error as de::Error>::invalid_length(1, &self))?;
        Ok(WireValue::Object { class, fields })
    }
}
