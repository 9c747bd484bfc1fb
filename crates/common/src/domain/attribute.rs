use crate::domain::result::{DomainError, DomainResult};
use garde::Validate;
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Maximum number of attributes a device may carry in one set.
///
/// Repeated as a literal in the garde rule on [`AttributeSet`]; keep both in step.
pub const ATTRIBUTES_MAX_LENGTH: usize = 100;

/// Maximum length of an attribute key or value.
///
/// Repeated as a literal in the garde rules on [`Attribute`]; keep both in step.
pub const ATTRIBUTE_FIELD_MAX_LENGTH: usize = 4096;

/// A single configuration entry.
///
/// Stored as a `{key, value}` object so that the position of an entry inside a
/// set survives a round trip through the database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Attribute {
    // max = ATTRIBUTE_FIELD_MAX_LENGTH
    #[garde(length(min = 1, max = 4096))]
    pub key: String,
    #[garde(length(max = 4096))]
    pub value: String,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Ordered, bounded list of attributes.
///
/// On the wire this is a flat `key -> value` object; order is not significant
/// there, but the store keeps insertion order so the length bound can drop the
/// oldest entries first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Validate)]
pub struct AttributeSet(
    // max = ATTRIBUTES_MAX_LENGTH
    #[garde(length(max = 100), dive)] Vec<Attribute>,
);

impl AttributeSet {
    pub fn new(attributes: Vec<Attribute>) -> Self {
        Self(attributes)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.0.iter()
    }

    pub fn as_slice(&self) -> &[Attribute] {
        &self.0
    }

    pub fn into_inner(self) -> Vec<Attribute> {
        self.0
    }

    pub fn keys(&self) -> Vec<String> {
        self.0.iter().map(|a| a.key.clone()).collect()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value.as_str())
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|a| (a.key.clone(), a.value.clone()))
            .collect()
    }

    /// Decode the wire form. Values must be strings; anything else is
    /// rejected until typed values are supported.
    pub fn from_json(value: &serde_json::Value) -> DomainResult<Self> {
        let map = value.as_object().ok_or_else(|| {
            DomainError::ValidationError("configuration must be a JSON object".to_string())
        })?;

        let attributes = map
            .iter()
            .map(|(key, value)| match value {
                serde_json::Value::String(s) => Ok(Attribute::new(key.clone(), s.clone())),
                other => Err(DomainError::ValidationError(format!(
                    "{}: invalid type: {}",
                    key,
                    json_type_name(other)
                ))),
            })
            .collect::<DomainResult<Vec<_>>>()?;

        Ok(Self(attributes))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|a| (a.key.clone(), serde_json::Value::String(a.value.clone())))
                .collect(),
        )
    }

    pub fn ensure_unique_keys(&self) -> DomainResult<()> {
        let mut seen = HashSet::with_capacity(self.0.len());
        for attribute in &self.0 {
            if !seen.insert(attribute.key.as_str()) {
                return Err(DomainError::ValidationError(format!(
                    "duplicate attribute key: {}",
                    attribute.key
                )));
            }
        }
        Ok(())
    }

    /// Pull step of the merge protocol: drop every entry whose key is listed,
    /// keeping the relative order of the rest.
    pub fn without_keys(&self, keys: &[String]) -> AttributeSet {
        let keys: HashSet<&str> = keys.iter().map(String::as_str).collect();
        AttributeSet(
            self.0
                .iter()
                .filter(|a| !keys.contains(a.key.as_str()))
                .cloned()
                .collect(),
        )
    }

    /// Push-and-bound step of the merge protocol: append `new` and keep only
    /// the last `max_length` entries, so new entries displace the oldest ones.
    pub fn push_bounded(&self, new: &AttributeSet, max_length: usize) -> AttributeSet {
        let mut merged: Vec<Attribute> = self.0.iter().chain(new.0.iter()).cloned().collect();
        if merged.len() > max_length {
            merged.drain(..merged.len() - max_length);
        }
        AttributeSet(merged)
    }

    /// Both merge steps applied back to back.
    pub fn merged_with(&self, new: &AttributeSet, max_length: usize) -> AttributeSet {
        self.without_keys(&new.keys()).push_bounded(new, max_length)
    }
}

impl From<Vec<Attribute>> for AttributeSet {
    fn from(attributes: Vec<Attribute>) -> Self {
        Self(attributes)
    }
}

impl<K, V> FromIterator<(K, V)> for AttributeSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| Attribute::new(k, v)).collect())
    }
}

impl Serialize for AttributeSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for attribute in &self.0 {
            map.serialize_entry(&attribute.key, &attribute.value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for AttributeSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct AttributeSetVisitor;

        impl<'de> Visitor<'de> for AttributeSetVisitor {
            type Value = AttributeSet;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of string attribute values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<AttributeSet, A::Error> {
                let mut attributes = Vec::with_capacity(access.size_hint().unwrap_or(0));
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    attributes.push(Attribute { key, value });
                }
                Ok(AttributeSet(attributes))
            }
        }

        deserializer.deserialize_map(AttributeSetVisitor)
    }
}

fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
