//! Shared value store
//!
//! Holds last-known item values, per-tag connection flags and the open-channel
//! list. The registry and pollers only see the [`ValueStore`] trait, so a
//! deployment can back it with whatever cache it already runs.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Attribute holding the ordered list of open channels
pub const OPEN_CHANNEL_NAMES: &str = "connection:openChannelNames";

/// Store key of a tag's connection status flag
pub fn connection_status_key(tag: &str) -> String {
    format!("{}:connectionStatus", tag)
}

/// Store key of a tag's externally toggleable poll-enable flag
pub fn enabled_key(tag: &str) -> String {
    format!("{}:enabled", tag)
}

/// A value held in the store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Bool(bool),
    Int(i64),
    Real(f64),
    Text(String),
    TextList(Vec<String>),
}

impl TagValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            TagValue::Bool(b) => Some(*b),
            TagValue::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            TagValue::Int(i) => Some(*i),
            TagValue::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            TagValue::Real(r) => Some(*r),
            TagValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[String]> {
        match self {
            TagValue::TextList(list) => Some(list),
            _ => None,
        }
    }
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Bool(b) => write!(f, "{}", b),
            TagValue::Int(i) => write!(f, "{}", i),
            TagValue::Real(r) => write!(f, "{}", r),
            TagValue::Text(s) => write!(f, "{}", s),
            TagValue::TextList(list) => write!(f, "{}", list.join(",")),
        }
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Real(v)
    }
}

/// Shared value cache collaborator
pub trait ValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<TagValue>;

    fn set(&self, key: &str, value: TagValue);

    fn remove(&self, key: &str) -> Option<TagValue>;

    fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn set_all(&self, values: &[(String, TagValue)]) {
        for (key, value) in values {
            self.set(key, value.clone());
        }
    }
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: DashMap<String, TagValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sorted keys, mostly for diagnostics
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }
}

impl ValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<TagValue> {
        self.values.get(key).map(|v| v.value().clone())
    }

    fn set(&self, key: &str, value: TagValue) {
        self.values.insert(key.to_string(), value);
    }

    fn remove(&self, key: &str) -> Option<TagValue> {
        self.values.remove(key).map(|(_, v)| v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_basic() {
        let store = MemoryStore::new();
        assert!(store.is_empty());

        store.set("STATUS:ID", TagValue::Int(7));
        store.set(&enabled_key("STATUS"), TagValue::Bool(false));

        assert_eq!(store.get("STATUS:ID"), Some(TagValue::Int(7)));
        assert!(store.contains("STATUS:enabled"));
        assert_eq!(store.keys(), vec!["STATUS:ID", "STATUS:enabled"]);

        assert_eq!(store.remove("STATUS:ID"), Some(TagValue::Int(7)));
        assert_eq!(store.get("STATUS:ID"), None);
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(TagValue::Int(1).as_bool(), Some(true));
        assert_eq!(TagValue::Bool(true).as_int(), Some(1));
        assert_eq!(TagValue::Int(3).as_real(), Some(3.0));
        assert_eq!(TagValue::Text("x".into()).as_bool(), None);
        assert_eq!(
            TagValue::TextList(vec!["a (1)".into(), "b (2)".into()]).to_string(),
            "a (1),b (2)"
        );
    }

    #[test]
    fn test_untagged_deserialize() {
        let v: TagValue = serde_yaml::from_str("true").unwrap();
        assert_eq!(v, TagValue::Bool(true));
        let v: TagValue = serde_yaml::from_str("42").unwrap();
        assert_eq!(v, TagValue::Int(42));
        let v: TagValue = serde_yaml::from_str("1.5").unwrap();
        assert_eq!(v, TagValue::Real(1.5));
    }
}
