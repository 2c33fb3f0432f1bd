//! Tag data model
//!
//! A [`Tag`] is a named block of controller memory with a fixed layout of
//! typed [`TagItem`]s. The layout is built and validated once from
//! configuration; afterwards only the item values and the raw block change.

pub mod codec;
pub mod item;

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::TagConfig;
use crate::error::{PlcError, Result};
use crate::store::{TagValue, ValueStore};

pub use codec::{decode_item, encode_item};
pub use item::{ItemKind, TagItem};

/// Store key of one item: `<tag>:<item>`
pub fn attribute_name(tag: &str, item: &str) -> String {
    format!("{}:{}", tag, item)
}

/// Tag part of an attribute name, everything before the first ':'
pub fn tag_name_of(attribute: &str) -> &str {
    attribute
        .split_once(':')
        .map_or(attribute, |(tag, _)| tag)
}

/// Item part of an attribute name, if any
pub fn item_name_of(attribute: &str) -> Option<&str> {
    attribute.split_once(':').map(|(_, item)| item)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDirection {
    Read,
    Write,
}

impl std::fmt::Display for TagDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagDirection::Read => f.write_str("read"),
            TagDirection::Write => f.write_str("write"),
        }
    }
}

#[derive(Debug)]
struct TagState {
    raw: Vec<u8>,
    values: Vec<Option<TagValue>>,
    item_updated: Vec<Option<DateTime<Utc>>>,
    last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Occupancy {
    Free,
    Bits(u8),
    Whole,
}

/// Named block of controller memory
#[derive(Debug)]
pub struct Tag {
    name: String,
    direction: TagDirection,
    byte_length: usize,
    items: Vec<TagItem>,
    index: HashMap<String, usize>,
    interval: Duration,
    reconnect_interval: Duration,
    timeout_ms: u64,
    enabled: Option<bool>,
    state: RwLock<TagState>,
}

impl Tag {
    /// Build and validate a tag from its configured metadata
    pub fn from_config(name: &str, config: &TagConfig) -> Result<Self> {
        if name.is_empty() {
            return Err(PlcError::config("tag name must not be empty"));
        }
        let interval = seconds(name, "interval", config.interval)?;
        let reconnect_interval = seconds(name, "reconnect_interval", config.reconnect_interval)?;

        let mut items = Vec::with_capacity(config.items.len());
        for (member, item) in config.items.iter().enumerate() {
            let kind: ItemKind = item
                .kind
                .parse()
                .map_err(|e: PlcError| e.context(format!("tag '{}' item '{}'", name, item.name)))?;
            let built = TagItem::new(
                item.name.clone(),
                kind,
                member,
                item.byte,
                item.bit,
                item.default.clone(),
            )
            .map_err(|e| e.context(format!("tag '{}'", name)))?;
            items.push(built);
        }

        Self::new(
            name,
            config.direction,
            config.byte_length,
            items,
            interval,
            reconnect_interval,
            config.timeout_ms,
            config.enabled,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn new(
        name: &str,
        direction: TagDirection,
        byte_length: usize,
        items: Vec<TagItem>,
        interval: Duration,
        reconnect_interval: Duration,
        timeout_ms: u64,
        enabled: Option<bool>,
    ) -> Result<Self> {
        if items.is_empty() {
            return Err(PlcError::config(format!("tag '{}' has no items", name)));
        }

        let mut index = HashMap::with_capacity(items.len());
        for (i, item) in items.iter().enumerate() {
            if index.insert(item.name().to_string(), i).is_some() {
                return Err(PlcError::config(format!(
                    "tag '{}' declares item '{}' twice",
                    name,
                    item.name()
                )));
            }
        }
        validate_layout(name, byte_length, &items)?;

        let count = items.len();
        Ok(Self {
            name: name.to_string(),
            direction,
            byte_length,
            items,
            index,
            interval,
            reconnect_interval,
            timeout_ms,
            enabled,
            state: RwLock::new(TagState {
                raw: vec![0; byte_length],
                values: vec![None; count],
                item_updated: vec![None; count],
                last_update: None,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> TagDirection {
        self.direction
    }

    pub fn is_read(&self) -> bool {
        self.direction == TagDirection::Read
    }

    pub fn is_write(&self) -> bool {
        self.direction == TagDirection::Write
    }

    pub fn byte_length(&self) -> usize {
        self.byte_length
    }

    pub fn items(&self) -> &[TagItem] {
        &self.items
    }

    pub fn item(&self, name: &str) -> Option<&TagItem> {
        self.index.get(name).map(|&i| &self.items[i])
    }

    pub fn has_item(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn reconnect_interval(&self) -> Duration {
        self.reconnect_interval
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// Configured enabled flag; `None` means always enabled
    pub fn enabled(&self) -> Option<bool> {
        self.enabled
    }

    pub fn attribute_name(&self, item: &str) -> String {
        attribute_name(&self.name, item)
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_update
    }

    pub fn item_updated(&self, item: &str) -> Option<DateTime<Utc>> {
        let i = *self.index.get(item)?;
        self.state.read().item_updated[i]
    }

    pub fn value(&self, item: &str) -> Option<TagValue> {
        let i = *self.index.get(item)?;
        self.state.read().values[i].clone()
    }

    /// Current values keyed by attribute name, in item order, skipping unset items
    pub fn values(&self) -> Vec<(String, TagValue)> {
        let state = self.state.read();
        self.items
            .iter()
            .zip(state.values.iter())
            .filter_map(|(item, value)| {
                value
                    .as_ref()
                    .map(|v| (self.attribute_name(item.name()), v.clone()))
            })
            .collect()
    }

    /// Range-checked update of one item's in-memory value
    pub fn set_value(&self, item: &str, value: TagValue) -> Result<()> {
        let i = *self
            .index
            .get(item)
            .ok_or_else(|| PlcError::unknown_tag(attribute_name(&self.name, item)))?;
        let value = self.items[i].check_value(&value)?;
        let now = Utc::now();
        let mut state = self.state.write();
        state.values[i] = Some(value);
        state.item_updated[i] = Some(now);
        state.last_update = Some(now);
        Ok(())
    }

    /// Unpack a raw block into item values and stamp the update time
    pub fn decode(&self, block: &[u8]) -> Result<()> {
        if block.len() != self.byte_length {
            return Err(PlcError::codec(format!(
                "tag '{}' expects {} bytes, got {}",
                self.name,
                self.byte_length,
                block.len()
            )));
        }
        let decoded = self
            .items
            .iter()
            .map(|item| decode_item(item, block))
            .collect::<Result<Vec<_>>>()?;

        let now = Utc::now();
        let mut state = self.state.write();
        state.raw.clear();
        state.raw.extend_from_slice(block);
        for (i, value) in decoded.into_iter().enumerate() {
            state.values[i] = Some(value);
            state.item_updated[i] = Some(now);
        }
        state.last_update = Some(now);
        Ok(())
    }

    /// Pack item values over the last raw block
    ///
    /// Items without a value keep whatever bytes the block already had.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let state = self.state.read();
        let mut block = state.raw.clone();
        for (item, value) in self.items.iter().zip(state.values.iter()) {
            if let Some(value) = value {
                encode_item(item, value, &mut block)?;
            }
        }
        Ok(block)
    }

    /// Push every known item value into the store
    pub fn publish(&self, store: &dyn ValueStore) {
        let values = self.values();
        debug!("Tag {} publish {} values", self.name, values.len());
        store.set_all(&values);
    }

    /// Pull item values from the store into memory
    ///
    /// Attributes absent from the store leave the in-memory value alone.
    pub fn refresh_from_store(&self, store: &dyn ValueStore) -> Result<()> {
        for item in &self.items {
            if let Some(value) = store.get(&self.attribute_name(item.name())) {
                self.set_value(item.name(), value)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tag '{}' ({}, {} bytes, {} items)",
            self.name,
            self.direction,
            self.byte_length,
            self.items.len()
        )
    }
}

/// Positive, representable interval in seconds
pub(crate) fn seconds(tag: &str, field: &str, secs: f64) -> Result<Duration> {
    if !(secs.is_finite() && secs > 0.0) {
        return Err(PlcError::config(format!(
            "tag '{}' {} must be positive, got {}",
            tag, field, secs
        )));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|e| PlcError::config(format!("tag '{}' {} {}: {}", tag, field, secs, e)))
}

fn validate_layout(tag: &str, byte_length: usize, items: &[TagItem]) -> Result<()> {
    let mut map = vec![Occupancy::Free; byte_length];

    for item in items {
        let range = item.footprint();
        if range.end > byte_length {
            return Err(PlcError::config(format!(
                "tag '{}' {} exceeds the {}-byte block",
                tag, item, byte_length
            )));
        }

        if item.is_boolean() {
            let bit = item.bit_mask() as u8;
            let slot = &mut map[range.start];
            *slot = match *slot {
                Occupancy::Free => Occupancy::Bits(bit),
                Occupancy::Bits(used) if used & bit == 0 => Occupancy::Bits(used | bit),
                _ => {
                    return Err(PlcError::config(format!(
                        "tag '{}' {} overlaps another item",
                        tag, item
                    )));
                },
            };
        } else {
            for slot in &mut map[range] {
                if *slot != Occupancy::Free {
                    return Err(PlcError::config(format!(
                        "tag '{}' {} overlaps another item",
                        tag, item
                    )));
                }
                *slot = Occupancy::Whole;
            }
        }
    }
    Ok(())
}
