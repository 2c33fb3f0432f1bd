//! Shared fixtures for plcsrv integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use plcsrv::config::{ItemConfig, TagConfig};
use plcsrv::tag::TagDirection;
use plcsrv::{
    ConnectionRegistry, MemoryStore, PlcAccess, PlcConfig, SimulatedPlc, TagValue,
    TracingHealthReporter,
};

pub const STATUS: &str = "R_testCStatus";
pub const COMMAND: &str = "W_testCommand";
pub const ADDRESS: &str = "10.0.0.1";

pub struct Harness {
    pub registry: Arc<ConnectionRegistry>,
    pub sim: SimulatedPlc,
    pub store: Arc<MemoryStore>,
    pub reporter: Arc<TracingHealthReporter>,
}

pub fn item(name: &str, kind: &str, byte: usize, bit: u8) -> ItemConfig {
    ItemConfig {
        name: name.to_string(),
        kind: kind.to_string(),
        byte,
        bit,
        default: None,
    }
}

pub fn item_with_default(
    name: &str,
    kind: &str,
    byte: usize,
    bit: u8,
    default: TagValue,
) -> ItemConfig {
    ItemConfig {
        default: Some(default),
        ..item(name, kind, byte, bit)
    }
}

/// 8-byte status tag: year, a fault bit and a major error code
pub fn status_tag(interval: f64) -> TagConfig {
    TagConfig {
        direction: TagDirection::Read,
        byte_length: 8,
        interval,
        reconnect_interval: 0.5,
        items: vec![
            item("timeYear", "int", 0, 0),
            item("commFault", "boolean", 2, 0),
            item("plcErrCodeMajor", "dint", 4, 0),
        ],
        ..TagConfig::default()
    }
}

/// 12-byte command tag; `heartbeat` is the only item without a default
pub fn command_tag() -> TagConfig {
    TagConfig {
        direction: TagDirection::Write,
        byte_length: 12,
        reconnect_interval: 0.5,
        items: vec![
            item_with_default("commandId", "dint", 0, 0, TagValue::Int(0)),
            item_with_default("reset", "boolean", 4, 0, TagValue::Bool(false)),
            item("heartbeat", "boolean", 4, 1),
            item_with_default("setpoint", "real", 8, 0, TagValue::Real(0.0)),
        ],
        ..TagConfig::default()
    }
}

/// Simulated configuration holding `tags` in the given order
pub fn config(tags: Vec<(&str, TagConfig)>) -> PlcConfig {
    let mut config = PlcConfig::default();
    config.connection.simulated = true;
    config.connection.address = Some(ADDRESS.to_string());
    for (name, tag) in tags {
        config.tag_list.push(name.to_string());
        config.tags.insert(name.to_string(), tag);
    }
    config
}

pub fn harness(config: PlcConfig) -> Harness {
    let sim = SimulatedPlc::new();
    let store = Arc::new(MemoryStore::new());
    let reporter = Arc::new(TracingHealthReporter::new());
    let registry = ConnectionRegistry::new(
        config,
        Arc::new(PlcAccess::new(sim.clone())),
        store.clone(),
        reporter.clone(),
    );
    Harness {
        registry,
        sim,
        store,
        reporter,
    }
}

/// Harness already connected with the status and command tags
pub async fn connected(status_interval: f64) -> Harness {
    let h = harness(config(vec![
        (STATUS, status_tag(status_interval)),
        (COMMAND, command_tag()),
    ]));
    h.registry.connect(&[ADDRESS]).await.unwrap();
    h
}

/// Poll `cond` every 10ms until it holds or `limit` passes
pub async fn wait_for(limit: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
