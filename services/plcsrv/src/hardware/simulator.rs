//! In-memory controller
//!
//! Serves simulation mode and tests. Tag blocks live in memory, connection
//! numbers are handed out sequentially and faults can be scripted per method.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{PlcDriver, PlcMethod};
use crate::error::{PlcError, Result};

#[derive(Debug, Default)]
struct SimState {
    next_connection: i32,
    connections: HashMap<i32, String>,
    blocks: HashMap<String, Vec<u8>>,
    calls: HashMap<PlcMethod, u64>,
    one_shot: HashMap<PlcMethod, VecDeque<PlcError>>,
    persistent: HashMap<PlcMethod, PlcError>,
    latency: Duration,
}

impl SimState {
    /// Count the call and pop any scripted fault for it
    fn begin(&mut self, method: PlcMethod) -> Result<()> {
        *self.calls.entry(method).or_default() += 1;
        if let Some(err) = self.one_shot.get_mut(&method).and_then(VecDeque::pop_front) {
            return Err(err);
        }
        match self.persistent.get(&method) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn check_connection(&self, connection: i32, tag_name: &str) -> Result<()> {
        match self.connections.get(&connection) {
            Some(owner) if owner == tag_name => Ok(()),
            Some(owner) => Err(PlcError::not_handled(format!(
                "connection {} belongs to '{}', not '{}'",
                connection, owner, tag_name
            ))),
            None => Err(PlcError::connect(format!(
                "connection {} is not open",
                connection
            ))),
        }
    }
}

/// Cloneable simulated controller; clones share state
#[derive(Debug, Clone, Default)]
pub struct SimulatedPlc {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedPlc {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the block a read of `tag_name` returns
    pub fn set_block(&self, tag_name: &str, data: Vec<u8>) {
        self.inner.lock().blocks.insert(tag_name.to_string(), data);
    }

    /// Last block written to (or seeded for) `tag_name`
    pub fn block(&self, tag_name: &str) -> Option<Vec<u8>> {
        self.inner.lock().blocks.get(tag_name).cloned()
    }

    /// Fail the next call of `method` with `err`; queued faults fire in order
    pub fn fail_next(&self, method: PlcMethod, err: PlcError) {
        self.inner
            .lock()
            .one_shot
            .entry(method)
            .or_default()
            .push_back(err);
    }

    /// Fail every call of `method` until cleared
    pub fn fail_always(&self, method: PlcMethod, err: PlcError) {
        self.inner.lock().persistent.insert(method, err);
    }

    pub fn clear_faults(&self) {
        let mut state = self.inner.lock();
        state.one_shot.clear();
        state.persistent.clear();
    }

    /// Artificial service time added to every call
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    pub fn call_count(&self, method: PlcMethod) -> u64 {
        self.inner.lock().calls.get(&method).copied().unwrap_or(0)
    }

    pub fn open_connections(&self) -> usize {
        self.inner.lock().connections.len()
    }

    async fn delay(&self) {
        let latency = self.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl PlcDriver for SimulatedPlc {
    async fn open(&mut self, tag_name: &str, address: &str) -> Result<i32> {
        self.delay().await;
        let mut state = self.inner.lock();
        state.begin(PlcMethod::Open)?;

        state.next_connection += 1;
        let connection = state.next_connection;
        state.connections.insert(connection, tag_name.to_string());
        debug!(target: "plcio", "sim open '{}' @ '{}' -> ch#{}", tag_name, address, connection);
        Ok(connection)
    }

    async fn close(&mut self, connection: i32, tag_name: &str) -> Result<()> {
        self.delay().await;
        let mut state = self.inner.lock();
        state.begin(PlcMethod::Close)?;
        state.check_connection(connection, tag_name)?;
        state.connections.remove(&connection);
        debug!(target: "plcio", "sim close '{}' ch#{}", tag_name, connection);
        Ok(())
    }

    async fn read(&mut self, connection: i32, tag_name: &str, buf: &mut [u8]) -> Result<()> {
        self.delay().await;
        let mut state = self.inner.lock();
        state.begin(PlcMethod::Read)?;
        state.check_connection(connection, tag_name)?;

        buf.fill(0);
        if let Some(block) = state.blocks.get(tag_name) {
            let n = block.len().min(buf.len());
            buf[..n].copy_from_slice(&block[..n]);
        }
        Ok(())
    }

    async fn write(&mut self, connection: i32, tag_name: &str, data: &[u8]) -> Result<()> {
        self.delay().await;
        let mut state = self.inner.lock();
        state.begin(PlcMethod::Write)?;
        state.check_connection(connection, tag_name)?;
        state.blocks.insert(tag_name.to_string(), data.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "simulator"
    }
}
