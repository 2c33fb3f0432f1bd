//! Hardware access point
//!
//! Every controller call from every channel goes through one [`PlcAccess`],
//! which serializes calls onto the configured [`PlcDriver`] and records how
//! long each call queued and how long the driver took.

pub mod simulator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::trace;

use crate::error::{PlcError, Result};

pub use simulator::SimulatedPlc;

/// Handle value of a channel with no connection
pub const CLOSED: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum PlcMethod {
    Open,
    Close,
    Read,
    Write,
}

impl std::fmt::Display for PlcMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PlcMethod::Open => "OPEN",
            PlcMethod::Close => "CLOSE",
            PlcMethod::Read => "READ",
            PlcMethod::Write => "WRITE",
        };
        f.write_str(s)
    }
}

/// Timing of the most recent call
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CallTiming {
    /// Wall-clock time the call was issued
    pub call_time: Option<DateTime<Utc>>,
    /// Time spent queued behind other channels
    pub wait_time: Duration,
    /// Time the driver spent on the call
    pub op_time: Duration,
}

/// Request/response descriptor for one hardware call
///
/// The access point fills in the assigned connection number (on open), the
/// read data and the timing fields. A descriptor can be reused across calls.
#[derive(Debug, Clone)]
pub struct PlcCall {
    pub method: PlcMethod,
    pub connection: i32,
    pub tag_name: String,
    pub address: Option<String>,
    pub data: Vec<u8>,
    pub timing: CallTiming,
}

impl PlcCall {
    pub fn open(tag_name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            method: PlcMethod::Open,
            connection: CLOSED,
            tag_name: tag_name.into(),
            address: Some(address.into()),
            data: Vec::new(),
            timing: CallTiming::default(),
        }
    }

    pub fn close(tag_name: impl Into<String>, connection: i32) -> Self {
        Self {
            method: PlcMethod::Close,
            connection,
            tag_name: tag_name.into(),
            address: None,
            data: Vec::new(),
            timing: CallTiming::default(),
        }
    }

    /// Read of `len` bytes; `data` holds the block afterwards
    pub fn read(tag_name: impl Into<String>, connection: i32, len: usize) -> Self {
        Self {
            method: PlcMethod::Read,
            connection,
            tag_name: tag_name.into(),
            address: None,
            data: vec![0; len],
            timing: CallTiming::default(),
        }
    }

    pub fn write(tag_name: impl Into<String>, connection: i32, data: Vec<u8>) -> Self {
        Self {
            method: PlcMethod::Write,
            connection,
            tag_name: tag_name.into(),
            address: None,
            data,
            timing: CallTiming::default(),
        }
    }
}

/// Controller driver behind the access point
///
/// Implementations report failures as classified [`PlcError::Plcio`] values
/// whenever the controller interface can tell what went wrong.
#[async_trait]
pub trait PlcDriver: Send + Sync {
    /// Open a connection for `tag_name`, returning its connection number
    async fn open(&mut self, tag_name: &str, address: &str) -> Result<i32>;

    async fn close(&mut self, connection: i32, tag_name: &str) -> Result<()>;

    /// Fill `buf` with the tag's current block
    async fn read(&mut self, connection: i32, tag_name: &str, buf: &mut [u8]) -> Result<()>;

    async fn write(&mut self, connection: i32, tag_name: &str, data: &[u8]) -> Result<()>;

    fn name(&self) -> &str {
        "plc"
    }
}

/// Serialized entry point shared by all channels
pub struct PlcAccess {
    driver: Mutex<Box<dyn PlcDriver>>,
    calls: AtomicU64,
}

impl std::fmt::Debug for PlcAccess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlcAccess")
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

impl PlcAccess {
    pub fn new(driver: impl PlcDriver + 'static) -> Self {
        Self::from_boxed(Box::new(driver))
    }

    pub fn from_boxed(driver: Box<dyn PlcDriver>) -> Self {
        Self {
            driver: Mutex::new(driver),
            calls: AtomicU64::new(0),
        }
    }

    /// Total calls issued through this access point
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    /// Execute one call, updating the descriptor in place
    pub async fn plc_access(&self, call: &mut PlcCall) -> Result<()> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        call.timing.call_time = Some(Utc::now());

        let queued = Instant::now();
        let mut driver = self.driver.lock().await;
        call.timing.wait_time = queued.elapsed();

        let started = Instant::now();
        let result = match call.method {
            PlcMethod::Open => match call.address.as_deref() {
                Some(address) => driver
                    .open(&call.tag_name, address)
                    .await
                    .map(|connection| call.connection = connection),
                None => Err(PlcError::invalid_argument(format!(
                    "open of '{}' without an address",
                    call.tag_name
                ))),
            },
            PlcMethod::Close => driver.close(call.connection, &call.tag_name).await,
            PlcMethod::Read => {
                driver
                    .read(call.connection, &call.tag_name, &mut call.data)
                    .await
            },
            PlcMethod::Write => {
                driver
                    .write(call.connection, &call.tag_name, &call.data)
                    .await
            },
        };
        call.timing.op_time = started.elapsed();
        drop(driver);

        trace!(
            target: "plcio",
            method = %call.method,
            tag = %call.tag_name,
            connection = call.connection,
            wait_us = call.timing.wait_time.as_micros() as u64,
            op_us = call.timing.op_time.as_micros() as u64,
            ok = result.is_ok(),
            "plc_access"
        );
        result
    }
}
