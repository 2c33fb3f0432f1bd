//! Per-tag logical connection
//!
//! A [`Channel`] owns the connection number and bound address of one tag. The
//! state lock is never held across a hardware call: the call runs on a
//! descriptor and its outcome is committed afterwards.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{PlcError, Result};
use crate::hardware::{CallTiming, PlcAccess, PlcCall, CLOSED};
use crate::health::HealthLatch;
use crate::tag::Tag;

#[derive(Debug)]
struct ChannelState {
    connection: i32,
    address: Option<String>,
    timing: CallTiming,
}

pub struct Channel {
    tag_name: String,
    access: Arc<PlcAccess>,
    health: Arc<HealthLatch>,
    state: Mutex<ChannelState>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("tag_name", &self.tag_name)
            .field("connection", &self.connection_number())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub fn new(
        tag_name: impl Into<String>,
        access: Arc<PlcAccess>,
        health: Arc<HealthLatch>,
    ) -> Self {
        Self {
            tag_name: tag_name.into(),
            access,
            health,
            state: Mutex::new(ChannelState {
                connection: CLOSED,
                address: None,
                timing: CallTiming::default(),
            }),
        }
    }

    pub fn tag_name(&self) -> &str {
        &self.tag_name
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connection >= 0
    }

    /// Connection number, or -1 when closed
    pub fn connection_number(&self) -> i32 {
        self.state.lock().connection
    }

    pub fn address(&self) -> Option<String> {
        self.state.lock().address.clone()
    }

    pub fn timing(&self) -> CallTiming {
        self.state.lock().timing
    }

    fn record(&self, what: &str, result: &Result<()>, timing: CallTiming) {
        self.state.lock().timing = timing;
        match result {
            Ok(()) => {
                self.health
                    .record_success(&format!("{} '{}' ok", what, self.tag_name));
            },
            Err(e) => {
                self.health
                    .record_failure(&format!("{} '{}' failed: {}", what, self.tag_name, e));
            },
        }
    }

    /// Open a connection; state is untouched on failure
    pub async fn open(&self, address: &str) -> Result<()> {
        let mut call = PlcCall::open(self.tag_name.as_str(), address);
        let result = self.access.plc_access(&mut call).await;
        self.record("open", &result, call.timing);
        result?;

        let mut state = self.state.lock();
        state.connection = call.connection;
        state.address = Some(address.to_string());
        debug!("Ch {} opened (ch#{})", self.tag_name, call.connection);
        Ok(())
    }

    /// Close the connection
    ///
    /// The handle is reset even when the hardware close fails; the failure is
    /// still returned.
    pub async fn close(&self) -> Result<()> {
        let connection = {
            let mut state = self.state.lock();
            if state.connection < 0 {
                state.timing = CallTiming::default();
                drop(state);
                warn!("Ch {} close: not connected", self.tag_name);
                return Ok(());
            }
            state.connection
        };

        let mut call = PlcCall::close(self.tag_name.as_str(), connection);
        let result = self.access.plc_access(&mut call).await;
        self.record("close", &result, call.timing);
        {
            let mut state = self.state.lock();
            state.connection = CLOSED;
            state.address = None;
        }
        debug!("Ch {} closed (ch#{})", self.tag_name, connection);
        result
    }

    fn require_open(&self) -> Result<i32> {
        let connection = self.connection_number();
        if connection < 0 {
            return Err(PlcError::invalid_state(format!(
                "channel '{}' is not open",
                self.tag_name
            )));
        }
        Ok(connection)
    }

    /// Run a caller-owned descriptor on this channel's connection
    ///
    /// The descriptor's connection number is refreshed before the call, so a
    /// descriptor built once can be reused for the life of the channel.
    pub async fn generic_call(&self, call: &mut PlcCall) -> Result<()> {
        call.connection = self.require_open()?;
        let result = self.access.plc_access(call).await;
        self.record(&call.method.to_string().to_lowercase(), &result, call.timing);
        result
    }

    /// Read the tag's block and decode it into the tag
    pub async fn read(&self, tag: &Tag) -> Result<()> {
        let mut call = PlcCall::read(self.tag_name.as_str(), CLOSED, tag.byte_length());
        self.generic_call(&mut call).await?;
        tag.decode(&call.data)
    }

    /// Encode the tag and send its block
    pub async fn write(&self, tag: &Tag) -> Result<()> {
        let block = tag.encode()?;
        let mut call = PlcCall::write(self.tag_name.as_str(), CLOSED, block);
        self.generic_call(&mut call).await
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        match (&state.address, state.connection >= 0) {
            (Some(address), true) => write!(
                f,
                "Channel '{}' connected to '{}' (ch#{})",
                self.tag_name, address, state.connection
            ),
            _ => write!(f, "Channel '{}' connection is closed", self.tag_name),
        }
    }
}
