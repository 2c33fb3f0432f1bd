//! PLC tag service
//!
//! Connects named tags to an interlock controller, reads the status tag in
//! the background, recovers from hardware faults and publishes everything it
//! reads into a shared value store.

pub mod channel;
pub mod config;
pub mod error;
pub mod gis;
pub mod hardware;
pub mod health;
pub mod lifecycle;
pub mod poller;
pub mod reconnect;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod tag;

pub use config::PlcConfig;
pub use error::{PlcError, PlcioErrorKind, Result};
pub use gis::{GisStatusView, InterlockGroup};
pub use hardware::{PlcAccess, PlcDriver, SimulatedPlc};
pub use health::{HealthReporter, TracingHealthReporter};
pub use registry::ConnectionRegistry;
pub use store::{MemoryStore, TagValue, ValueStore};
