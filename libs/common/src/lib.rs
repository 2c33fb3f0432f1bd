//! plcsrv shared library
//!
//! Logging bootstrap and shutdown signal handling used by the service binaries.

pub mod logging;
pub mod shutdown;

pub use shutdown::{wait_for_shutdown, ShutdownSignal};
