//! Error recovery
//!
//! Pollers and reconnect supervisors hand hardware faults to the
//! [`ErrorRecoveryCoordinator`], which tears the tag's channel down on its own
//! task and, for connect or timeout faults on a polled tag, starts a new
//! reconnect supervisor.

use std::sync::Weak;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{PlcError, PlcioErrorKind, Result};
use crate::registry::ConnectionRegistry;

#[derive(Debug, Clone)]
pub struct ErrorRecoveryCoordinator {
    registry: Weak<ConnectionRegistry>,
}

impl ErrorRecoveryCoordinator {
    pub fn new(registry: Weak<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Start recovery for `tag_name` on a new task and return immediately
    pub fn interrupt(&self, tag_name: &str, err: PlcError) -> JoinHandle<Result<()>> {
        let coordinator = self.clone();
        let tag_name = tag_name.to_string();
        tokio::spawn(async move { coordinator.recover(&tag_name, err).await })
    }

    /// Tear down and optionally restart reading of `tag_name` after `err`
    pub async fn recover(&self, tag_name: &str, err: PlcError) -> Result<()> {
        let Some(registry) = self.registry.upgrade() else {
            debug!("Recovery for {} skipped, registry is gone", tag_name);
            return Ok(());
        };

        let channel = registry.channel(tag_name).ok();
        warn!(
            "Recovering {} after hardware error on {}: {}",
            tag_name,
            channel
                .as_ref()
                .map_or_else(|| "no channel".to_string(), |c| c.to_string()),
            err
        );

        if let Some(channel) = channel.filter(|c| c.is_connected()) {
            registry.update_connection_status(tag_name, false);
            if let Err(close_err) = channel.close().await {
                if close_err.is_connect() {
                    debug!("Recovery close of {} failed as expected: {}", tag_name, close_err);
                } else {
                    error!(
                        "Recovery close of {} failed, giving up: {}",
                        tag_name, close_err
                    );
                    return Err(close_err);
                }
            }
        }

        let restart = match registry.remove_poller(tag_name) {
            Some(poller) => {
                poller.stop().await;
                true
            },
            None => false,
        };

        match err.plcio_kind() {
            Some(PlcioErrorKind::Connect) | Some(PlcioErrorKind::Timeout) => {
                if restart {
                    info!("Restarting reconnect supervisor for {}", tag_name);
                    registry.start_tag_reader(tag_name)?;
                } else {
                    debug!("No poller was running for {}, not restarting", tag_name);
                }
            },
            Some(kind @ (PlcioErrorKind::BadTagName | PlcioErrorKind::NotHandled)) => {
                info!(
                    "Channel for {} disconnected after {} error, no further action taken",
                    tag_name, kind
                );
            },
            None => {
                warn!("Recovery for {} got a non-hardware error: {}", tag_name, err);
            },
        }
        Ok(())
    }
}
