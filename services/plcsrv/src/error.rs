//! Error handling for the PLC tag service
//!
//! Hardware faults carry an explicit [`PlcioErrorKind`] so callers classify them
//! by value. Everything else is a plain message variant in the comsrv style.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification reported by the hardware-access layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlcioErrorKind {
    /// Controller unreachable or link lost
    Connect,
    /// Controller did not answer in time
    Timeout,
    /// Controller does not know the tag
    BadTagName,
    /// Any other condition the controller interface reports but does not handle
    NotHandled,
}

impl PlcioErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlcioErrorKind::Connect => "connect",
            PlcioErrorKind::Timeout => "timeout",
            PlcioErrorKind::BadTagName => "bad tag name",
            PlcioErrorKind::NotHandled => "not handled",
        }
    }
}

impl std::fmt::Display for PlcioErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse error taxonomy used to pick between retry, recovery and termination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried indefinitely, never surfaced
    Connect,
    /// Alarm raised, operation continues
    Timeout,
    /// Routed to error recovery
    Protocol,
    /// Unexpected, fatal for the owning task
    Transport,
    /// Bad metadata, fails setup
    Configuration,
}

/// PLC service error type
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlcError {
    /// Classified fault from the hardware-access layer
    #[error("PLCIO {kind} error: {message}")]
    Plcio {
        kind: PlcioErrorKind,
        message: String,
    },

    /// Unclassified hardware or driver failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller supplied something unusable
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Tag is not configured on this connection
    #[error("Unknown tag: {0}")]
    UnknownTag(String),

    /// Operation not allowed in the current connection state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Raw block could not be packed or unpacked
    #[error("Codec error: {0}")]
    Codec(String),

    /// Background task failed or panicked
    #[error("Task error: {0}")]
    Task(String),
}

/// Result type alias for the PLC service
pub type Result<T> = std::result::Result<T, PlcError>;

impl PlcError {
    pub fn plcio(kind: PlcioErrorKind, msg: impl Into<String>) -> Self {
        PlcError::Plcio {
            kind,
            message: msg.into(),
        }
    }

    pub fn connect(msg: impl Into<String>) -> Self {
        Self::plcio(PlcioErrorKind::Connect, msg)
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::plcio(PlcioErrorKind::Timeout, msg)
    }

    pub fn bad_tag_name(msg: impl Into<String>) -> Self {
        Self::plcio(PlcioErrorKind::BadTagName, msg)
    }

    pub fn not_handled(msg: impl Into<String>) -> Self {
        Self::plcio(PlcioErrorKind::NotHandled, msg)
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        PlcError::Transport(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        PlcError::Config(msg.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        PlcError::InvalidArgument(msg.into())
    }

    pub fn unknown_tag(name: impl std::fmt::Display) -> Self {
        PlcError::UnknownTag(name.to_string())
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        PlcError::InvalidState(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        PlcError::Codec(msg.into())
    }

    pub fn task(msg: impl Into<String>) -> Self {
        PlcError::Task(msg.into())
    }

    /// Hardware classification, if this error came from the controller interface
    pub fn plcio_kind(&self) -> Option<PlcioErrorKind> {
        match self {
            PlcError::Plcio { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_hardware(&self) -> bool {
        self.plcio_kind().is_some()
    }

    pub fn is_connect(&self) -> bool {
        self.plcio_kind() == Some(PlcioErrorKind::Connect)
    }

    pub fn is_timeout(&self) -> bool {
        self.plcio_kind() == Some(PlcioErrorKind::Timeout)
    }

    /// Map onto the retry/recover/terminate taxonomy
    pub fn class(&self) -> ErrorClass {
        match self {
            PlcError::Plcio { kind, .. } => match kind {
                PlcioErrorKind::Connect => ErrorClass::Connect,
                PlcioErrorKind::Timeout => ErrorClass::Timeout,
                PlcioErrorKind::BadTagName | PlcioErrorKind::NotHandled => ErrorClass::Protocol,
            },
            PlcError::Config(_) => ErrorClass::Configuration,
            _ => ErrorClass::Transport,
        }
    }

    /// Same error with extra context prepended, keeping its classification
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        match self {
            PlcError::Plcio { kind, message } => PlcError::Plcio {
                kind,
                message: format!("{}: {}", ctx, message),
            },
            PlcError::Transport(m) => PlcError::Transport(format!("{}: {}", ctx, m)),
            PlcError::Config(m) => PlcError::Config(format!("{}: {}", ctx, m)),
            PlcError::InvalidArgument(m) => PlcError::InvalidArgument(format!("{}: {}", ctx, m)),
            PlcError::UnknownTag(m) => PlcError::UnknownTag(m),
            PlcError::InvalidState(m) => PlcError::InvalidState(format!("{}: {}", ctx, m)),
            PlcError::Codec(m) => PlcError::Codec(format!("{}: {}", ctx, m)),
            PlcError::Task(m) => PlcError::Task(format!("{}: {}", ctx, m)),
        }
    }
}

impl From<figment::Error> for PlcError {
    fn from(err: figment::Error) -> Self {
        PlcError::Config(err.to_string())
    }
}

impl From<tokio::task::JoinError> for PlcError {
    fn from(err: tokio::task::JoinError) -> Self {
        PlcError::Task(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_is_carried_by_value() {
        let err = PlcError::timeout("no reply from R_gisCStatus");
        assert_eq!(err.plcio_kind(), Some(PlcioErrorKind::Timeout));
        assert!(err.is_hardware());
        assert!(!err.is_connect());
        assert_eq!(err.class(), ErrorClass::Timeout);
    }

    #[test]
    fn test_classification() {
        assert_eq!(PlcError::connect("x").class(), ErrorClass::Connect);
        assert_eq!(PlcError::bad_tag_name("x").class(), ErrorClass::Protocol);
        assert_eq!(PlcError::not_handled("x").class(), ErrorClass::Protocol);
        assert_eq!(PlcError::transport("x").class(), ErrorClass::Transport);
        assert_eq!(PlcError::config("x").class(), ErrorClass::Configuration);
        assert!(!PlcError::transport("x").is_hardware());
    }

    #[test]
    fn test_context_keeps_kind() {
        let err = PlcError::connect("refused").context("open 'STATUS'");
        assert!(err.is_connect());
        assert_eq!(err.to_string(), "PLCIO connect error: open 'STATUS': refused");
    }
}
