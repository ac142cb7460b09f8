use crate::protocol::Command;
use crate::types::{Axis, ExecutionStatus};
use std::time::Duration;
use thiserror::Error;

/// Malformed or corrupt frame on the wire.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Short message: expected {expected} bytes, got {actual}")]
    ShortMessage { expected: usize, actual: usize },
    #[error("Checksum mismatch: frame carries {received:#04x}, computed {computed:#04x}")]
    ChecksumMismatch { received: u8, computed: u8 },
    #[error("Unknown execution status code: {0}")]
    UnknownStatusCode(u8),
    #[error("Unknown command code: {0}")]
    UnknownCommandCode(u8),
}

impl ProtocolError {
    /// Whether the frame was damaged in transit rather than semantically wrong
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            ProtocolError::ChecksumMismatch { .. } | ProtocolError::ShortMessage { .. }
        )
    }
}

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("IO error: {context}: {source}")]
    Io {
        #[source]
        source: std::io::Error,
        context: String,
    },
    #[error("Protocol error after {attempts} attempt(s) while executing {command:?}: {source}")]
    Protocol {
        command: Command,
        attempts: usize,
        #[source]
        source: ProtocolError,
    },
    #[error("Device rejected {command:?} (axis {axis:?}): {status:?} (raw status {})", .status.code())]
    DeviceExecution {
        command: Command,
        axis: Option<Axis>,
        status: ExecutionStatus,
    },
    #[error("No terminal status for {command:?} within {waited:?}")]
    Timeout { command: Command, waited: Duration },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
    #[error("Device link busy: {in_flight:?} is still outstanding")]
    LinkBusy { in_flight: Command },
    #[error("No command outstanding on the device link")]
    NothingOutstanding,
    #[error("Collaborator error: {0}")]
    Collaborator(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<std::io::Error> for ScopeError {
    fn from(source: std::io::Error) -> Self {
        ScopeError::Io {
            source,
            context: "transport".to_string(),
        }
    }
}

impl ScopeError {
    /// Device and protocol failures that should end an acquisition run.
    pub fn is_device_fault(&self) -> bool {
        matches!(
            self,
            ScopeError::Io { .. }
                | ScopeError::Protocol { .. }
                | ScopeError::DeviceExecution { .. }
                | ScopeError::Timeout { .. }
        )
    }
}
