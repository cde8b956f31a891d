use thiserror::Error;

use crate::types::SessionState;

/// Errors produced by the rig's device-control core
#[derive(Error, Debug)]
pub enum RigError {
    /// The session is not connected to a peripheral
    #[error("Device not connected")]
    NotConnected,

    /// Connecting to the peripheral failed or was refused
    #[error("Failed to connect to device: {0}")]
    ConnectError(String),

    /// The peripheral signalled an error for a control write
    #[error("Device rejected command: {reason}")]
    DeviceRejected {
        /// What the peripheral (or the transport) reported
        reason: String,
    },

    /// Operation did not complete in time
    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The bridge's background worker is gone
    #[error("Background worker terminated")]
    WorkerDied,

    /// A value fell outside its permitted closed interval
    #[error("Value {value} is out of range ({min} - {max})")]
    OutOfRange {
        /// Rejected value
        value: f64,
        /// Lower bound (inclusive)
        min: f64,
        /// Upper bound (inclusive)
        max: f64,
    },

    /// A sequence is already active
    #[error("A command sequence is already running")]
    AlreadyRunning,

    /// A sequence step could not be used
    #[error("Invalid sequence step: {0}")]
    InvalidStep(String),

    /// A mutually exclusive session operation is already in flight
    #[error("Cannot {operation} while session is {state}")]
    Busy {
        /// Rejected operation
        operation: &'static str,
        /// Session state at the time of the request
        state: SessionState,
    },

    /// The operation was cancelled before it could finish
    #[error("Operation cancelled")]
    Cancelled,

    /// A submitted operation panicked
    #[error("Operation panicked: {0}")]
    Panicked(String),

    /// A telemetry consumer failed
    #[error("Telemetry consumer error: {0}")]
    Consumer(String),

    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// CSV read/write errors
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for rig operations
pub type Result<T> = std::result::Result<T, RigError>;

impl RigError {
    /// Stable identifier for structured log entries
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotConnected => "not_connected",
            Self::ConnectError(_) => "connect_error",
            Self::DeviceRejected { .. } => "device_rejected",
            Self::Timeout { .. } => "timeout",
            Self::WorkerDied => "worker_died",
            Self::OutOfRange { .. } => "out_of_range",
            Self::AlreadyRunning => "already_running",
            Self::InvalidStep(_) => "invalid_step",
            Self::Busy { .. } => "busy",
            Self::Cancelled => "cancelled",
            Self::Panicked(_) => "panicked",
            Self::Consumer(_) => "consumer",
            Self::Protocol(_) => "protocol",
            Self::Ble(_) => "ble",
            Self::Csv(_) => "csv",
            Self::Io(_) => "io",
        }
    }

    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_) | Self::ConnectError(_) | Self::NotConnected
        )
    }

    /// Check if retrying the same request later may succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Busy { .. } | Self::DeviceRejected { .. }
        )
    }

    /// Check if this error aborts a running command sequence
    #[must_use]
    pub const fn is_fatal_to_sequence(&self) -> bool {
        matches!(
            self,
            Self::InvalidStep(_) | Self::Cancelled | Self::WorkerDied
        )
    }
}
