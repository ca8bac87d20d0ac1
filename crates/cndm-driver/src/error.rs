//! Error types for cndm driver operations

use std::time::Duration;

use cndm_chip::cmd::{Opcode, UnknownOpcode};
use thiserror::Error;

/// Result type alias for cndm operations
pub type Result<T> = std::result::Result<T, CndmError>;

/// Errors that can occur during cndm operations
#[derive(Debug, Error)]
pub enum CndmError {
    /// Raw command longer than the 64-byte mailbox
    #[error("Command is {len} bytes, mailbox holds 64")]
    InvalidCommandLength {
        /// Length of the rejected command
        len: usize,
    },

    /// Raw command carries an opcode outside the closed set
    #[error("Unknown mailbox opcode {opcode:#06x}")]
    UnknownOpcode {
        /// Raw opcode field
        opcode: u16,
    },

    /// Packet buffer was not allocated by this allocator
    #[error("Packet buffer {addr:#x} does not belong to this allocator")]
    InvalidHandle {
        /// Device address of the rejected buffer
        addr: u64,
    },

    /// Mailbox stayed busy past the poll budget
    #[error("Device did not complete {opcode} after {polls} polls")]
    DeviceTimeout {
        /// Command that was in flight
        opcode: Opcode,
        /// Busy reads observed
        polls: u32,
    },

    /// Device completed a command with a non-zero status
    #[error("{opcode} failed with status {status:#06x}")]
    CommandFailed {
        /// Command that failed
        opcode: Opcode,
        /// Status word from the response
        status: u16,
    },

    /// TX ring full even after reclaiming completions
    #[error("Port {port} TX ring full ({capacity} entries outstanding)")]
    QueueFull {
        /// Port index
        port: u32,
        /// Ring capacity
        capacity: u32,
    },

    /// No received payload is queued
    #[error("No payload available")]
    WouldBlock,

    /// Operation timeout
    #[error("Operation timeout after {duration_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        duration_ms: u64,
    },

    /// Payload does not fit one packet buffer after headroom
    #[error("Payload of {len} bytes exceeds {max} usable bytes per buffer")]
    PayloadTooLarge {
        /// Payload length
        len: usize,
        /// Usable bytes per buffer
        max: usize,
    },

    /// Zero-length payload
    #[error("Empty payload")]
    EmptyPayload,

    /// Port index out of range
    #[error("Port {index} out of range (have {count} ports)")]
    InvalidPort {
        /// Requested index
        index: usize,
        /// Number of ports
        count: usize,
    },

    /// Rejected configuration
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What is wrong
        reason: String,
    },

    /// Port has been shut down or its receive channel closed
    #[error("Port {port} is shut down")]
    Disconnected {
        /// Port index
        port: u32,
    },

    /// DMA memory could not be allocated or mapped
    #[error("DMA allocation failed: {reason}")]
    DmaFailed {
        /// Reason for failure
        reason: String,
    },

    /// Device configuration registers could not be read
    #[error("Failed to query device capabilities: {reason}")]
    CapabilityQueryFailed {
        /// Reason for failure
        reason: String,
    },

    /// Hardware-level error from device
    #[error("Hardware error: {reason}")]
    HardwareError {
        /// Reason for failure
        reason: String,
    },

    /// I/O error during device communication
    #[error("I/O error: {source}")]
    Io {
        /// Underlying I/O error
        #[from]
        source: std::io::Error,
    },
}

impl CndmError {
    /// Create a DMA failure error
    pub fn dma_failed(reason: impl Into<String>) -> Self {
        Self::DmaFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Create a capability query failed error
    pub fn capability_query_failed(reason: impl Into<String>) -> Self {
        Self::CapabilityQueryFailed {
            reason: reason.into(),
        }
    }

    /// Create a hardware error
    pub fn hardware_error(reason: impl Into<String>) -> Self {
        Self::HardwareError {
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    #[allow(clippy::cast_possible_truncation)]
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            duration_ms: duration.as_millis() as u64,
        }
    }
}

impl From<UnknownOpcode> for CndmError {
    fn from(err: UnknownOpcode) -> Self {
        Self::UnknownOpcode { opcode: err.0 }
    }
}

impl From<rustix::io::Errno> for CndmError {
    fn from(errno: rustix::io::Errno) -> Self {
        Self::Io {
            source: errno.into(),
        }
    }
}
