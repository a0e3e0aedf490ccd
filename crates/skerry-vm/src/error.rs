//! Error types for skerry-vm.

use crate::device::DeviceKind;
use crate::hypervisor::BackendKind;
use thiserror::Error;

/// Result type alias for skerry-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur during hypervisor operations.
#[derive(Debug, Error)]
pub enum VmError {
    /// The VMM process failed to start or the guest failed to boot
    #[error("failed to boot VM: {0}")]
    Boot(String),

    /// Host resources could not be reserved (memory, CPUs, sockets)
    #[error("host resources unavailable: {0}")]
    Resource(String),

    /// The backend cannot attach this kind of device at this point
    #[error("unsupported device {kind}: {reason}")]
    UnsupportedDevice { kind: DeviceKind, reason: String },

    /// The VMM rejected a hotplug or hot-unplug request
    #[error("hotplug failed: {0}")]
    Hotplug(String),

    /// The backend has no live resize support
    #[error("{0} does not support live resource resize")]
    ResizeUnsupported(BackendKind),

    /// VM is not in expected state
    #[error("invalid VM state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// VMM API request failed
    #[error("VMM API error: {0}")]
    Api(String),

    /// Could not reach the guest agent channel
    #[error("guest channel connect failed: {0}")]
    Connect(String),

    /// The VMM process is no longer running
    #[error("VMM process is gone: {0}")]
    ProcessGone(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout waiting for operation
    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}
