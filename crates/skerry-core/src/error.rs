//! Error types for skerry-core.

use crate::container::ContainerId;
use crate::network::NetError;
use crate::sandbox::SandboxId;
use crate::store::StoreError;
use skerry_vm::{BackendKind, VmError};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for skerry-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// The part of the engine an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subsystem {
    Sandbox,
    Container,
    Hypervisor,
    Agent,
    Device,
    Network,
    Store,
}

impl fmt::Display for Subsystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Sandbox => "sandbox",
            Self::Container => "container",
            Self::Hypervisor => "hypervisor",
            Self::Agent => "agent",
            Self::Device => "device",
            Self::Network => "network",
            Self::Store => "store",
        };
        f.write_str(name)
    }
}

/// Errors that can occur during sandbox operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested sandbox or container spec is not acceptable
    #[error("invalid spec: {0}")]
    InvalidSpec(String),

    /// Lifecycle misuse
    #[error("cannot {operation} in state {state}")]
    InvalidTransition {
        /// Operation that was attempted
        operation: &'static str,
        /// State the object was in
        state: String,
    },

    /// Host resources could not be reserved
    #[error("resource allocation failed: {0}")]
    ResourceAllocation(String),

    /// The VMM failed to start or the guest failed to boot in time
    #[error("boot failed: {0}")]
    Boot(String),

    /// The guest agent was unreachable or incompatible
    #[error("agent handshake failed: {0}")]
    HandshakeFailed(String),

    /// Agent did not respond in time
    #[error("agent call {method} timed out after {timeout:?}")]
    AgentTimeout {
        /// RPC method name
        method: String,
        /// Caller-supplied deadline
        timeout: Duration,
    },

    /// The VMM rejected a hotplug or hot-unplug
    #[error("hotplug failed: {0}")]
    Hotplug(String),

    /// The backend cannot attach this device kind at this point
    #[error("unsupported device: {0}")]
    UnsupportedDevice(String),

    /// The backend has no live resize
    #[error("{0} does not support live resize")]
    ResizeUnsupported(BackendKind),

    /// The backend cannot freeze a running guest
    #[error("{0} does not support pause")]
    PauseUnsupported(BackendKind),

    /// Host network endpoint setup failed
    #[error("network setup failed: {0}")]
    NetworkSetup(#[from] NetError),

    /// A recovery was attempted with an outdated record
    #[error("stale recovery record for {sandbox_id}: revision {record} is older than {current}")]
    StaleRecoveryRecord {
        sandbox_id: SandboxId,
        record: u64,
        current: u64,
    },

    /// Invariant violation
    #[error("internal error: {0}")]
    Internal(String),

    /// Sandbox, container or device not found
    #[error("not found: {0}")]
    NotFound(String),

    /// An object with this identity already exists
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// JSON-RPC error reported by the guest agent
    #[error("agent error {code}: {message}")]
    Agent {
        /// Error code from the agent
        code: i32,
        /// Error message from the agent
        message: String,
    },

    /// The agent connection is gone
    #[error("agent connection closed")]
    AgentClosed,

    /// The operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,

    /// Persistent store failure
    #[error("store error: {0}")]
    Store(StoreError),

    /// Any other hypervisor failure
    #[error("hypervisor error: {0}")]
    Vm(VmError),

    /// A failure annotated with the object it happened to
    #[error(
        "sandbox {sandbox_id}{}: {subsystem} failure (state changed: {state_changed}): {source}",
        container_suffix(.container_id)
    )]
    Context {
        sandbox_id: SandboxId,
        container_id: Option<ContainerId>,
        subsystem: Subsystem,
        state_changed: bool,
        #[source]
        source: Box<CoreError>,
    },
}

fn container_suffix(container_id: &Option<ContainerId>) -> String {
    container_id
        .as_ref()
        .map(|id| format!(" container {id}"))
        .unwrap_or_default()
}

impl CoreError {
    /// The innermost error, with any context stripped.
    pub fn root(&self) -> &CoreError {
        match self {
            Self::Context { source, .. } => source.root(),
            other => other,
        }
    }

    /// Subsystem the failure originated from.
    pub fn subsystem(&self) -> Subsystem {
        match self {
            Self::Context { subsystem, .. } => *subsystem,
            Self::ResourceAllocation(_)
            | Self::Boot(_)
            | Self::ResizeUnsupported(_)
            | Self::PauseUnsupported(_)
            | Self::Vm(_) => Subsystem::Hypervisor,
            Self::HandshakeFailed(_)
            | Self::AgentTimeout { .. }
            | Self::Agent { .. }
            | Self::AgentClosed => Subsystem::Agent,
            Self::Hotplug(_) | Self::UnsupportedDevice(_) => Subsystem::Device,
            Self::NetworkSetup(_) => Subsystem::Network,
            Self::Store(_) | Self::StaleRecoveryRecord { .. } => Subsystem::Store,
            Self::InvalidSpec(_)
            | Self::InvalidTransition { .. }
            | Self::Internal(_)
            | Self::NotFound(_)
            | Self::AlreadyExists(_)
            | Self::Cancelled => Subsystem::Sandbox,
        }
    }

    /// Whether the failed operation left the object in a different state.
    pub fn state_changed(&self) -> bool {
        matches!(self, Self::Context { state_changed: true, .. })
    }

    /// Sandbox the failure happened to, when known.
    pub fn sandbox_id(&self) -> Option<SandboxId> {
        match self {
            Self::Context { sandbox_id, .. } => Some(*sandbox_id),
            _ => None,
        }
    }

    /// Container the failure happened to, when known.
    pub fn container_id(&self) -> Option<ContainerId> {
        match self {
            Self::Context { container_id, .. } => *container_id,
            _ => None,
        }
    }

    /// Attach sandbox/container identity to an error. Already annotated
    /// errors keep their context.
    pub fn in_sandbox(
        self,
        sandbox_id: SandboxId,
        container_id: Option<ContainerId>,
        state_changed: bool,
    ) -> Self {
        if let Self::Context { .. } = self {
            return self;
        }
        let mut subsystem = self.subsystem();
        if container_id.is_some() && subsystem == Subsystem::Sandbox {
            subsystem = Subsystem::Container;
        }
        Self::Context {
            sandbox_id,
            container_id,
            subsystem,
            state_changed,
            source: Box::new(self),
        }
    }

    pub(crate) fn transition(operation: &'static str, state: impl fmt::Display) -> Self {
        Self::InvalidTransition {
            operation,
            state: state.to_string(),
        }
    }
}

impl From<VmError> for CoreError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Boot(msg) => Self::Boot(msg),
            VmError::Resource(msg) => Self::ResourceAllocation(msg),
            VmError::UnsupportedDevice { kind, reason } => {
                Self::UnsupportedDevice(format!("{kind}: {reason}"))
            }
            VmError::Hotplug(msg) => Self::Hotplug(msg),
            VmError::ResizeUnsupported(kind) => Self::ResizeUnsupported(kind),
            VmError::Config(msg) => Self::InvalidSpec(msg),
            other => Self::Vm(other),
        }
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Stale {
                sandbox_id,
                record,
                current,
            } => Self::StaleRecoveryRecord {
                sandbox_id,
                record,
                current,
            },
            other => Self::Store(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vm_error_mapping() {
        let e: CoreError = VmError::Resource("no memory".into()).into();
        assert!(matches!(e, CoreError::ResourceAllocation(_)));
        assert_eq!(e.subsystem(), Subsystem::Hypervisor);

        let e: CoreError = VmError::ResizeUnsupported(BackendKind::Firecracker).into();
        assert!(matches!(e, CoreError::ResizeUnsupported(BackendKind::Firecracker)));
    }

    #[test]
    fn test_context_wraps_once() {
        let id = SandboxId::new();
        let e = CoreError::HandshakeFailed("incompatible".into()).in_sandbox(id, None, true);
        let e = e.in_sandbox(SandboxId::new(), None, false);

        assert_eq!(e.sandbox_id(), Some(id));
        assert!(e.state_changed());
        assert_eq!(e.subsystem(), Subsystem::Agent);
        assert!(matches!(e.root(), CoreError::HandshakeFailed(_)));
    }

    #[test]
    fn test_container_context_subsystem() {
        let e = CoreError::transition("start container", "stopped").in_sandbox(
            SandboxId::new(),
            Some(ContainerId::new()),
            false,
        );
        assert_eq!(e.subsystem(), Subsystem::Container);
        assert!(e.to_string().contains("container"));
    }
}
