//! The uniform interface every VMM backend implements.

use crate::config::VmSpec;
use crate::device::{AttachedDevice, BusAddress, DeviceKind, DeviceSpec};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Byte stream to the in-guest agent.
pub trait GuestIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> GuestIo for T {}

/// Owned, type-erased guest channel returned by [`Hypervisor::connect_agent`].
pub type GuestChannel = Box<dyn GuestIo>;

/// Available VMM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Firecracker: minimal VMM, block cold-plug only
    #[default]
    Firecracker,
    /// Cloud Hypervisor: PCI hotplug and live resize
    CloudHypervisor,
}

impl BackendKind {
    /// Parse from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "firecracker" | "fc" => Some(Self::Firecracker),
            "cloud-hypervisor" | "cloud_hypervisor" | "clh" | "ch" => Some(Self::CloudHypervisor),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Firecracker => write!(f, "firecracker"),
            Self::CloudHypervisor => write!(f, "cloud-hypervisor"),
        }
    }
}

/// Lifecycle state of a backend's VM process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// Not booted yet; devices may be cold-plugged
    Creating,
    /// VM is running
    Running,
    /// VM is paused
    Paused,
    /// VM is stopped
    Stopped,
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Creating => write!(f, "creating"),
            VmState::Running => write!(f, "running"),
            VmState::Paused => write!(f, "paused"),
            VmState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Static description of what a backend can do.
///
/// Consulted before an operation so unsupported requests are rejected
/// upfront instead of failing inside the VMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Kinds that may be attached before boot
    pub coldplug: &'static [DeviceKind],
    /// Kinds that may be attached to a running guest
    pub hotplug: &'static [DeviceKind],
    /// Whether vCPUs/memory can be changed on a running guest
    pub live_resize: bool,
    /// Whether the VM can be frozen and thawed
    pub pause: bool,
}

impl Capabilities {
    /// Whether `kind` can be attached before boot.
    pub fn can_coldplug(&self, kind: DeviceKind) -> bool {
        self.coldplug.contains(&kind)
    }

    /// Whether `kind` can be attached to a running guest.
    pub fn can_hotplug(&self, kind: DeviceKind) -> bool {
        self.hotplug.contains(&kind)
    }
}

/// Everything needed to find a running VM again after a control-process restart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmHandle {
    /// VMM instance id
    pub vm_id: String,
    /// VMM API socket
    pub api_socket: PathBuf,
    /// Host side of the guest agent channel
    pub agent_socket: PathBuf,
    /// Guest vsock CID
    pub guest_cid: u32,
    /// VMM process id, when known
    pub pid: Option<u32>,
    /// Hotplug ceiling for vCPUs, fixed at boot
    #[serde(default)]
    pub max_vcpus: u8,
    /// Hotplug ceiling for memory, fixed at boot
    #[serde(default)]
    pub max_memory_mib: u32,
}

/// Uniform operation set over a VMM process.
///
/// One instance drives at most one VM process for its whole lifetime.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Static capability descriptor.
    fn capabilities(&self) -> Capabilities;

    /// Handle of the live VM, if booted or reattached.
    fn handle(&self) -> Option<&VmHandle>;

    /// Launch the VMM and boot the guest.
    ///
    /// Devices cold-plugged through [`attach`](Self::attach) before this call
    /// are part of the booted VM.
    async fn boot(&mut self, spec: &VmSpec) -> Result<VmHandle>;

    /// Take over an already running VM without rebooting it.
    ///
    /// `devices` are the devices the VM holds, so they can be detached
    /// later. Fails with [`VmError::ProcessGone`] if the VMM is no longer
    /// alive.
    async fn reattach(
        &mut self,
        handle: &VmHandle,
        paused: bool,
        devices: &[AttachedDevice],
    ) -> Result<()>;

    /// Attach a device, cold before boot or hot after.
    async fn attach(&mut self, device: &DeviceSpec) -> Result<BusAddress>;

    /// Detach a device.
    ///
    /// Before boot and after shutdown an unknown address is a no-op. On a
    /// running or paused VM it is an error: the backend cannot tell
    /// whether the guest still holds the device.
    async fn detach(&mut self, address: &BusAddress) -> Result<()>;

    /// Resize vCPUs and memory of the running guest.
    async fn resize(&mut self, vcpus: u8, memory_mib: u32) -> Result<()>;

    /// Freeze guest execution.
    async fn pause(&mut self) -> Result<()>;

    /// Thaw guest execution.
    async fn resume(&mut self) -> Result<()>;

    /// Stop the VM.
    ///
    /// Graceful shutdown waits up to `grace` for the guest to power off and
    /// then falls back to killing the VMM process. Always returns once the
    /// process is gone.
    async fn shutdown(&mut self, force: bool, grace: Duration) -> Result<()>;

    /// Whether the VMM process is still alive.
    async fn is_alive(&self) -> bool;

    /// Open a byte stream to the guest agent, retrying until `timeout`.
    async fn connect_agent(&self, timeout: Duration) -> Result<GuestChannel>;
}

/// Creates backend instances; the runtime holds exactly one provider.
pub trait HypervisorProvider: Send + Sync {
    /// Create an unbooted hypervisor of the given kind.
    fn create(&self, kind: BackendKind) -> Result<Box<dyn Hypervisor>>;
}

/// Reject an operation that needs a running VM.
pub(crate) fn require_handle(handle: Option<&VmHandle>) -> Result<&VmHandle> {
    handle.ok_or_else(|| VmError::InvalidState {
        expected: "running".into(),
        actual: "not booted".into(),
    })
}
