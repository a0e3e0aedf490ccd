//! Sandbox and runtime configuration types.

use crate::device::DeviceRequest;
use crate::error::CoreError;
use crate::network::EndpointRequest;
use serde::{Deserialize, Serialize};
use skerry_vm::{BackendKind, MAX_VCPUS, MIN_MEMORY_MIB};
use std::path::PathBuf;
use std::time::Duration;

/// Resource spec for a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// vCPU count at boot (default: 1).
    pub vcpus: u8,
    /// Upper bound for live vCPU resize (default: `vcpus`).
    pub max_vcpus: u8,
    /// Memory in MiB at boot (default: 256).
    pub memory_mib: u32,
    /// Upper bound for live memory resize (default: `memory_mib`).
    pub max_memory_mib: u32,
    /// Path to kernel image.
    pub kernel: PathBuf,
    /// Boot image (root filesystem).
    pub rootfs: PathBuf,
    /// Optional initrd.
    #[serde(default)]
    pub initrd: Option<PathBuf>,
    /// Kernel command line; the backend default when unset.
    #[serde(default)]
    pub boot_args: Option<String>,
    /// Hypervisor backend; the runtime default when unset.
    #[serde(default)]
    pub backend: Option<BackendKind>,
    /// Network namespace the endpoints are bound into.
    #[serde(default)]
    pub netns: Option<String>,
    /// Endpoints created at sandbox creation.
    #[serde(default)]
    pub network: Vec<EndpointRequest>,
    /// Devices cold-plugged at boot.
    #[serde(default)]
    pub devices: Vec<DeviceRequest>,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            vcpus: 1,
            max_vcpus: 1,
            memory_mib: 256,
            max_memory_mib: 256,
            kernel: PathBuf::new(),
            rootfs: PathBuf::new(),
            initrd: None,
            boot_args: None,
            backend: None,
            netns: None,
            network: Vec::new(),
            devices: Vec::new(),
        }
    }
}

impl SandboxSpec {
    /// Create a new spec builder.
    pub fn builder() -> SandboxSpecBuilder {
        SandboxSpecBuilder::default()
    }

    /// Validate resource bounds and the presence of the boot images.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.vcpus == 0 || self.vcpus > MAX_VCPUS {
            return Err(CoreError::InvalidSpec(format!(
                "vcpus must be 1-{MAX_VCPUS}, got {}",
                self.vcpus
            )));
        }
        if self.max_vcpus < self.vcpus || self.max_vcpus > MAX_VCPUS {
            return Err(CoreError::InvalidSpec(format!(
                "max_vcpus must be {}-{MAX_VCPUS}, got {}",
                self.vcpus, self.max_vcpus
            )));
        }
        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(CoreError::InvalidSpec(format!(
                "memory_mib must be >= {MIN_MEMORY_MIB}, got {}",
                self.memory_mib
            )));
        }
        if self.max_memory_mib < self.memory_mib {
            return Err(CoreError::InvalidSpec(format!(
                "max_memory_mib must be >= memory_mib ({}), got {}",
                self.memory_mib, self.max_memory_mib
            )));
        }
        if self.kernel.as_os_str().is_empty() || !self.kernel.exists() {
            return Err(CoreError::InvalidSpec(format!(
                "kernel not found: {}",
                self.kernel.display()
            )));
        }
        if self.rootfs.as_os_str().is_empty() || !self.rootfs.exists() {
            return Err(CoreError::InvalidSpec(format!(
                "boot image not found: {}",
                self.rootfs.display()
            )));
        }
        if let Some(initrd) = &self.initrd {
            if !initrd.exists() {
                return Err(CoreError::InvalidSpec(format!(
                    "initrd not found: {}",
                    initrd.display()
                )));
            }
        }
        Ok(())
    }
}

/// Builder for SandboxSpec.
#[derive(Debug, Default)]
pub struct SandboxSpecBuilder {
    spec: SandboxSpec,
}

impl SandboxSpecBuilder {
    /// Set vCPU count; raises `max_vcpus` if needed.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.spec.vcpus = count;
        self.spec.max_vcpus = self.spec.max_vcpus.max(count);
        self
    }

    /// Set the vCPU ceiling for live resize.
    pub fn max_vcpus(mut self, count: u8) -> Self {
        self.spec.max_vcpus = count;
        self
    }

    /// Set memory in MiB; raises `max_memory_mib` if needed.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.spec.memory_mib = mib;
        self.spec.max_memory_mib = self.spec.max_memory_mib.max(mib);
        self
    }

    /// Set the memory ceiling for live resize.
    pub fn max_memory_mib(mut self, mib: u32) -> Self {
        self.spec.max_memory_mib = mib;
        self
    }

    /// Set the kernel path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.kernel = path.into();
        self
    }

    /// Set the boot image.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.rootfs = path.into();
        self
    }

    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.spec.initrd = Some(path.into());
        self
    }

    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.spec.boot_args = Some(args.into());
        self
    }

    /// Pin the hypervisor backend.
    pub fn backend(mut self, kind: BackendKind) -> Self {
        self.spec.backend = Some(kind);
        self
    }

    pub fn netns(mut self, name: impl Into<String>) -> Self {
        self.spec.netns = Some(name.into());
        self
    }

    /// Request a network endpoint.
    pub fn endpoint(mut self, request: EndpointRequest) -> Self {
        self.spec.network.push(request);
        self
    }

    /// Request a boot-time device.
    pub fn device(mut self, request: DeviceRequest) -> Self {
        self.spec.devices.push(request);
        self
    }

    /// Build the spec, validating all required fields.
    pub fn build(self) -> Result<SandboxSpec, CoreError> {
        self.spec.validate()?;
        Ok(self.spec)
    }
}

/// Configuration for the runtime context.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Directory holding one record directory per sandbox.
    pub state_dir: PathBuf,
    /// Directory for VMM sockets and per-VM working files.
    pub run_dir: PathBuf,
    /// Path to the Firecracker binary.
    pub firecracker_bin: PathBuf,
    /// Path to the Cloud Hypervisor binary.
    pub cloud_hypervisor_bin: PathBuf,
    /// Backend used when a spec does not pick one.
    pub backend: BackendKind,
    /// `ip` binary used for host network setup.
    pub ip_bin: PathBuf,
    /// Deadline for the VMM to boot the guest.
    pub boot_timeout: Duration,
    /// Deadline for connecting to and negotiating with the guest agent.
    pub handshake_timeout: Duration,
    /// Grace period for graceful container and VM shutdown.
    pub stop_timeout: Duration,
    /// Deadline for individual agent calls.
    pub rpc_timeout: Duration,
    /// First guest vsock CID handed out (must be >= 3).
    pub first_cid: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/skerry/sandboxes"),
            run_dir: PathBuf::from("/run/skerry"),
            firecracker_bin: PathBuf::from("/usr/local/bin/firecracker"),
            cloud_hypervisor_bin: PathBuf::from("/usr/local/bin/cloud-hypervisor"),
            backend: BackendKind::Firecracker,
            ip_bin: PathBuf::from("ip"),
            boot_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            stop_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            first_cid: 3,
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `SKERRY_STATE_DIR` | `/var/lib/skerry/sandboxes` |
    /// | `SKERRY_RUN_DIR` | `/run/skerry` |
    /// | `SKERRY_FIRECRACKER` | `/usr/local/bin/firecracker` |
    /// | `SKERRY_CLOUD_HYPERVISOR` | `/usr/local/bin/cloud-hypervisor` |
    /// | `SKERRY_BACKEND` | `firecracker` |
    /// | `SKERRY_IP_BIN` | `ip` |
    /// | `SKERRY_BOOT_TIMEOUT_SECS` | `30` |
    /// | `SKERRY_HANDSHAKE_TIMEOUT_SECS` | `10` |
    /// | `SKERRY_STOP_TIMEOUT_SECS` | `10` |
    /// | `SKERRY_FIRST_CID` | `3` |
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            state_dir: std::env::var("SKERRY_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.state_dir),
            run_dir: std::env::var("SKERRY_RUN_DIR")
                .map(PathBuf::from)
                .unwrap_or(default.run_dir),
            firecracker_bin: std::env::var("SKERRY_FIRECRACKER")
                .map(PathBuf::from)
                .unwrap_or(default.firecracker_bin),
            cloud_hypervisor_bin: std::env::var("SKERRY_CLOUD_HYPERVISOR")
                .map(PathBuf::from)
                .unwrap_or(default.cloud_hypervisor_bin),
            backend: std::env::var("SKERRY_BACKEND")
                .ok()
                .and_then(|v| BackendKind::parse(&v))
                .unwrap_or(default.backend),
            ip_bin: std::env::var("SKERRY_IP_BIN")
                .map(PathBuf::from)
                .unwrap_or(default.ip_bin),
            boot_timeout: env_secs("SKERRY_BOOT_TIMEOUT_SECS").unwrap_or(default.boot_timeout),
            handshake_timeout: env_secs("SKERRY_HANDSHAKE_TIMEOUT_SECS")
                .unwrap_or(default.handshake_timeout),
            stop_timeout: env_secs("SKERRY_STOP_TIMEOUT_SECS").unwrap_or(default.stop_timeout),
            rpc_timeout: default.rpc_timeout,
            first_cid: std::env::var("SKERRY_FIRST_CID")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|cid| *cid >= 3)
                .unwrap_or(default.first_cid),
        }
    }

    /// Validate configuration but only log warnings instead of failing.
    ///
    /// Use this for development environments where binaries may not exist yet.
    pub fn validate_warn(&self) {
        let selected = match self.backend {
            BackendKind::Firecracker => &self.firecracker_bin,
            BackendKind::CloudHypervisor => &self.cloud_hypervisor_bin,
        };
        if !selected.exists() {
            tracing::warn!(backend = %self.backend, path = ?selected, "Default backend binary not found");
        }
        if let Some(parent) = self.state_dir.parent() {
            if !parent.exists() {
                tracing::warn!("State directory parent not found: {:?}", parent);
            }
        }
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
