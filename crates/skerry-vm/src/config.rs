//! Configuration types for booting a VM.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Smallest guest memory size any backend accepts.
pub const MIN_MEMORY_MIB: u32 = 128;

/// Largest vCPU count any backend accepts.
pub const MAX_VCPUS: u8 = 32;

/// Everything a backend needs to boot one VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    /// Identifier used for the VM's working directory and VMM instance id
    pub vm_id: String,
    /// Number of virtual CPUs at boot (1-32)
    pub vcpu_count: u8,
    /// Upper bound for live vCPU resize (defaults to `vcpu_count`)
    pub max_vcpus: u8,
    /// Memory size in MiB at boot
    pub memory_mib: u32,
    /// Upper bound for live memory resize (defaults to `memory_mib`)
    pub max_memory_mib: u32,
    /// Path to kernel image
    pub kernel_path: PathBuf,
    /// Optional initrd
    pub initrd_path: Option<PathBuf>,
    /// Kernel boot arguments
    pub boot_args: String,
    /// Root filesystem drive
    pub root_drive: DriveConfig,
    /// Network interfaces, in guest order
    pub nics: Vec<NicConfig>,
    /// Host-guest agent channel
    pub vsock: VsockConfig,
    /// Working directory for VM sockets and state
    pub work_dir: PathBuf,
}

impl Default for VmSpec {
    fn default() -> Self {
        Self {
            vm_id: String::new(),
            vcpu_count: 1,
            max_vcpus: 1,
            memory_mib: 256,
            max_memory_mib: 256,
            kernel_path: PathBuf::from("/var/lib/skerry/kernel/vmlinux"),
            initrd_path: None,
            boot_args: "console=ttyS0 reboot=k panic=1 pci=off".into(),
            root_drive: DriveConfig::default(),
            nics: Vec::new(),
            vsock: VsockConfig::default(),
            work_dir: PathBuf::from("/run/skerry"),
        }
    }
}

impl VmSpec {
    /// Validate the configuration.
    ///
    /// # Errors
    /// Returns an error if any configuration value is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.vm_id.is_empty() {
            return Err(VmError::Config("vm_id must not be empty".into()));
        }

        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            return Err(VmError::Config(format!(
                "vcpu_count must be 1-{MAX_VCPUS}, got {}",
                self.vcpu_count
            )));
        }

        if self.max_vcpus < self.vcpu_count || self.max_vcpus > MAX_VCPUS {
            return Err(VmError::Config(format!(
                "max_vcpus must be {}-{MAX_VCPUS}, got {}",
                self.vcpu_count, self.max_vcpus
            )));
        }

        if self.memory_mib < MIN_MEMORY_MIB {
            return Err(VmError::Config(format!(
                "memory_mib must be at least {MIN_MEMORY_MIB}, got {}",
                self.memory_mib
            )));
        }

        if self.max_memory_mib < self.memory_mib {
            return Err(VmError::Config(format!(
                "max_memory_mib ({}) is below memory_mib ({})",
                self.max_memory_mib, self.memory_mib
            )));
        }

        // 0, 1 and 2 are reserved CIDs
        if self.vsock.guest_cid <= 2 {
            return Err(VmError::Config(format!(
                "vsock guest_cid must be > 2, got {}",
                self.vsock.guest_cid
            )));
        }

        let mut iface_ids: Vec<&str> = Vec::with_capacity(self.nics.len());
        for nic in &self.nics {
            if iface_ids.contains(&nic.iface_id.as_str()) {
                return Err(VmError::Config(format!(
                    "duplicate iface_id: {}",
                    nic.iface_id
                )));
            }
            iface_ids.push(&nic.iface_id);
        }

        Ok(())
    }

    /// Directory holding this VM's sockets and logs.
    pub fn vm_dir(&self) -> PathBuf {
        self.work_dir.join(&self.vm_id)
    }
}

/// Configuration for a block device (drive).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveConfig {
    /// Unique drive identifier
    pub drive_id: String,
    /// Path to drive image on host
    pub path_on_host: PathBuf,
    /// Whether this is the root device
    pub is_root_device: bool,
    /// Read-only flag
    pub is_read_only: bool,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            drive_id: "rootfs".into(),
            path_on_host: PathBuf::from("/var/lib/skerry/images/rootfs.ext4"),
            is_root_device: true,
            is_read_only: false,
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicConfig {
    /// Network interface ID
    pub iface_id: String,
    /// Host device name (tap / macvtap device)
    pub host_dev_name: String,
    /// Guest MAC address (optional, auto-generated by the VMM if None)
    pub guest_mac: Option<String>,
}

/// vsock configuration for guest-host communication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VsockConfig {
    /// Guest CID (Context ID), must be > 2
    pub guest_cid: u32,
    /// Path to vsock Unix Domain Socket on host
    pub uds_path: PathBuf,
}

impl Default for VsockConfig {
    fn default() -> Self {
        Self {
            guest_cid: 3,
            uds_path: PathBuf::from("/run/skerry/v.sock"),
        }
    }
}

impl VsockConfig {
    /// Create a vsock config for a specific VM.
    ///
    /// The UDS path lives inside the VM's working directory.
    pub fn for_vm(cid: u32, work_dir: &Path, vm_id: &str) -> Self {
        Self {
            guest_cid: cid,
            uds_path: work_dir.join(vm_id).join("v.sock"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmSpec {
        VmSpec {
            vm_id: "vm-1".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_vcpu() {
        let mut config = spec();
        config.vcpu_count = 0;
        assert!(config.validate().is_err());

        config.vcpu_count = 33;
        config.max_vcpus = 33;
        assert!(config.validate().is_err());

        config.vcpu_count = 4;
        config.max_vcpus = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_max_vcpus_below_boot() {
        let mut config = spec();
        config.vcpu_count = 4;
        config.max_vcpus = 2;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_memory() {
        let mut config = spec();
        config.memory_mib = 64;
        config.max_memory_mib = 64;
        assert!(config.validate().is_err());

        config.memory_mib = 128;
        config.max_memory_mib = 128;
        assert!(config.validate().is_ok());

        config.max_memory_mib = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_vsock_cid() {
        let mut config = spec();
        config.vsock.guest_cid = 2;
        assert!(config.validate().is_err());

        config.vsock.guest_cid = 3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_iface_ids() {
        let mut config = spec();
        for dev in ["tap0", "tap1"] {
            config.nics.push(NicConfig {
                iface_id: "eth0".into(),
                host_dev_name: dev.into(),
                guest_mac: None,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_vsock_for_vm() {
        let config = VsockConfig::for_vm(5, &PathBuf::from("/tmp/skerry"), "vm-123");
        assert_eq!(config.guest_cid, 5);
        assert_eq!(config.uds_path, PathBuf::from("/tmp/skerry/vm-123/v.sock"));
    }
}
