//! Builder pattern for ergonomic VmSpec configuration.

use crate::config::{NicConfig, VmSpec, VsockConfig};
use crate::error::Result;
use std::path::PathBuf;

/// Fluent builder for [`VmSpec`].
///
/// # Example
///
/// ```
/// use skerry_vm::VmSpecBuilder;
///
/// let spec = VmSpecBuilder::new("vm-1")
///     .vcpus(4)
///     .memory_mib(512)
///     .kernel("/path/to/vmlinux")
///     .rootfs("/path/to/rootfs.ext4")
///     .with_nic("eth0", "tap0", None)
///     .build()
///     .unwrap();
/// assert_eq!(spec.vcpu_count, 4);
/// ```
#[derive(Debug, Clone)]
pub struct VmSpecBuilder {
    config: VmSpec,
}

impl VmSpecBuilder {
    /// Create a new builder for the given VM id with default configuration.
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            config: VmSpec {
                vm_id: vm_id.into(),
                ..Default::default()
            },
        }
    }

    /// Set the number of virtual CPUs at boot.
    ///
    /// Raises the resize ceiling if it would otherwise sit below the boot count.
    pub fn vcpus(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self.config.max_vcpus = self.config.max_vcpus.max(count);
        self
    }

    /// Set the vCPU ceiling for live resize.
    pub fn max_vcpus(mut self, count: u8) -> Self {
        self.config.max_vcpus = count;
        self
    }

    /// Set the memory size in MiB at boot.
    pub fn memory_mib(mut self, mib: u32) -> Self {
        self.config.memory_mib = mib;
        self.config.max_memory_mib = self.config.max_memory_mib.max(mib);
        self
    }

    /// Set the memory ceiling for live resize.
    pub fn max_memory_mib(mut self, mib: u32) -> Self {
        self.config.max_memory_mib = mib;
        self
    }

    /// Set the path to the kernel image.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the path to the initrd.
    pub fn initrd(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.initrd_path = Some(path.into());
        self
    }

    /// Set the kernel boot arguments.
    pub fn boot_args(mut self, args: impl Into<String>) -> Self {
        self.config.boot_args = args.into();
        self
    }

    /// Set the path to the root filesystem image.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.root_drive.path_on_host = path.into();
        self
    }

    /// Set the root drive as read-only.
    pub fn rootfs_read_only(mut self) -> Self {
        self.config.root_drive.is_read_only = true;
        self
    }

    /// Add a network interface backed by the given host device.
    pub fn with_nic(mut self, iface_id: &str, host_dev: &str, guest_mac: Option<String>) -> Self {
        self.config.nics.push(NicConfig {
            iface_id: iface_id.to_string(),
            host_dev_name: host_dev.to_string(),
            guest_mac,
        });
        self
    }

    /// Configure vsock with the given guest CID under the working directory.
    pub fn with_vsock(mut self, cid: u32) -> Self {
        self.config.vsock =
            VsockConfig::for_vm(cid, &self.config.work_dir, &self.config.vm_id);
        self
    }

    /// Set the working directory for the VM.
    ///
    /// Call before [`with_vsock`](Self::with_vsock) so the socket lands inside it.
    pub fn work_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.work_dir = path.into();
        self
    }

    /// Validate and return the spec.
    pub fn build(self) -> Result<VmSpec> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Return the spec without validating it.
    pub fn build_unchecked(self) -> VmSpec {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VmSpecBuilder::new("vm").build_unchecked();
        assert_eq!(config.vcpu_count, 1);
        assert_eq!(config.memory_mib, 256);
        assert!(config.nics.is_empty());
    }

    #[test]
    fn test_builder_vcpus_memory_raise_ceiling() {
        let config = VmSpecBuilder::new("vm")
            .vcpus(4)
            .memory_mib(512)
            .build_unchecked();

        assert_eq!(config.vcpu_count, 4);
        assert_eq!(config.max_vcpus, 4);
        assert_eq!(config.memory_mib, 512);
        assert_eq!(config.max_memory_mib, 512);
    }

    #[test]
    fn test_builder_kernel_rootfs() {
        let config = VmSpecBuilder::new("vm")
            .kernel("/path/to/kernel")
            .rootfs("/path/to/rootfs")
            .build_unchecked();

        assert_eq!(config.kernel_path, PathBuf::from("/path/to/kernel"));
        assert_eq!(
            config.root_drive.path_on_host,
            PathBuf::from("/path/to/rootfs")
        );
    }

    #[test]
    fn test_builder_with_vsock_uses_work_dir() {
        let config = VmSpecBuilder::new("vm-7")
            .work_dir("/tmp/skerry")
            .with_vsock(5)
            .build_unchecked();

        assert_eq!(config.vsock.guest_cid, 5);
        assert_eq!(
            config.vsock.uds_path,
            PathBuf::from("/tmp/skerry/vm-7/v.sock")
        );
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert!(VmSpecBuilder::new("vm").vcpus(0).build().is_err());
        assert!(VmSpecBuilder::new("").build().is_err());
    }
}
