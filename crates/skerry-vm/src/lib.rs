//! # skerry-vm
//!
//! Hypervisor abstraction for skerry sandboxes.
//! Every VMM backend implements the [`Hypervisor`] trait and advertises a
//! static [`Capabilities`] descriptor that callers consult before asking
//! for hotplug or live resize.
//!
//! ## Quick Start
//!
//! ```no_run
//! use skerry_vm::{BackendKind, DefaultProvider, HypervisorProvider, VmSpecBuilder};
//! use std::time::Duration;
//!
//! # async fn example() -> skerry_vm::Result<()> {
//! let provider = DefaultProvider::new("/usr/local/bin/firecracker", "/usr/local/bin/cloud-hypervisor");
//! let mut vm = provider.create(BackendKind::Firecracker)?;
//!
//! let spec = VmSpecBuilder::new("vm-1")
//!     .vcpus(2)
//!     .memory_mib(256)
//!     .kernel("/path/to/vmlinux")
//!     .rootfs("/path/to/rootfs.ext4")
//!     .with_vsock(3)
//!     .build()?;
//!
//! let handle = vm.boot(&spec).await?;
//! println!("VMM pid {:?}", handle.pid);
//!
//! vm.shutdown(false, Duration::from_secs(10)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backends
//!
//! - **Firecracker**: block cold-plug, pause/resume, no hotplug or resize
//! - **Cloud Hypervisor**: PCI hotplug of block, VFIO, pmem and vhost-user disks plus live resize

mod api;
mod builder;
mod cloud_hypervisor;
mod config;
mod device;
mod error;
mod firecracker;
mod hypervisor;
pub mod process;
mod provider;
mod vsock;

pub use builder::VmSpecBuilder;
pub use cloud_hypervisor::CloudHypervisor;
pub use config::{DriveConfig, NicConfig, VmSpec, VsockConfig, MAX_VCPUS, MIN_MEMORY_MIB};
pub use device::{AttachedDevice, BusAddress, DeviceKind, DeviceSpec, SlotAllocator};
pub use error::{Result, VmError};
pub use firecracker::Firecracker;
pub use hypervisor::{
    BackendKind, Capabilities, GuestChannel, GuestIo, Hypervisor, HypervisorProvider, VmHandle,
    VmState,
};
pub use provider::DefaultProvider;
pub use vsock::{connect_guest, AGENT_PORT};
