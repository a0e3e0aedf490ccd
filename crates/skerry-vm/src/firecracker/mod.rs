//! Firecracker backend.
//!
//! Launch and boot go through firepilot; everything firepilot's high-level
//! API doesn't expose (machine config, vsock, pause/resume, graceful
//! shutdown of a reattached VM) goes straight to the API socket.

mod machine_config;

use crate::api;
use crate::config::VmSpec;
use crate::device::{AttachedDevice, BusAddress, DeviceKind, DeviceSpec, SlotAllocator};
use crate::error::{Result, VmError};
use crate::hypervisor::{
    require_handle, BackendKind, Capabilities, GuestChannel, Hypervisor, VmHandle,
};
use crate::process;
use crate::vsock::{self, AGENT_PORT};
use crate::VmState;
use async_trait::async_trait;
use firepilot::builder::drive::DriveBuilder;
use firepilot::builder::executor::FirecrackerExecutorBuilder;
use firepilot::builder::kernel::KernelBuilder;
use firepilot::builder::network_interface::NetworkInterfaceBuilder;
use firepilot::builder::{Builder, Configuration};
use firepilot::machine::Machine;
use hyper::Method;
use serde_json::json;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

pub use machine_config::configure_machine;

const CAPABILITIES: Capabilities = Capabilities {
    coldplug: &[DeviceKind::Block],
    hotplug: &[],
    live_resize: false,
    pause: true,
};

/// Drives are exposed as /dev/vda, /dev/vdb, ... in attach order; vda is the rootfs.
const FIRST_EXTRA_DRIVE: u32 = 1;
const LAST_EXTRA_DRIVE: u32 = 25;

/// A cold-plugged drive waiting for boot.
#[derive(Debug, Clone)]
struct PendingDrive {
    device: DeviceSpec,
    slot: u32,
    address: BusAddress,
}

/// Firecracker-backed hypervisor.
pub struct Firecracker {
    /// Path to the Firecracker binary
    binary: PathBuf,
    state: VmState,
    /// firepilot handle; `None` after reattach
    machine: Mutex<Option<Machine>>,
    handle: Option<VmHandle>,
    /// API socket of the VM being booted, known before the handle is
    booting: Option<PathBuf>,
    drives: Vec<PendingDrive>,
    slots: SlotAllocator,
}

impl Firecracker {
    /// Create an unbooted Firecracker backend.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            state: VmState::Creating,
            machine: Mutex::new(None),
            handle: None,
            booting: None,
            drives: Vec::new(),
            slots: SlotAllocator::new(FIRST_EXTRA_DRIVE, LAST_EXTRA_DRIVE),
        }
    }

    /// Current state of the VM.
    pub fn state(&self) -> VmState {
        self.state
    }

    fn drive_address(slot: u32) -> BusAddress {
        BusAddress::new(format!("/dev/vd{}", (b'a' + slot as u8) as char))
    }

    fn drive_slot(address: &BusAddress) -> Option<u32> {
        match address.as_str().strip_prefix("/dev/vd")?.as_bytes() {
            [letter @ b'a'..=b'z'] => Some(u32::from(letter - b'a')),
            _ => None,
        }
    }

    /// Adopt a running VM's handle and the drives it booted with.
    fn adopt(&mut self, handle: &VmHandle, paused: bool, devices: &[AttachedDevice]) {
        self.handle = Some(handle.clone());
        self.drives.clear();
        for attached in devices {
            let Some(slot) = Self::drive_slot(&attached.address) else {
                tracing::warn!(address = %attached.address, "Ignoring device with a non-drive address");
                continue;
            };
            self.slots.reserve(slot);
            self.drives.push(PendingDrive {
                device: attached.device.clone(),
                slot,
                address: attached.address.clone(),
            });
        }
        self.state = if paused { VmState::Paused } else { VmState::Running };
    }

    /// Kill a Firecracker process whose boot was cut short before the
    /// handle was recorded.
    async fn kill_interrupted_boot(&mut self) -> Result<()> {
        let Some(api_socket) = self.booting.take() else {
            return Ok(());
        };
        if let Some(pid) = process::find_pid_by_arg(&api_socket) {
            tracing::warn!(pid, "Killing VMM of an interrupted boot");
            process::kill_and_wait(pid).await?;
        }
        if let Some(dir) = api_socket.parent() {
            if let Err(e) = tokio::fs::remove_dir_all(dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove VM directory");
                }
            }
        }
        Ok(())
    }

    fn build_configuration(&self, spec: &VmSpec) -> Result<Configuration> {
        let kernel = KernelBuilder::new()
            .with_kernel_image_path(spec.kernel_path.to_string_lossy().to_string())
            .with_boot_args(spec.boot_args.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("kernel config: {:?}", e)))?;

        let mut root = DriveBuilder::new()
            .with_drive_id(spec.root_drive.drive_id.clone())
            .with_path_on_host(spec.root_drive.path_on_host.clone());
        if spec.root_drive.is_root_device {
            root = root.as_root_device();
        }
        if spec.root_drive.is_read_only {
            root = root.as_read_only();
        }
        let root = root
            .try_build()
            .map_err(|e| VmError::Config(format!("drive config: {:?}", e)))?;

        let executor = FirecrackerExecutorBuilder::new()
            .with_chroot(spec.work_dir.to_string_lossy().to_string())
            .with_exec_binary(self.binary.clone())
            .try_build()
            .map_err(|e| VmError::Config(format!("executor config: {:?}", e)))?;

        let mut config = Configuration::new(spec.vm_id.clone())
            .with_kernel(kernel)
            .with_executor(executor)
            .with_drive(root);

        for pending in &self.drives {
            let mut drive = DriveBuilder::new()
                .with_drive_id(pending.device.id.clone())
                .with_path_on_host(pending.device.source.clone());
            if pending.device.read_only {
                drive = drive.as_read_only();
            }
            let drive = drive
                .try_build()
                .map_err(|e| VmError::Config(format!("extra drive config: {:?}", e)))?;
            config = config.with_drive(drive);
        }

        for nic in &spec.nics {
            let mut iface = NetworkInterfaceBuilder::new()
                .with_iface_id(nic.iface_id.clone())
                .with_host_dev_name(nic.host_dev_name.clone());
            if let Some(mac) = &nic.guest_mac {
                iface = iface.with_guest_mac(mac.clone());
            }
            let iface = iface
                .try_build()
                .map_err(|e| VmError::Config(format!("network config: {:?}", e)))?;
            config = config.with_interface(iface);
        }

        Ok(config)
    }

    async fn set_vm_state(&self, target: &str) -> Result<()> {
        let handle = require_handle(self.handle.as_ref())?;
        api::send_json(
            &handle.api_socket,
            Method::PATCH,
            "/vm",
            &json!({ "state": target }),
        )
        .await?;
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        if let Some(machine) = self.machine.get_mut().as_mut() {
            machine
                .kill()
                .await
                .map_err(|e| VmError::Api(format!("kill failed: {:?}", e)))?;
        } else if let Some(pid) = self.handle.as_ref().and_then(|h| h.pid) {
            process::kill_and_wait(pid).await?;
        }
        Ok(())
    }

    async fn cleanup_vm_dir(&self) {
        let Some(handle) = &self.handle else { return };
        let Some(dir) = handle.api_socket.parent() else {
            return;
        };
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(vm_id = %handle.vm_id, error = %e, "Failed to remove VM directory");
            }
        }
    }
}

#[async_trait]
impl Hypervisor for Firecracker {
    fn kind(&self) -> BackendKind {
        BackendKind::Firecracker
    }

    fn capabilities(&self) -> Capabilities {
        CAPABILITIES
    }

    fn handle(&self) -> Option<&VmHandle> {
        self.handle.as_ref()
    }

    async fn boot(&mut self, spec: &VmSpec) -> Result<VmHandle> {
        if self.state != VmState::Creating {
            return Err(VmError::InvalidState {
                expected: "creating".into(),
                actual: self.state.to_string(),
            });
        }
        spec.validate()?;
        let start = Instant::now();
        tracing::info!(vm_id = %spec.vm_id, drives = self.drives.len(), "Booting Firecracker VM");

        tokio::fs::create_dir_all(spec.vm_dir())
            .await
            .map_err(|e| VmError::Resource(format!("failed to create VM directory: {e}")))?;

        let config = self.build_configuration(spec)?;
        let api_socket = spec.vm_dir().join("firecracker.socket");
        self.booting = Some(api_socket.clone());

        // Create the machine (this starts the Firecracker process and socket)
        let mut machine = Machine::new();
        if let Err(e) = machine.create(config).await {
            let _ = self.kill_interrupted_boot().await;
            return Err(VmError::Boot(format!("{:?}", e)));
        }

        let pid = process::find_pid_by_arg(&api_socket);
        self.handle = Some(VmHandle {
            vm_id: spec.vm_id.clone(),
            api_socket: api_socket.clone(),
            agent_socket: spec.vsock.uds_path.clone(),
            guest_cid: spec.vsock.guest_cid,
            pid,
            max_vcpus: spec.max_vcpus,
            max_memory_mib: spec.max_memory_mib,
        });
        self.booting = None;
        *self.machine.get_mut() = Some(machine);

        // Machine resources and vsock must be configured BEFORE starting
        let configured = async {
            configure_machine(&api_socket, spec.vcpu_count, spec.memory_mib).await?;
            vsock::configure_vsock(&api_socket, &spec.vsock).await
        }
        .await;
        if let Err(e) = configured {
            let _ = self.kill().await;
            self.cleanup_vm_dir().await;
            self.handle = None;
            return Err(e);
        }

        let started = match self.machine.get_mut().as_mut() {
            Some(machine) => machine
                .start()
                .await
                .map_err(|e| VmError::Boot(format!("{:?}", e))),
            None => Err(VmError::Boot("machine handle lost before start".into())),
        };
        if let Err(e) = started {
            let _ = self.kill().await;
            self.cleanup_vm_dir().await;
            self.handle = None;
            return Err(e);
        }

        self.state = VmState::Running;
        tracing::info!(
            vm_id = %spec.vm_id,
            pid = ?pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Firecracker VM started"
        );
        require_handle(self.handle.as_ref()).cloned()
    }

    async fn reattach(
        &mut self,
        handle: &VmHandle,
        paused: bool,
        devices: &[AttachedDevice],
    ) -> Result<()> {
        tracing::info!(
            vm_id = %handle.vm_id,
            pid = ?handle.pid,
            drives = devices.len(),
            "Reattaching to Firecracker VM"
        );
        let alive = match handle.pid {
            Some(pid) => process::is_alive(pid),
            None => api::send(&handle.api_socket, Method::GET, "/", None)
                .await
                .is_ok(),
        };
        if !alive {
            return Err(VmError::ProcessGone(handle.vm_id.clone()));
        }
        self.adopt(handle, paused, devices);
        Ok(())
    }

    async fn attach(&mut self, device: &DeviceSpec) -> Result<BusAddress> {
        if self.state != VmState::Creating {
            return Err(VmError::UnsupportedDevice {
                kind: device.kind,
                reason: "firecracker cannot hotplug devices".into(),
            });
        }
        if !CAPABILITIES.can_coldplug(device.kind) {
            return Err(VmError::UnsupportedDevice {
                kind: device.kind,
                reason: "firecracker only attaches block devices".into(),
            });
        }
        let slot = self
            .slots
            .allocate()
            .ok_or_else(|| VmError::Resource("no free drive slots".into()))?;
        let address = Self::drive_address(slot);
        tracing::debug!(device_id = %device.id, %address, "Cold-plugging drive");
        self.drives.push(PendingDrive {
            device: device.clone(),
            slot,
            address: address.clone(),
        });
        Ok(address)
    }

    async fn detach(&mut self, address: &BusAddress) -> Result<()> {
        // known or not, a running guest keeps every drive it booted with
        if self.state == VmState::Running || self.state == VmState::Paused {
            return Err(VmError::Hotplug(
                "firecracker cannot hot-unplug drives".into(),
            ));
        }
        let Some(pos) = self.drives.iter().position(|d| &d.address == address) else {
            return Ok(());
        };
        let drive = self.drives.remove(pos);
        self.slots.release(drive.slot);
        tracing::debug!(device_id = %drive.device.id, %address, "Drive detached");
        Ok(())
    }

    async fn resize(&mut self, _vcpus: u8, _memory_mib: u32) -> Result<()> {
        Err(VmError::ResizeUnsupported(BackendKind::Firecracker))
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state == VmState::Paused {
            return Ok(());
        }
        self.set_vm_state("Paused").await?;
        self.state = VmState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if self.state == VmState::Running {
            return Ok(());
        }
        self.set_vm_state("Resumed").await?;
        self.state = VmState::Running;
        Ok(())
    }

    async fn shutdown(&mut self, force: bool, grace: Duration) -> Result<()> {
        if self.state == VmState::Stopped {
            return Ok(());
        }
        if self.handle.is_none() {
            self.kill_interrupted_boot().await?;
            self.state = VmState::Stopped;
            return Ok(());
        }
        let vm_id = self.handle.as_ref().map(|h| h.vm_id.clone()).unwrap_or_default();
        tracing::info!(%vm_id, force, "Shutting down Firecracker VM");

        if !force {
            // Paused guests cannot react to Ctrl+Alt+Del
            if self.state == VmState::Paused {
                if let Err(e) = self.set_vm_state("Resumed").await {
                    tracing::warn!(%vm_id, error = %e, "Resume before shutdown failed");
                }
            }
            let requested = match self.machine.get_mut().as_mut() {
                Some(machine) => machine
                    .stop()
                    .await
                    .map_err(|e| VmError::Api(format!("{:?}", e))),
                None => {
                    let handle = require_handle(self.handle.as_ref())?;
                    api::send_json(
                        &handle.api_socket,
                        Method::PUT,
                        "/actions",
                        &json!({ "action_type": "SendCtrlAltDel" }),
                    )
                    .await
                    .map(|_| ())
                }
            };
            match requested {
                Ok(()) => {
                    if self.wait_exit(grace).await {
                        self.state = VmState::Stopped;
                        self.cleanup_vm_dir().await;
                        return Ok(());
                    }
                    tracing::warn!(%vm_id, grace_ms = grace.as_millis() as u64, "Guest ignored shutdown, forcing");
                }
                Err(e) => {
                    tracing::warn!(%vm_id, error = %e, "Graceful shutdown request failed, forcing");
                }
            }
        }

        self.kill().await?;
        self.state = VmState::Stopped;
        self.cleanup_vm_dir().await;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match &self.handle {
            Some(VmHandle { pid: Some(pid), .. }) => process::is_alive(*pid),
            Some(handle) => api::send(&handle.api_socket, Method::GET, "/", None)
                .await
                .is_ok(),
            None => false,
        }
    }

    async fn connect_agent(&self, timeout: Duration) -> Result<GuestChannel> {
        let handle = require_handle(self.handle.as_ref())?;
        vsock::connect_guest(&handle.agent_socket, AGENT_PORT, timeout).await
    }
}

impl Firecracker {
    async fn wait_exit(&self, grace: Duration) -> bool {
        let start = Instant::now();
        while self.is_alive().await {
            if start.elapsed() >= grace {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(id: &str) -> DeviceSpec {
        DeviceSpec {
            id: id.into(),
            kind: DeviceKind::Block,
            source: PathBuf::from(format!("/tmp/{id}.img")),
            read_only: false,
            size_bytes: None,
        }
    }

    #[test]
    fn test_drive_address() {
        assert_eq!(Firecracker::drive_address(1).as_str(), "/dev/vdb");
        assert_eq!(Firecracker::drive_address(25).as_str(), "/dev/vdz");
    }

    #[tokio::test]
    async fn test_coldplug_before_boot() {
        let mut fc = Firecracker::new("/usr/local/bin/firecracker");
        let a = fc.attach(&block("data")).await.unwrap();
        let b = fc.attach(&block("scratch")).await.unwrap();
        assert_eq!(a.as_str(), "/dev/vdb");
        assert_eq!(b.as_str(), "/dev/vdc");

        fc.detach(&a).await.unwrap();
        // Unknown addresses detach as a no-op
        fc.detach(&a).await.unwrap();
        let c = fc.attach(&block("again")).await.unwrap();
        assert_eq!(c.as_str(), "/dev/vdb");
    }

    #[tokio::test]
    async fn test_rejects_non_block() {
        let mut fc = Firecracker::new("/usr/local/bin/firecracker");
        let mut dev = block("gpu");
        dev.kind = DeviceKind::Vfio;
        let result = fc.attach(&dev).await;
        assert!(matches!(result, Err(VmError::UnsupportedDevice { .. })));
    }

    #[tokio::test]
    async fn test_resize_unsupported() {
        let mut fc = Firecracker::new("/usr/local/bin/firecracker");
        assert!(matches!(
            fc.resize(2, 512).await,
            Err(VmError::ResizeUnsupported(BackendKind::Firecracker))
        ));
    }

    #[test]
    fn test_drive_slot_parse() {
        assert_eq!(Firecracker::drive_slot(&BusAddress::new("/dev/vdc")), Some(2));
        assert_eq!(Firecracker::drive_slot(&BusAddress::new("0000:00:05.0")), None);
        assert_eq!(Firecracker::drive_slot(&BusAddress::new("/dev/vdaa")), None);
    }

    #[tokio::test]
    async fn test_reattached_drives_stay_attached() {
        let mut fc = Firecracker::new("/usr/local/bin/firecracker");
        let handle = VmHandle {
            vm_id: "vm-1".into(),
            api_socket: PathBuf::from("/nonexistent/vm-1/firecracker.socket"),
            agent_socket: PathBuf::from("/nonexistent/vm-1/vsock.sock"),
            guest_cid: 3,
            pid: None,
            max_vcpus: 2,
            max_memory_mib: 512,
        };
        let data = BusAddress::new("/dev/vdb");
        fc.adopt(
            &handle,
            false,
            &[AttachedDevice {
                device: block("data"),
                address: data.clone(),
            }],
        );
        assert_eq!(fc.state(), VmState::Running);
        assert_eq!(fc.drives.len(), 1);
        assert!(matches!(fc.detach(&data).await, Err(VmError::Hotplug(_))));
        // never seen by this instance, still held by the guest
        assert!(matches!(
            fc.detach(&BusAddress::new("/dev/vdc")).await,
            Err(VmError::Hotplug(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_unbooted_is_noop() {
        let mut fc = Firecracker::new("/usr/local/bin/firecracker");
        fc.shutdown(false, Duration::from_millis(10)).await.unwrap();
        assert_eq!(fc.state(), VmState::Stopped);
        assert!(!fc.is_alive().await);
    }
}
