//! Cloud Hypervisor backend.
//!
//! The VMM is spawned with only an API socket; the VM is then created,
//! booted and reconfigured through `/api/v1/vm.*`. Devices attached after
//! boot are hotplugged onto the PCI bus and the VMM reports their BDF.

use crate::api;
use crate::config::VmSpec;
use crate::device::{AttachedDevice, BusAddress, DeviceKind, DeviceSpec, SlotAllocator};
use crate::error::{Result, VmError};
use crate::hypervisor::{
    require_handle, BackendKind, Capabilities, GuestChannel, Hypervisor, VmHandle, VmState,
};
use crate::process;
use crate::vsock::{self, AGENT_PORT};
use async_trait::async_trait;
use hyper::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

const CAPABILITIES: Capabilities = Capabilities {
    coldplug: &[DeviceKind::Block],
    hotplug: &[
        DeviceKind::Block,
        DeviceKind::Vfio,
        DeviceKind::SharedMemory,
        DeviceKind::VhostUserBlock,
    ],
    live_resize: true,
    pause: true,
};

/// How long to wait for the API socket after spawning the VMM.
const API_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Time allowed for the VMM to exit after `vmm.shutdown`.
const VMM_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Slot 0 is the host bridge and slot 1 the root disk; cold-plugged disks follow.
const FIRST_COLD_SLOT: u32 = 2;
const LAST_COLD_SLOT: u32 = 31;

/// PCI device info returned by the hotplug endpoints.
#[derive(Debug, Deserialize)]
struct PciDeviceInfo {
    #[allow(dead_code)]
    id: String,
    bdf: String,
}

#[derive(Debug, Deserialize)]
struct VmInfo {
    state: String,
}

#[derive(Debug, Clone)]
struct ColdDisk {
    device: DeviceSpec,
    slot: u32,
    address: BusAddress,
}

/// Cloud Hypervisor-backed hypervisor.
pub struct CloudHypervisor {
    /// Path to the cloud-hypervisor binary
    binary: PathBuf,
    state: VmState,
    /// VMM child when spawned by this instance; `None` after reattach
    child: Mutex<Option<Child>>,
    handle: Option<VmHandle>,
    /// Directory of the VM being booted, known before the handle is
    vm_dir: Option<PathBuf>,
    cold: Vec<ColdDisk>,
    slots: SlotAllocator,
    /// Hotplugged devices: guest address -> VMM device id
    hotplugged: HashMap<BusAddress, String>,
    max_vcpus: u8,
    max_memory_mib: u32,
}

impl CloudHypervisor {
    /// Create an unbooted Cloud Hypervisor backend.
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            state: VmState::Creating,
            child: Mutex::new(None),
            handle: None,
            vm_dir: None,
            cold: Vec::new(),
            slots: SlotAllocator::new(FIRST_COLD_SLOT, LAST_COLD_SLOT),
            hotplugged: HashMap::new(),
            max_vcpus: 0,
            max_memory_mib: 0,
        }
    }

    /// Current state of the VM.
    pub fn state(&self) -> VmState {
        self.state
    }

    fn slot_address(slot: u32) -> BusAddress {
        BusAddress::new(format!("0000:00:{slot:02x}.0"))
    }

    /// Build the `vm.create` payload.
    fn vm_config(&self, spec: &VmSpec) -> Value {
        let mut disks = vec![json!({
            "id": spec.root_drive.drive_id,
            "path": spec.root_drive.path_on_host,
            "readonly": spec.root_drive.is_read_only,
        })];
        for disk in &self.cold {
            disks.push(json!({
                "id": disk.device.id,
                "path": disk.device.source,
                "readonly": disk.device.read_only,
            }));
        }

        let net: Vec<Value> = spec
            .nics
            .iter()
            .map(|nic| {
                let mut v = json!({ "id": nic.iface_id, "tap": nic.host_dev_name });
                if let Some(mac) = &nic.guest_mac {
                    v["mac"] = json!(mac);
                }
                v
            })
            .collect();

        let mut payload = json!({
            "kernel": spec.kernel_path,
            "cmdline": spec.boot_args,
        });
        if let Some(initrd) = &spec.initrd_path {
            payload["initramfs"] = json!(initrd);
        }

        let mut memory = json!({ "size": mib_to_bytes(spec.memory_mib), "shared": true });
        if spec.max_memory_mib > spec.memory_mib {
            memory["hotplug_size"] = json!(mib_to_bytes(spec.max_memory_mib - spec.memory_mib));
        }

        json!({
            "cpus": { "boot_vcpus": spec.vcpu_count, "max_vcpus": spec.max_vcpus },
            "memory": memory,
            "payload": payload,
            "disks": disks,
            "net": net,
            "vsock": { "cid": spec.vsock.guest_cid, "socket": spec.vsock.uds_path },
        })
    }

    async fn spawn_vmm(&mut self, api_socket: &Path, log_path: &Path) -> Result<u32> {
        let log = std::fs::File::create(log_path)?;
        let log_err = log.try_clone()?;
        let child = Command::new(&self.binary)
            .arg("--api-socket")
            .arg(format!("path={}", api_socket.display()))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| VmError::Boot(format!("failed to spawn {}: {e}", self.binary.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| VmError::Boot("VMM exited immediately".into()))?;
        *self.child.get_mut() = Some(child);

        let start = Instant::now();
        while !api_socket.exists() {
            if let Some(child) = self.child.get_mut().as_mut() {
                if let Ok(Some(status)) = child.try_wait() {
                    return Err(VmError::Boot(format!("VMM exited during startup: {status}")));
                }
            }
            if start.elapsed() >= API_READY_TIMEOUT {
                return Err(VmError::Timeout(API_READY_TIMEOUT));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        Ok(pid)
    }

    async fn put(&self, endpoint: &str, body: Option<Value>) -> Result<Vec<u8>> {
        let handle = require_handle(self.handle.as_ref())?;
        let path = format!("/api/v1/{endpoint}");
        match body {
            Some(body) => api::send_json(&handle.api_socket, Method::PUT, &path, &body).await,
            None => api::send(&handle.api_socket, Method::PUT, &path, None).await,
        }
    }

    async fn vm_state(&self) -> Option<String> {
        let handle = self.handle.as_ref()?;
        let body = api::send(&handle.api_socket, Method::GET, "/api/v1/vm.info", None)
            .await
            .ok()?;
        serde_json::from_slice::<VmInfo>(&body).ok().map(|i| i.state)
    }

    /// Kill the VMM and reap it if it is our child.
    async fn terminate(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.get_mut().take() {
            if let Err(e) = child.start_kill() {
                tracing::debug!(error = %e, "VMM already exited");
            }
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            return Ok(());
        }
        if let Some(pid) = self.handle.as_ref().and_then(|h| h.pid) {
            process::kill_and_wait(pid).await?;
        }
        Ok(())
    }

    async fn wait_for_poweroff(&self, grace: Duration) -> bool {
        let start = Instant::now();
        loop {
            if !self.is_alive().await {
                return true;
            }
            if self.vm_state().await.as_deref() == Some("Shutdown") {
                return true;
            }
            if start.elapsed() >= grace {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn cleanup_vm_dir(&self) {
        let dir = match (&self.vm_dir, &self.handle) {
            (Some(dir), _) => dir.as_path(),
            (None, Some(handle)) => match handle.api_socket.parent() {
                Some(dir) => dir,
                None => return,
            },
            (None, None) => return,
        };
        if let Err(e) = tokio::fs::remove_dir_all(dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(dir = %dir.display(), error = %e, "Failed to remove VM directory");
            }
        }
    }

    /// Adopt a running VM's handle and the devices it already holds.
    fn adopt(&mut self, handle: &VmHandle, paused: bool, devices: &[AttachedDevice]) {
        self.handle = Some(handle.clone());
        self.max_vcpus = handle.max_vcpus;
        self.max_memory_mib = handle.max_memory_mib;
        // the VMM knows every device by the id it was attached with
        self.hotplugged = devices
            .iter()
            .map(|d| (d.address.clone(), d.device.id.clone()))
            .collect();
        self.state = if paused { VmState::Paused } else { VmState::Running };
    }

    async fn boot_inner(&mut self, spec: &VmSpec, api_socket: &Path) -> Result<()> {
        let config = self.vm_config(spec);
        tracing::trace!(config = %config, "vm.create payload");
        self.put("vm.create", Some(config))
            .await
            .map_err(classify_boot_error)?;
        self.put("vm.boot", None).await.map_err(classify_boot_error)?;
        tracing::debug!(socket = %api_socket.display(), "vm.boot accepted");
        Ok(())
    }
}

fn mib_to_bytes(mib: u32) -> u64 {
    u64::from(mib) * 1024 * 1024
}

/// Memory reservation failures surface as resource errors, everything else as boot errors.
fn classify_boot_error(e: VmError) -> VmError {
    match e {
        VmError::Api(msg) => {
            let lower = msg.to_lowercase();
            if lower.contains("memory") || lower.contains("cannot allocate") {
                VmError::Resource(msg)
            } else {
                VmError::Boot(msg)
            }
        }
        other => other,
    }
}

#[async_trait]
impl Hypervisor for CloudHypervisor {
    fn kind(&self) -> BackendKind {
        BackendKind::CloudHypervisor
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
        tracing::info!(vm_id = %spec.vm_id, disks = self.cold.len() + 1, "Booting Cloud Hypervisor VM");

        let vm_dir = spec.vm_dir();
        self.vm_dir = Some(vm_dir.clone());
        tokio::fs::create_dir_all(&vm_dir)
            .await
            .map_err(|e| VmError::Resource(format!("failed to create VM directory: {e}")))?;
        let api_socket = vm_dir.join("ch.sock");
        let _ = tokio::fs::remove_file(&api_socket).await;

        let pid = self.spawn_vmm(&api_socket, &vm_dir.join("vmm.log")).await;
        let pid = match pid {
            Ok(pid) => pid,
            Err(e) => {
                let _ = self.terminate().await;
                self.cleanup_vm_dir().await;
                self.vm_dir = None;
                return Err(e);
            }
        };

        self.handle = Some(VmHandle {
            vm_id: spec.vm_id.clone(),
            api_socket: api_socket.clone(),
            agent_socket: spec.vsock.uds_path.clone(),
            guest_cid: spec.vsock.guest_cid,
            pid: Some(pid),
            max_vcpus: spec.max_vcpus,
            max_memory_mib: spec.max_memory_mib,
        });

        if let Err(e) = self.boot_inner(spec, &api_socket).await {
            tracing::warn!(vm_id = %spec.vm_id, error = %e, "Boot failed, killing VMM");
            let _ = self.terminate().await;
            self.cleanup_vm_dir().await;
            self.handle = None;
            self.vm_dir = None;
            return Err(e);
        }

        self.max_vcpus = spec.max_vcpus;
        self.max_memory_mib = spec.max_memory_mib;
        self.state = VmState::Running;
        tracing::info!(
            vm_id = %spec.vm_id,
            pid,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Cloud Hypervisor VM started"
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
            devices = devices.len(),
            "Reattaching to Cloud Hypervisor VM"
        );
        let alive = handle.pid.map(process::is_alive).unwrap_or(false);
        if !alive {
            return Err(VmError::ProcessGone(handle.vm_id.clone()));
        }
        self.handle = Some(handle.clone());
        // The VMM can outlive a guest that already powered off
        match self.vm_state().await.as_deref() {
            Some("Running") | Some("Paused") => {}
            other => {
                self.handle = None;
                return Err(VmError::ProcessGone(format!(
                    "{} (guest state {:?})",
                    handle.vm_id, other
                )));
            }
        }
        self.adopt(handle, paused, devices);
        Ok(())
    }

    async fn attach(&mut self, device: &DeviceSpec) -> Result<BusAddress> {
        match self.state {
            VmState::Creating => {
                if !CAPABILITIES.can_coldplug(device.kind) {
                    return Err(VmError::UnsupportedDevice {
                        kind: device.kind,
                        reason: "only block devices can be attached before boot".into(),
                    });
                }
                let slot = self
                    .slots
                    .allocate()
                    .ok_or_else(|| VmError::Resource("no free PCI slots".into()))?;
                let address = Self::slot_address(slot);
                self.cold.push(ColdDisk {
                    device: device.clone(),
                    slot,
                    address: address.clone(),
                });
                tracing::debug!(device_id = %device.id, %address, "Cold-plugging disk");
                Ok(address)
            }
            VmState::Running | VmState::Paused => {
                let (endpoint, body) = match device.kind {
                    DeviceKind::Block => (
                        "vm.add-disk",
                        json!({ "id": device.id, "path": device.source, "readonly": device.read_only }),
                    ),
                    DeviceKind::VhostUserBlock => (
                        "vm.add-disk",
                        json!({ "id": device.id, "vhost_user": true, "socket": device.source }),
                    ),
                    DeviceKind::Vfio => (
                        "vm.add-device",
                        json!({ "id": device.id, "path": device.source }),
                    ),
                    DeviceKind::SharedMemory => {
                        let size = device.size_bytes.ok_or_else(|| VmError::UnsupportedDevice {
                            kind: device.kind,
                            reason: "shared memory needs a size".into(),
                        })?;
                        (
                            "vm.add-pmem",
                            json!({ "id": device.id, "file": device.source, "size": size, "discard_writes": false }),
                        )
                    }
                };
                let body = self.put(endpoint, Some(body)).await.map_err(|e| match e {
                    VmError::Api(msg) => VmError::Hotplug(msg),
                    other => other,
                })?;
                let info: PciDeviceInfo = serde_json::from_slice(&body)
                    .map_err(|e| VmError::Hotplug(format!("unexpected {endpoint} reply: {e}")))?;
                let address = BusAddress::new(info.bdf);
                tracing::info!(device_id = %device.id, %address, kind = %device.kind, "Device hotplugged");
                self.hotplugged.insert(address.clone(), device.id.clone());
                Ok(address)
            }
            VmState::Stopped => Err(VmError::InvalidState {
                expected: "creating or running".into(),
                actual: self.state.to_string(),
            }),
        }
    }

    async fn detach(&mut self, address: &BusAddress) -> Result<()> {
        if let Some(pos) = self.cold.iter().position(|d| &d.address == address) {
            if self.state == VmState::Running || self.state == VmState::Paused {
                let id = self.cold[pos].device.id.clone();
                self.put("vm.remove-device", Some(json!({ "id": id })))
                    .await
                    .map_err(|e| VmError::Hotplug(e.to_string()))?;
            }
            let disk = self.cold.remove(pos);
            self.slots.release(disk.slot);
            return Ok(());
        }

        let live = self.state == VmState::Running || self.state == VmState::Paused;
        let Some(id) = self.hotplugged.get(address).cloned() else {
            if live {
                return Err(VmError::Hotplug(format!("no device known at {address}")));
            }
            return Ok(());
        };
        if live {
            self.put("vm.remove-device", Some(json!({ "id": id })))
                .await
                .map_err(|e| VmError::Hotplug(e.to_string()))?;
        }
        self.hotplugged.remove(address);
        tracing::info!(device_id = %id, %address, "Device unplugged");
        Ok(())
    }

    async fn resize(&mut self, vcpus: u8, memory_mib: u32) -> Result<()> {
        if self.state != VmState::Running {
            return Err(VmError::InvalidState {
                expected: "running".into(),
                actual: self.state.to_string(),
            });
        }
        if vcpus == 0 || (self.max_vcpus > 0 && vcpus > self.max_vcpus) {
            return Err(VmError::Resource(format!(
                "vcpus must be 1-{}, got {vcpus}",
                self.max_vcpus
            )));
        }
        if self.max_memory_mib > 0 && memory_mib > self.max_memory_mib {
            return Err(VmError::Resource(format!(
                "memory_mib must be at most {}, got {memory_mib}",
                self.max_memory_mib
            )));
        }
        self.put(
            "vm.resize",
            Some(json!({ "desired_vcpus": vcpus, "desired_ram": mib_to_bytes(memory_mib) })),
        )
        .await?;
        tracing::info!(vcpus, memory_mib, "VM resized");
        Ok(())
    }

    async fn pause(&mut self) -> Result<()> {
        if self.state == VmState::Paused {
            return Ok(());
        }
        self.put("vm.pause", None).await?;
        self.state = VmState::Paused;
        Ok(())
    }

    async fn resume(&mut self) -> Result<()> {
        if self.state == VmState::Running {
            return Ok(());
        }
        self.put("vm.resume", None).await?;
        self.state = VmState::Running;
        Ok(())
    }

    async fn shutdown(&mut self, force: bool, grace: Duration) -> Result<()> {
        if self.state == VmState::Stopped {
            return Ok(());
        }
        if self.handle.is_none() {
            // boot was cut short after the VMM was spawned
            if self.child.get_mut().is_some() {
                tracing::warn!("Killing VMM of an interrupted boot");
                self.terminate().await?;
            }
            self.cleanup_vm_dir().await;
            self.vm_dir = None;
            self.state = VmState::Stopped;
            return Ok(());
        }
        let vm_id = self.handle.as_ref().map(|h| h.vm_id.clone()).unwrap_or_default();
        tracing::info!(%vm_id, force, "Shutting down Cloud Hypervisor VM");

        if !force {
            if self.state == VmState::Paused {
                if let Err(e) = self.put("vm.resume", None).await {
                    tracing::warn!(%vm_id, error = %e, "Resume before shutdown failed");
                }
            }
            match self.put("vm.power-button", None).await {
                Ok(_) => {
                    if !self.wait_for_poweroff(grace).await {
                        tracing::warn!(%vm_id, grace_ms = grace.as_millis() as u64, "Guest ignored power button, forcing");
                    }
                }
                Err(e) => tracing::warn!(%vm_id, error = %e, "Power button request failed, forcing"),
            }
            // Ask the VMM itself to exit; a kill follows if it does not
            if self.is_alive().await {
                let _ = self.put("vmm.shutdown", None).await;
                let start = Instant::now();
                while self.is_alive().await && start.elapsed() < VMM_EXIT_TIMEOUT {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }

        self.terminate().await?;
        self.state = VmState::Stopped;
        self.hotplugged.clear();
        self.cleanup_vm_dir().await;
        self.vm_dir = None;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        {
            let mut child = self.child.lock().await;
            if let Some(child) = child.as_mut() {
                return matches!(child.try_wait(), Ok(None));
            }
        }
        self.handle
            .as_ref()
            .and_then(|h| h.pid)
            .map(process::is_alive)
            .unwrap_or(false)
    }

    async fn connect_agent(&self, timeout: Duration) -> Result<GuestChannel> {
        let handle = require_handle(self.handle.as_ref())?;
        vsock::connect_guest(&handle.agent_socket, AGENT_PORT, timeout).await
    }
}
