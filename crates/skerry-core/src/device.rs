//! Device bookkeeping for a sandbox.
//!
//! Every device a sandbox hands to its guest goes through a
//! [`DeviceManager`]: it is requested, attached (cold-plugged before boot or
//! hotplugged after), and eventually released. While a device is live its
//! bus address is unique within the sandbox.

use crate::container::ContainerId;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use skerry_vm::{AttachedDevice, BusAddress, DeviceKind, DeviceSpec, Hypervisor};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Unique device identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(Uuid);

impl DeviceId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeviceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a device is in its attach lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum AttachState {
    Pending,
    Attached,
    Detaching,
    Detached,
    Failed(String),
}

impl fmt::Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Attached => write!(f, "attached"),
            Self::Detaching => write!(f, "detaching"),
            Self::Detached => write!(f, "detached"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
        }
    }
}

/// A device asked for by a sandbox or container spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequest {
    pub kind: DeviceKind,
    /// Image file, sysfs path, shm file or vhost-user socket
    pub source: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Region size, required for shared memory
    #[serde(default)]
    pub size_bytes: Option<u64>,
    /// Where the container expects the device
    #[serde(default)]
    pub container_path: Option<String>,
}

impl DeviceRequest {
    /// A writable virtio block device backed by `source`.
    pub fn block(source: impl Into<PathBuf>) -> Self {
        Self {
            kind: DeviceKind::Block,
            source: source.into(),
            read_only: false,
            size_bytes: None,
            container_path: None,
        }
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn at(mut self, container_path: impl Into<String>) -> Self {
        self.container_path = Some(container_path.into());
        self
    }
}

/// A device known to the sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub id: DeviceId,
    pub kind: DeviceKind,
    pub source: PathBuf,
    pub read_only: bool,
    pub size_bytes: Option<u64>,
    pub container_path: Option<String>,
    /// Guest bus address while attached
    pub address: Option<BusAddress>,
    pub state: AttachState,
    /// Owning container, `None` for sandbox-wide devices
    pub container_id: Option<ContainerId>,
    /// Attached at boot rather than hotplugged
    pub boot: bool,
}

impl DeviceDescriptor {
    /// Whether the device currently holds a bus address.
    pub fn is_live(&self) -> bool {
        matches!(self.state, AttachState::Attached | AttachState::Detaching)
    }

    fn holds_source(&self) -> bool {
        !matches!(self.state, AttachState::Detached | AttachState::Failed(_))
    }

    fn to_spec(&self) -> DeviceSpec {
        DeviceSpec {
            id: self.id.to_string(),
            kind: self.kind,
            source: self.source.clone(),
            read_only: self.read_only,
            size_bytes: self.size_bytes,
        }
    }
}

/// Tracks every device of one sandbox, in request order.
#[derive(Debug, Default)]
pub struct DeviceManager {
    devices: Vec<DeviceDescriptor>,
}

impl DeviceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted descriptors.
    pub fn from_descriptors(devices: Vec<DeviceDescriptor>) -> Self {
        Self { devices }
    }

    pub fn list(&self) -> &[DeviceDescriptor] {
        &self.devices
    }

    pub fn get(&self, id: DeviceId) -> Option<&DeviceDescriptor> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Boot-time devices still waiting to be cold-plugged.
    pub fn pending_boot(&self) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.boot && d.state == AttachState::Pending)
            .map(|d| d.id)
            .collect()
    }

    /// Every device the VM currently holds, with its address.
    pub fn attached(&self) -> Vec<AttachedDevice> {
        self.devices
            .iter()
            .filter(|d| d.is_live())
            .filter_map(|d| {
                d.address.clone().map(|address| AttachedDevice {
                    device: d.to_spec(),
                    address,
                })
            })
            .collect()
    }

    /// Devices owned by `container`.
    pub fn owned_by(&self, container: ContainerId) -> Vec<DeviceId> {
        self.devices
            .iter()
            .filter(|d| d.container_id == Some(container))
            .map(|d| d.id)
            .collect()
    }

    fn index(&self, id: DeviceId) -> Result<usize> {
        self.devices
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| CoreError::NotFound(format!("device {id}")))
    }

    /// Register a device. It stays pending until [`attach`](Self::attach).
    pub fn request(
        &mut self,
        request: &DeviceRequest,
        container: Option<ContainerId>,
        boot: bool,
    ) -> Result<DeviceId> {
        if !request.source.exists() {
            return Err(CoreError::InvalidSpec(format!(
                "device source not found: {}",
                request.source.display()
            )));
        }
        if request.kind == DeviceKind::SharedMemory && request.size_bytes.is_none() {
            return Err(CoreError::InvalidSpec(
                "shared memory devices need size_bytes".into(),
            ));
        }
        if let Some(owner) = self
            .devices
            .iter()
            .find(|d| d.source == request.source && d.holds_source() && d.container_id != container)
        {
            let owner = owner
                .container_id
                .map(|c| format!("container {c}"))
                .unwrap_or_else(|| "the sandbox".to_string());
            return Err(CoreError::ResourceAllocation(format!(
                "{} is already owned by {owner}",
                request.source.display()
            )));
        }

        let id = DeviceId::new();
        self.devices.push(DeviceDescriptor {
            id,
            kind: request.kind,
            source: request.source.clone(),
            read_only: request.read_only,
            size_bytes: request.size_bytes,
            container_path: request.container_path.clone(),
            address: None,
            state: AttachState::Pending,
            container_id: container,
            boot,
        });
        tracing::debug!(device_id = %id, kind = %request.kind, source = %request.source.display(), "Device requested");
        Ok(id)
    }

    /// Attach a pending device. `running` selects hotplug over cold-plug.
    ///
    /// Kinds the backend cannot attach in this phase are rejected before
    /// any VMM call and the descriptor is marked failed.
    pub async fn attach(
        &mut self,
        id: DeviceId,
        hypervisor: &mut dyn Hypervisor,
        running: bool,
    ) -> Result<BusAddress> {
        let idx = self.index(id)?;
        let desc = &self.devices[idx];
        match &desc.state {
            AttachState::Pending => {}
            AttachState::Attached => {
                if let Some(address) = &desc.address {
                    return Ok(address.clone());
                }
            }
            other => {
                return Err(CoreError::Internal(format!(
                    "device {id} is {other}, not pending"
                )))
            }
        }

        let caps = hypervisor.capabilities();
        let supported = if running {
            caps.can_hotplug(desc.kind)
        } else {
            caps.can_coldplug(desc.kind)
        };
        if !supported {
            let phase = if running { "hotplugged" } else { "attached at boot" };
            let reason = format!(
                "{} cannot be {phase} on {}",
                desc.kind,
                hypervisor.kind()
            );
            self.devices[idx].state = AttachState::Failed(reason.clone());
            return Err(CoreError::UnsupportedDevice(reason));
        }

        let spec = desc.to_spec();
        match hypervisor.attach(&spec).await {
            Ok(address) => {
                let duplicate = self
                    .devices
                    .iter()
                    .any(|d| d.id != id && d.is_live() && d.address.as_ref() == Some(&address));
                if duplicate {
                    tracing::error!(device_id = %id, %address, "Backend reported a bus address already in use");
                    self.devices[idx].state =
                        AttachState::Failed(format!("duplicate bus address {address}"));
                    return Err(CoreError::Internal(format!(
                        "bus address {address} is already in use"
                    )));
                }

                let desc = &mut self.devices[idx];
                desc.state = AttachState::Attached;
                desc.address = Some(address.clone());
                tracing::info!(device_id = %id, kind = %desc.kind, %address, hotplug = running, "Device attached");
                Ok(address)
            }
            Err(e) => {
                let e = CoreError::from(e);
                tracing::warn!(device_id = %id, error = %e, "Device attach failed");
                self.devices[idx].state = AttachState::Failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Detach a device and forget it.
    ///
    /// Pass `None` for the hypervisor when the VM is not running; the
    /// device is then dropped without a VMM call. On detach failure the
    /// device stays attached.
    pub async fn release(
        &mut self,
        id: DeviceId,
        hypervisor: Option<&mut dyn Hypervisor>,
    ) -> Result<()> {
        let idx = self.index(id)?;

        if self.devices[idx].state == AttachState::Attached {
            self.devices[idx].state = AttachState::Detaching;
            if let (Some(hv), Some(address)) = (hypervisor, self.devices[idx].address.clone()) {
                if let Err(e) = hv.detach(&address).await {
                    self.devices[idx].state = AttachState::Attached;
                    let e = CoreError::from(e);
                    tracing::warn!(device_id = %id, %address, error = %e, "Device detach failed");
                    return Err(e);
                }
            }
            self.devices[idx].state = AttachState::Detached;
            self.devices[idx].address = None;
        }

        let removed = self.devices.remove(idx);
        tracing::debug!(device_id = %id, state = %removed.state, "Device released");
        Ok(())
    }

    /// Release several devices, continuing past failures. Returns the
    /// first error.
    pub async fn release_many(
        &mut self,
        ids: &[DeviceId],
        mut hypervisor: Option<&mut dyn Hypervisor>,
    ) -> Result<()> {
        let mut first_err = None;
        for id in ids.iter().rev() {
            let result = match hypervisor.as_mut() {
                Some(hv) => self.release(*id, Some(&mut **hv)).await,
                None => self.release(*id, None).await,
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// The VM is gone: every address is free again.
    pub fn vm_stopped(&mut self) {
        for desc in &mut self.devices {
            if desc.is_live() {
                desc.state = AttachState::Detached;
                desc.address = None;
            }
        }
    }

    /// Forget every device without touching the VMM.
    pub fn clear(&mut self) {
        if !self.devices.is_empty() {
            tracing::debug!(count = self.devices.len(), "Dropping device records");
        }
        self.devices.clear();
    }
}
