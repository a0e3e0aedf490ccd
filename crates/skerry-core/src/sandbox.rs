//! The sandbox aggregate and its lifecycle state machine.
//!
//! A [`Sandbox`] owns one hypervisor instance, one agent connection, its
//! device manager, its network endpoints and its containers. Every method
//! that changes state takes `&mut self`; the runtime wraps each sandbox in
//! an exclusive lock so at most one such operation runs at a time.
//!
//! ```text
//! Created ──start──► Running ◄──resume── Paused
//!    │                 │  └────pause────►  │
//!    │                 └──────stop─────────┴──► Stopped
//!    │                                             │
//!    └──────────────────remove─────────────────────┴──► Removed
//!
//! any failed transition ──► Failed ──remove──► Removed
//! ```

use crate::agent::protocol::{CreateContainerParams, GuestDevice, ProcessParams};
use crate::agent::{AgentClient, AgentInfo};
use crate::config::SandboxSpec;
use crate::container::{Container, ContainerId, ContainerSpec, ContainerState};
use crate::device::{DeviceDescriptor, DeviceId, DeviceManager, DeviceRequest};
use crate::error::{CoreError, Result};
use crate::network::NetworkEndpoint;
use crate::runtime::Services;
use crate::store::SandboxRecord;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skerry_vm::{
    AttachedDevice, BackendKind, BusAddress, Capabilities, DeviceSpec, GuestChannel, Hypervisor,
    VmError, VmHandle, VmSpec, VmSpecBuilder,
};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Guest signal numbers used for container shutdown.
const SIGTERM: i32 = 15;
const SIGKILL: i32 = 9;

/// Bound on the SIGKILL round trip once the grace period is spent.
const KILL_TIMEOUT: Duration = Duration::from_secs(2);

const FIRECRACKER_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";
const CLOUD_HYPERVISOR_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1";

/// Unique sandbox identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(Uuid);

impl SandboxId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SandboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for SandboxId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SandboxId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Sandbox lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Validated and networked, not booted
    Created,
    Running,
    Paused,
    Stopped,
    Removed,
    /// A transition failed part way; only removal is possible
    Failed,
}

impl SandboxState {
    /// Whether the VM process is expected to exist.
    pub fn has_vm(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

impl fmt::Display for SandboxState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Removed => "removed",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of one container.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContainerStatus {
    pub id: ContainerId,
    pub state: ContainerState,
    pub devices: Vec<DeviceId>,
}

/// Point-in-time view of a sandbox, published after every change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxStatus {
    pub id: SandboxId,
    pub state: SandboxState,
    pub backend: BackendKind,
    pub vcpus: u8,
    pub memory_mib: u32,
    pub vsock_cid: u32,
    pub containers: Vec<ContainerStatus>,
    pub devices: Vec<DeviceDescriptor>,
    pub endpoints: Vec<NetworkEndpoint>,
    /// Agent build version once the handshake succeeded
    pub agent_version: Option<String>,
    pub failure: Option<String>,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a caller needs to run a process without holding the sandbox lock.
pub(crate) struct ExecContext {
    pub agent: AgentClient,
    pub exec_id: String,
    pub io: CancellationToken,
    pub rpc_timeout: Duration,
}

/// A VM-backed sandbox.
pub struct Sandbox {
    id: SandboxId,
    state: SandboxState,
    spec: SandboxSpec,
    backend: BackendKind,
    vsock_cid: u32,
    hypervisor: Box<dyn Hypervisor>,
    vm: Option<VmHandle>,
    agent: Option<AgentClient>,
    agent_info: Option<AgentInfo>,
    /// Creation order, which is also teardown order reversed
    containers: Vec<Container>,
    devices: DeviceManager,
    endpoints: Vec<NetworkEndpoint>,
    failure: Option<String>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    services: Arc<Services>,
    watch: watch::Sender<SandboxStatus>,
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(CoreError::Cancelled);
    }
    Ok(())
}

impl Sandbox {
    /// Validate `spec`, set up networking and register boot devices.
    ///
    /// Nothing is left behind on failure.
    pub(crate) async fn create(
        id: SandboxId,
        spec: SandboxSpec,
        vsock_cid: u32,
        services: Arc<Services>,
    ) -> Result<Self> {
        spec.validate()?;
        let backend = spec.backend.unwrap_or(services.config.backend);
        let hypervisor = services
            .provider
            .create(backend)
            .map_err(|e| CoreError::ResourceAllocation(e.to_string()))?;

        tracing::info!(
            sandbox_id = %id,
            %backend,
            vcpus = spec.vcpus,
            memory_mib = spec.memory_mib,
            vsock_cid,
            "Creating sandbox"
        );

        let endpoints = services
            .network
            .configure(id, spec.netns.as_deref(), &spec.network)
            .await?;

        let mut devices = DeviceManager::new();
        for request in &spec.devices {
            if let Err(e) = devices.request(request, None, true) {
                services.network.teardown(id, &endpoints).await;
                return Err(e);
            }
        }

        let now = Utc::now();
        let (watch, _) = watch::channel(SandboxStatus {
            id,
            state: SandboxState::Created,
            backend,
            vcpus: spec.vcpus,
            memory_mib: spec.memory_mib,
            vsock_cid,
            containers: Vec::new(),
            devices: Vec::new(),
            endpoints: Vec::new(),
            agent_version: None,
            failure: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        });

        let mut sandbox = Self {
            id,
            state: SandboxState::Created,
            spec,
            backend,
            vsock_cid,
            hypervisor,
            vm: None,
            agent: None,
            agent_info: None,
            containers: Vec::new(),
            devices,
            endpoints,
            failure: None,
            revision: 0,
            created_at: now,
            updated_at: now,
            services,
            watch,
        };

        if let Err(e) = sandbox.persist().await {
            sandbox
                .services
                .network
                .teardown(id, &sandbox.endpoints)
                .await;
            return Err(e);
        }
        Ok(sandbox)
    }

    /// Rebuild a sandbox from its record.
    ///
    /// Records whose VM should be alive are reattached without rebooting;
    /// when that is impossible the sandbox comes back `Failed`. Fails only
    /// when the record is older than what the store holds.
    pub(crate) async fn recover(record: SandboxRecord, services: Arc<Services>) -> Result<Self> {
        services.store.ensure_fresh(&record).await?;

        let (hypervisor, unavailable) = match services.provider.create(record.backend) {
            Ok(hv) => (hv, None),
            Err(e) => {
                let reason = e.to_string();
                let hv: Box<dyn Hypervisor> = Box::new(Unavailable {
                    kind: record.backend,
                    reason: reason.clone(),
                });
                (hv, Some(reason))
            }
        };

        let status = SandboxStatus {
            id: record.id,
            state: record.state,
            backend: record.backend,
            vcpus: record.spec.vcpus,
            memory_mib: record.spec.memory_mib,
            vsock_cid: record.vsock_cid,
            containers: Vec::new(),
            devices: Vec::new(),
            endpoints: Vec::new(),
            agent_version: None,
            failure: record.failure.clone(),
            revision: record.revision,
            created_at: record.created_at,
            updated_at: record.updated_at,
        };
        let (watch, _) = watch::channel(status);

        let mut sandbox = Self {
            id: record.id,
            state: record.state,
            spec: record.spec,
            backend: record.backend,
            vsock_cid: record.vsock_cid,
            hypervisor,
            vm: record.vm,
            agent: None,
            agent_info: None,
            containers: record.containers,
            devices: DeviceManager::from_descriptors(record.devices),
            endpoints: record.endpoints,
            failure: record.failure,
            revision: record.revision,
            created_at: record.created_at,
            updated_at: record.updated_at,
            services,
            watch,
        };

        if !sandbox.state.has_vm() {
            tracing::debug!(sandbox_id = %sandbox.id, state = %sandbox.state, "Restored sandbox record");
            sandbox.publish();
            return Ok(sandbox);
        }

        let result = match unavailable {
            Some(reason) => Err(CoreError::ResourceAllocation(reason)),
            None => sandbox.reattach().await,
        };
        match result {
            Ok(()) => {
                tracing::info!(sandbox_id = %sandbox.id, state = %sandbox.state, "Sandbox reattached");
                sandbox.publish();
            }
            Err(e) => {
                tracing::warn!(sandbox_id = %sandbox.id, error = %e, "Sandbox could not be reattached");
                sandbox.agent = None;
                sandbox.devices.vm_stopped();
                sandbox.mark_failed(&e).await;
            }
        }
        Ok(sandbox)
    }

    async fn reattach(&mut self) -> Result<()> {
        let handle = self
            .vm
            .clone()
            .ok_or_else(|| CoreError::Internal("record has no VM handle".into()))?;
        let paused = self.state == SandboxState::Paused;
        let devices = self.devices.attached();
        self.hypervisor.reattach(&handle, paused, &devices).await?;
        // a frozen guest cannot answer; connect on resume instead
        if !paused {
            self.connect_agent(&CancellationToken::new()).await?;
        }
        Ok(())
    }

    pub fn id(&self) -> SandboxId {
        self.id
    }

    pub fn state(&self) -> SandboxState {
        self.state
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn spec(&self) -> &SandboxSpec {
        &self.spec
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn devices(&self) -> &[DeviceDescriptor] {
        self.devices.list()
    }

    pub fn endpoints(&self) -> &[NetworkEndpoint] {
        &self.endpoints
    }

    pub fn agent_info(&self) -> Option<&AgentInfo> {
        self.agent_info.as_ref()
    }

    /// Current status snapshot.
    pub fn status(&self) -> SandboxStatus {
        SandboxStatus {
            id: self.id,
            state: self.state,
            backend: self.backend,
            vcpus: self.spec.vcpus,
            memory_mib: self.spec.memory_mib,
            vsock_cid: self.vsock_cid,
            containers: self
                .containers
                .iter()
                .map(|c| ContainerStatus {
                    id: c.id(),
                    state: c.state(),
                    devices: c.devices().to_vec(),
                })
                .collect(),
            devices: self.devices.list().to_vec(),
            endpoints: self.endpoints.clone(),
            agent_version: self.agent_info.as_ref().map(|i| i.agent_version.clone()),
            failure: self.failure.clone(),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Receiver that sees every published status.
    pub fn subscribe(&self) -> watch::Receiver<SandboxStatus> {
        self.watch.subscribe()
    }

    fn publish(&self) {
        self.watch.send_replace(self.status());
    }

    fn to_record(&self) -> SandboxRecord {
        SandboxRecord {
            id: self.id,
            state: self.state,
            backend: self.backend,
            spec: self.spec.clone(),
            vsock_cid: self.vsock_cid,
            vm: if self.state.has_vm() {
                self.vm.clone()
            } else {
                None
            },
            containers: self.containers.clone(),
            devices: self.devices.list().to_vec(),
            endpoints: self.endpoints.clone(),
            failure: self.failure.clone(),
            revision: self.revision,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    /// Write the record under the next revision and publish the new status.
    async fn persist(&mut self) -> Result<()> {
        self.revision += 1;
        self.updated_at = Utc::now();
        let result = self.services.store.save(&self.to_record()).await;
        if let Err(e) = &result {
            self.revision -= 1;
            tracing::error!(sandbox_id = %self.id, error = %e, "Failed to persist sandbox record");
        }
        self.publish();
        result.map_err(CoreError::from)
    }

    async fn mark_failed(&mut self, cause: &CoreError) {
        self.state = SandboxState::Failed;
        self.failure = Some(cause.to_string());
        if let Err(e) = self.persist().await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to record sandbox failure");
        }
    }

    fn agent(&self) -> Result<AgentClient> {
        self.agent.clone().ok_or(CoreError::AgentClosed)
    }

    fn require_running(&self, operation: &'static str) -> Result<()> {
        if self.state != SandboxState::Running {
            return Err(CoreError::transition(operation, self.state));
        }
        Ok(())
    }

    fn container_index(&self, id: ContainerId) -> Result<usize> {
        self.containers
            .iter()
            .position(|c| c.id() == id)
            .ok_or_else(|| CoreError::NotFound(format!("container {id}")))
    }

    fn vm_spec(&self) -> Result<VmSpec> {
        let config = &self.services.config;
        let boot_args = self.spec.boot_args.clone().unwrap_or_else(|| {
            match self.backend {
                BackendKind::Firecracker => FIRECRACKER_BOOT_ARGS,
                BackendKind::CloudHypervisor => CLOUD_HYPERVISOR_BOOT_ARGS,
            }
            .to_string()
        });

        let mut builder = VmSpecBuilder::new(self.id.to_string())
            .vcpus(self.spec.vcpus)
            .max_vcpus(self.spec.max_vcpus)
            .memory_mib(self.spec.memory_mib)
            .max_memory_mib(self.spec.max_memory_mib)
            .kernel(&self.spec.kernel)
            .rootfs(&self.spec.rootfs)
            .boot_args(boot_args)
            .work_dir(&config.run_dir)
            .with_vsock(self.vsock_cid);
        if let Some(initrd) = &self.spec.initrd {
            builder = builder.initrd(initrd);
        }
        for endpoint in &self.endpoints {
            if endpoint.socket.is_some() {
                tracing::debug!(host_name = %endpoint.host_name, "vhost-user endpoint left to its backend");
                continue;
            }
            builder = builder.with_nic(
                &endpoint.guest_name,
                &endpoint.host_name,
                Some(endpoint.guest_mac.clone()),
            );
        }
        Ok(builder.build()?)
    }

    /// Boot the VM and connect to its agent.
    ///
    /// On any failure, including cancellation, everything acquired so far
    /// is released and the sandbox moves to `Failed`.
    pub(crate) async fn start(&mut self, cancel: &CancellationToken) -> Result<()> {
        match self.state {
            SandboxState::Running => return Ok(()),
            SandboxState::Created => {}
            other => return Err(CoreError::transition("start", other)),
        }

        let started = Instant::now();
        tracing::info!(sandbox_id = %self.id, backend = %self.backend, "Starting sandbox");

        match self.boot(cancel).await {
            Ok(()) => {
                tracing::info!(
                    sandbox_id = %self.id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Sandbox running"
                );
                Ok(())
            }
            Err(e) => {
                let e = if cancel.is_cancelled() {
                    CoreError::Cancelled
                } else {
                    e
                };
                self.rollback_start(&e).await;
                Err(e)
            }
        }
    }

    async fn boot(&mut self, cancel: &CancellationToken) -> Result<()> {
        for id in self.devices.pending_boot() {
            check_cancelled(cancel)?;
            self.devices
                .attach(id, self.hypervisor.as_mut(), false)
                .await?;
        }

        check_cancelled(cancel)?;
        let vm_spec = self.vm_spec()?;
        let boot_timeout = self.services.config.boot_timeout;
        let handle = match tokio::time::timeout(boot_timeout, self.hypervisor.boot(&vm_spec)).await
        {
            Ok(handle) => handle?,
            Err(_) => {
                return Err(CoreError::Boot(format!(
                    "VM did not boot within {boot_timeout:?}"
                )))
            }
        };
        tracing::debug!(sandbox_id = %self.id, pid = ?handle.pid, "VM booted");
        self.vm = Some(handle);

        check_cancelled(cancel)?;
        self.connect_agent(cancel).await?;

        self.state = SandboxState::Running;
        self.persist().await
    }

    async fn connect_agent(&mut self, cancel: &CancellationToken) -> Result<()> {
        let timeout = self.services.config.handshake_timeout;
        let deadline = Instant::now() + timeout;

        let channel = tokio::select! {
            _ = cancel.cancelled() => return Err(CoreError::Cancelled),
            channel = self.hypervisor.connect_agent(timeout) => channel
                .map_err(|e| CoreError::HandshakeFailed(format!("agent unreachable: {e}")))?,
        };

        let client = AgentClient::new(channel);
        let info = client
            .handshake(deadline.saturating_duration_since(Instant::now()), cancel)
            .await?;
        self.agent = Some(client);
        self.agent_info = Some(info);
        Ok(())
    }

    async fn rollback_start(&mut self, cause: &CoreError) {
        tracing::warn!(sandbox_id = %self.id, error = %cause, "Start failed, releasing resources");

        self.agent = None;
        self.agent_info = None;
        if let Err(e) = self.hypervisor.shutdown(true, Duration::ZERO).await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to kill VM during rollback");
        }
        self.vm = None;
        self.devices.clear();

        let failed = self
            .services
            .network
            .teardown(self.id, &self.endpoints)
            .await;
        if failed > 0 {
            tracing::warn!(sandbox_id = %self.id, failed, "Some endpoints could not be deleted");
        }
        self.endpoints.clear();

        self.mark_failed(cause).await;
    }

    pub(crate) async fn pause(&mut self) -> Result<()> {
        match self.state {
            SandboxState::Paused => return Ok(()),
            SandboxState::Running => {}
            other => return Err(CoreError::transition("pause", other)),
        }
        if !self.hypervisor.capabilities().pause {
            return Err(CoreError::PauseUnsupported(self.backend));
        }

        if let Err(e) = self.hypervisor.pause().await {
            let e = CoreError::from(e);
            self.mark_failed(&e).await;
            return Err(e);
        }
        self.state = SandboxState::Paused;
        tracing::info!(sandbox_id = %self.id, "Sandbox paused");
        self.persist().await
    }

    pub(crate) async fn resume(&mut self) -> Result<()> {
        match self.state {
            SandboxState::Running => return Ok(()),
            SandboxState::Paused => {}
            other => return Err(CoreError::transition("resume", other)),
        }

        let mut result = self.hypervisor.resume().await.map_err(CoreError::from);
        // recovered while paused: the agent was never connected
        if result.is_ok() && self.agent.is_none() {
            result = self.connect_agent(&CancellationToken::new()).await;
        }
        if let Err(e) = result {
            self.mark_failed(&e).await;
            return Err(e);
        }

        self.state = SandboxState::Running;
        tracing::info!(sandbox_id = %self.id, "Sandbox resumed");
        self.persist().await
    }

    /// Stop the VM. A graceful stop first asks the guest to stop every
    /// container, newest first, within the stop timeout.
    pub(crate) async fn stop(&mut self, force: bool) -> Result<()> {
        match self.state {
            SandboxState::Stopped => return Ok(()),
            SandboxState::Running | SandboxState::Paused => {}
            other => return Err(CoreError::transition("stop", other)),
        }

        let grace = self.services.config.stop_timeout;
        tracing::info!(sandbox_id = %self.id, force, "Stopping sandbox");

        if !force {
            if self.state == SandboxState::Paused {
                if let Err(e) = self.hypervisor.resume().await {
                    tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to resume before stop");
                }
            }
            self.stop_containers(grace).await;
        }

        let result = self.hypervisor.shutdown(force, grace).await;

        self.agent = None;
        self.vm = None;
        for container in &mut self.containers {
            container.cancel_io();
            if container.state() != ContainerState::Stopped {
                container.set_state(ContainerState::Stopped);
            }
        }
        self.devices.vm_stopped();

        if let Err(e) = result {
            let e = CoreError::from(e);
            self.mark_failed(&e).await;
            return Err(e);
        }

        self.state = SandboxState::Stopped;
        tracing::info!(sandbox_id = %self.id, "Sandbox stopped");
        self.persist().await
    }

    /// Best-effort graceful shutdown of every running container.
    async fn stop_containers(&mut self, grace: Duration) {
        let Some(agent) = self.agent.clone() else {
            return;
        };
        let deadline = Instant::now() + grace;

        let running: Vec<ContainerId> = self
            .containers
            .iter()
            .rev()
            .filter(|c| c.state() == ContainerState::Running)
            .map(|c| c.id())
            .collect();

        for id in running {
            let remaining = deadline.saturating_duration_since(Instant::now());
            terminate(&agent, id, remaining).await;
            if let Ok(idx) = self.container_index(id) {
                self.containers[idx].set_state(ContainerState::Stopped);
            }
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        if let Err(e) = agent.destroy_sandbox(remaining.max(KILL_TIMEOUT)).await {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Guest did not acknowledge shutdown");
        }
    }

    /// Release everything and delete the record.
    pub(crate) async fn remove(&mut self) -> Result<()> {
        match self.state {
            SandboxState::Removed => return Ok(()),
            SandboxState::Created | SandboxState::Stopped | SandboxState::Failed => {}
            other => return Err(CoreError::transition("remove", other)),
        }

        tracing::info!(sandbox_id = %self.id, state = %self.state, "Removing sandbox");

        if self.hypervisor.is_alive().await {
            tracing::warn!(sandbox_id = %self.id, "VM still alive, killing it");
            self.hypervisor.shutdown(true, Duration::ZERO).await?;
        }
        self.agent = None;
        self.vm = None;

        for container in &mut self.containers {
            container.cancel_io();
        }
        self.containers.clear();
        self.devices.clear();

        self.services
            .network
            .teardown(self.id, &self.endpoints)
            .await;
        self.endpoints.clear();

        self.services.store.delete(self.id).await?;
        self.state = SandboxState::Removed;
        self.publish();
        tracing::info!(sandbox_id = %self.id, "Sandbox removed");
        Ok(())
    }

    /// Drop the agent connection and stream pumps, leaving the VM running.
    pub(crate) fn detach(&mut self) {
        for container in &mut self.containers {
            container.cancel_io();
        }
        self.agent = None;
    }

    /// Resize a running VM and bring the new resources online in the guest.
    pub(crate) async fn update_resources(&mut self, vcpus: u8, memory_mib: u32) -> Result<()> {
        self.require_running("update resources")?;
        if !self.hypervisor.capabilities().live_resize {
            return Err(CoreError::ResizeUnsupported(self.backend));
        }
        if vcpus == 0 || vcpus > self.spec.max_vcpus {
            return Err(CoreError::InvalidSpec(format!(
                "vcpus must be 1-{}, got {vcpus}",
                self.spec.max_vcpus
            )));
        }
        if memory_mib < skerry_vm::MIN_MEMORY_MIB || memory_mib > self.spec.max_memory_mib {
            return Err(CoreError::InvalidSpec(format!(
                "memory_mib must be {}-{}, got {memory_mib}",
                skerry_vm::MIN_MEMORY_MIB,
                self.spec.max_memory_mib
            )));
        }

        let agent = self.agent()?;
        self.hypervisor.resize(vcpus, memory_mib).await?;
        self.spec.vcpus = vcpus;
        self.spec.memory_mib = memory_mib;
        self.persist().await?;

        agent
            .online_resources(vcpus, memory_mib, self.services.config.rpc_timeout)
            .await?;
        tracing::info!(sandbox_id = %self.id, vcpus, memory_mib, "Sandbox resized");
        Ok(())
    }

    /// Ask the guest whether it is healthy.
    pub(crate) fn health_probe(&self) -> Result<(AgentClient, Duration)> {
        self.require_running("check health")?;
        Ok((self.agent()?, self.services.config.rpc_timeout))
    }

    /// Hotplug a device and wait until the guest sees it.
    pub(crate) async fn attach_device(
        &mut self,
        request: &DeviceRequest,
        container: Option<ContainerId>,
    ) -> Result<DeviceId> {
        self.require_running("attach device")?;
        let container_idx = container.map(|c| self.container_index(c)).transpose()?;

        let caps = self.hypervisor.capabilities();
        if !caps.can_hotplug(request.kind) {
            return Err(CoreError::UnsupportedDevice(format!(
                "{} cannot be hotplugged on {}",
                request.kind, self.backend
            )));
        }

        let (id, _) = self.hotplug(request, container).await?;
        if let Some(idx) = container_idx {
            self.containers[idx].add_device(id);
        }
        self.persist().await?;
        Ok(id)
    }

    /// Request, attach and await one device. Nothing stays attached on failure.
    async fn hotplug(
        &mut self,
        request: &DeviceRequest,
        container: Option<ContainerId>,
    ) -> Result<(DeviceId, GuestDevice)> {
        let agent = self.agent()?;
        let id = self.devices.request(request, container, false)?;
        // a failed attach leaves its descriptor in `Failed` for diagnostics
        let address = self
            .devices
            .attach(id, self.hypervisor.as_mut(), true)
            .await?;

        if let Err(e) = agent
            .wait_device(address.as_str(), self.services.config.rpc_timeout)
            .await
        {
            tracing::warn!(sandbox_id = %self.id, device_id = %id, error = %e, "Guest never saw device");
            if let Err(release) = self.devices.release(id, Some(self.hypervisor.as_mut())).await {
                tracing::warn!(sandbox_id = %self.id, device_id = %id, error = %release, "Failed to detach unused device");
            }
            return Err(e);
        }

        let guest = GuestDevice {
            address: address.to_string(),
            kind: request.kind.to_string(),
            container_path: request.container_path.clone(),
        };
        Ok((id, guest))
    }

    /// Detach a device. Devices of a running container stay attached.
    pub(crate) async fn release_device(&mut self, id: DeviceId) -> Result<()> {
        let owner = self
            .devices
            .get(id)
            .ok_or_else(|| CoreError::NotFound(format!("device {id}")))?
            .container_id;
        if let Some(owner) = owner {
            if let Ok(idx) = self.container_index(owner) {
                let state = self.containers[idx].state();
                if state == ContainerState::Running {
                    return Err(CoreError::transition("release device of", "running container"));
                }
                self.containers[idx].remove_device(id);
            }
        }

        match self.state {
            SandboxState::Running => {
                self.devices
                    .release(id, Some(self.hypervisor.as_mut()))
                    .await?
            }
            SandboxState::Paused => return Err(CoreError::transition("release device", self.state)),
            _ => self.devices.release(id, None).await?,
        }
        self.persist().await
    }

    /// Create a container, hotplugging its devices first.
    pub(crate) async fn create_container(&mut self, spec: ContainerSpec) -> Result<ContainerId> {
        self.require_running("create container")?;
        spec.validate()?;
        let agent = self.agent()?;
        let id = ContainerId::new();

        let mut attached = Vec::new();
        let mut guest_devices = Vec::new();
        for request in &spec.devices {
            match self.hotplug(request, Some(id)).await {
                Ok((device_id, guest)) => {
                    attached.push(device_id);
                    guest_devices.push(guest);
                }
                Err(e) => {
                    self.release_quietly(&attached).await;
                    return Err(e);
                }
            }
        }

        let params = CreateContainerParams {
            container_id: id.to_string(),
            process: spec.process.clone(),
            mounts: spec.mounts.clone(),
            devices: guest_devices,
        };
        if let Err(e) = agent
            .create_container(&params, self.services.config.rpc_timeout)
            .await
        {
            self.release_quietly(&attached).await;
            return Err(e);
        }

        self.containers
            .push(Container::new(id, self.id, spec, attached));
        tracing::info!(sandbox_id = %self.id, container_id = %id, "Container created");
        self.persist().await?;
        Ok(id)
    }

    async fn release_quietly(&mut self, devices: &[DeviceId]) {
        if let Err(e) = self
            .devices
            .release_many(devices, Some(self.hypervisor.as_mut()))
            .await
        {
            tracing::warn!(sandbox_id = %self.id, error = %e, "Failed to release container devices");
        }
    }

    pub(crate) async fn start_container(&mut self, id: ContainerId) -> Result<()> {
        self.require_running("start container")?;
        let idx = self.container_index(id)?;
        match self.containers[idx].state() {
            ContainerState::Running => return Ok(()),
            ContainerState::Created => {}
            other => return Err(CoreError::transition("start container", other)),
        }

        self.agent()?
            .start_container(&id.to_string(), self.services.config.rpc_timeout)
            .await?;
        self.containers[idx].set_state(ContainerState::Running);
        tracing::info!(sandbox_id = %self.id, container_id = %id, "Container started");
        self.persist().await
    }

    /// SIGTERM the container's init process, SIGKILL after the stop timeout.
    pub(crate) async fn stop_container(&mut self, id: ContainerId) -> Result<()> {
        self.require_running("stop container")?;
        let idx = self.container_index(id)?;
        match self.containers[idx].state() {
            ContainerState::Stopped => return Ok(()),
            ContainerState::Created => {}
            ContainerState::Running => {
                terminate(&self.agent()?, id, self.services.config.stop_timeout).await;
            }
        }

        self.containers[idx].cancel_io();
        self.containers[idx].set_state(ContainerState::Stopped);
        tracing::info!(sandbox_id = %self.id, container_id = %id, "Container stopped");
        self.persist().await
    }

    /// Remove a stopped or never started container and its devices.
    pub(crate) async fn remove_container(&mut self, id: ContainerId) -> Result<()> {
        let idx = self.container_index(id)?;
        if self.containers[idx].state() == ContainerState::Running {
            return Err(CoreError::transition("remove container", ContainerState::Running));
        }

        let devices = self.devices.owned_by(id);
        match self.state {
            SandboxState::Running => {
                self.agent()?
                    .remove_container(&id.to_string(), self.services.config.rpc_timeout)
                    .await?;
                self.devices
                    .release_many(&devices, Some(self.hypervisor.as_mut()))
                    .await?;
            }
            SandboxState::Paused => {
                return Err(CoreError::transition("remove container", self.state))
            }
            // no VM: nothing to tell the guest or the VMM
            _ => self.devices.release_many(&devices, None).await?,
        }

        let mut container = self.containers.remove(idx);
        container.cancel_io();
        tracing::info!(sandbox_id = %self.id, container_id = %id, "Container removed");
        self.persist().await
    }

    /// Reserve an exec id and hand out what is needed to run the process
    /// outside the sandbox lock.
    ///
    /// The counter is persisted before the id is used, so a restarted
    /// runtime never hands out an id a guest process may still carry.
    pub(crate) async fn prepare_exec(&mut self, id: ContainerId) -> Result<ExecContext> {
        self.require_running("exec")?;
        let agent = self.agent()?;
        let idx = self.container_index(id)?;
        let container = &mut self.containers[idx];
        if container.state() != ContainerState::Running {
            return Err(CoreError::transition("exec in", container.state()));
        }
        let exec_id = container.next_exec_id();
        let io = container.io_token();
        self.persist().await?;

        Ok(ExecContext {
            agent,
            exec_id,
            io,
            rpc_timeout: self.services.config.rpc_timeout,
        })
    }

    /// Agent handle for signalling a container's init process.
    pub(crate) fn prepare_signal(&self, id: ContainerId) -> Result<(AgentClient, Duration)> {
        self.require_running("signal")?;
        let idx = self.container_index(id)?;
        if self.containers[idx].state() != ContainerState::Running {
            return Err(CoreError::transition("signal", self.containers[idx].state()));
        }
        Ok((self.agent()?, self.services.config.rpc_timeout))
    }
}

/// SIGTERM a container's init process and wait; SIGKILL if it outlives
/// `grace`.
async fn terminate(agent: &AgentClient, id: ContainerId, grace: Duration) {
    let process = ProcessParams {
        container_id: id.to_string(),
        exec_id: String::new(),
    };
    let deadline = Instant::now() + grace;

    let graceful = match agent.signal_process(&process, SIGTERM, grace).await {
        Ok(()) => agent
            .wait_process(&process, deadline.saturating_duration_since(Instant::now()))
            .await
            .map(|code| tracing::debug!(container_id = %id, exit_code = code, "Container exited")),
        Err(e) => Err(e),
    };

    if let Err(e) = graceful {
        tracing::warn!(container_id = %id, error = %e, "Container did not stop in time, killing");
        if let Err(e) = agent.signal_process(&process, SIGKILL, KILL_TIMEOUT).await {
            tracing::warn!(container_id = %id, error = %e, "Failed to kill container");
        }
    }
}

/// Stand-in for a backend that cannot be instantiated on this host, so a
/// recovered sandbox can still be reported and removed.
struct Unavailable {
    kind: BackendKind,
    reason: String,
}

impl Unavailable {
    fn error(&self) -> VmError {
        VmError::Config(format!("{} unavailable: {}", self.kind, self.reason))
    }
}

#[async_trait]
impl Hypervisor for Unavailable {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            coldplug: &[],
            hotplug: &[],
            live_resize: false,
            pause: false,
        }
    }

    fn handle(&self) -> Option<&VmHandle> {
        None
    }

    async fn boot(&mut self, _spec: &VmSpec) -> skerry_vm::Result<VmHandle> {
        Err(self.error())
    }

    async fn reattach(
        &mut self,
        _handle: &VmHandle,
        _paused: bool,
        _devices: &[AttachedDevice],
    ) -> skerry_vm::Result<()> {
        Err(self.error())
    }

    async fn attach(&mut self, _device: &DeviceSpec) -> skerry_vm::Result<BusAddress> {
        Err(self.error())
    }

    async fn detach(&mut self, _address: &BusAddress) -> skerry_vm::Result<()> {
        Ok(())
    }

    async fn resize(&mut self, _vcpus: u8, _memory_mib: u32) -> skerry_vm::Result<()> {
        Err(self.error())
    }

    async fn pause(&mut self) -> skerry_vm::Result<()> {
        Err(self.error())
    }

    async fn resume(&mut self) -> skerry_vm::Result<()> {
        Err(self.error())
    }

    async fn shutdown(&mut self, _force: bool, _grace: Duration) -> skerry_vm::Result<()> {
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        false
    }

    async fn connect_agent(&self, _timeout: Duration) -> skerry_vm::Result<GuestChannel> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serde_and_display() {
        let json = serde_json::to_string(&SandboxState::Failed).unwrap();
        assert_eq!(json, "\"failed\"");
        let back: SandboxState = serde_json::from_str("\"paused\"").unwrap();
        assert_eq!(back, SandboxState::Paused);
        assert_eq!(SandboxState::Stopped.to_string(), "stopped");
    }

    #[test]
    fn test_has_vm() {
        assert!(SandboxState::Running.has_vm());
        assert!(SandboxState::Paused.has_vm());
        assert!(!SandboxState::Created.has_vm());
        assert!(!SandboxState::Failed.has_vm());
    }

    #[test]
    fn test_sandbox_id_parse() {
        let id = SandboxId::new();
        assert_eq!(id.to_string().parse::<SandboxId>().unwrap(), id);
        assert!("not-a-uuid".parse::<SandboxId>().is_err());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_removable() {
        let mut hv = Unavailable {
            kind: BackendKind::CloudHypervisor,
            reason: "binary missing".into(),
        };
        assert!(!hv.is_alive().await);
        hv.shutdown(true, Duration::ZERO).await.unwrap();
        assert!(matches!(hv.pause().await, Err(VmError::Config(_))));
    }
}
