//! Runtime context: the registry of sandboxes and the control API.
//!
//! Each sandbox sits behind its own exclusive lock; operations on
//! different sandboxes never wait on each other. Status reads go through
//! a watch channel and never take the lock.

use crate::agent::protocol::{ExecProcessParams, ProcessParams};
use crate::agent::ProcessHandle;
use crate::config::{RuntimeConfig, SandboxSpec};
use crate::container::{ContainerId, ContainerSpec, ProcessSpec};
use crate::device::{DeviceId, DeviceRequest};
use crate::error::{CoreError, Result};
use crate::network::{IpCommandDriver, NetworkDriver, NetworkSetup};
use crate::sandbox::{Sandbox, SandboxId, SandboxState, SandboxStatus};
use crate::store::{SandboxRecord, Store};
use skerry_vm::{DefaultProvider, HypervisorProvider};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::{watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Shared collaborators every sandbox uses.
pub(crate) struct Services {
    pub config: RuntimeConfig,
    pub store: Store,
    pub network: NetworkSetup,
    pub provider: Arc<dyn HypervisorProvider>,
}

struct SandboxCell {
    sandbox: Arc<Mutex<Sandbox>>,
    status: watch::Receiver<SandboxStatus>,
}

impl SandboxCell {
    fn new(sandbox: Sandbox) -> Self {
        let status = sandbox.subscribe();
        Self {
            sandbox: Arc::new(Mutex::new(sandbox)),
            status,
        }
    }
}

/// Outcome of loading persisted sandboxes at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sandboxes reattached to a live VM
    pub reattached: usize,
    /// Sandboxes with no VM, restored as recorded
    pub restored: usize,
    /// Sandboxes that could not be reattached and are now failed
    pub failed: usize,
    /// Records that could not be used at all
    pub skipped: usize,
}

/// Keeps an id reserved while its sandbox is being created.
struct Reservation<'a> {
    set: &'a StdMutex<HashSet<SandboxId>>,
    id: SandboxId,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

/// The sandbox orchestration engine.
pub struct Runtime {
    services: Arc<Services>,
    sandboxes: RwLock<HashMap<SandboxId, Arc<SandboxCell>>>,
    reserved: StdMutex<HashSet<SandboxId>>,
    cid_counter: AtomicU32,
}

impl Runtime {
    /// Create a runtime with explicit backend and network collaborators.
    pub fn new(
        config: RuntimeConfig,
        provider: Arc<dyn HypervisorProvider>,
        driver: Arc<dyn NetworkDriver>,
    ) -> Self {
        let cid_counter = AtomicU32::new(config.first_cid.max(3));
        Self {
            services: Arc::new(Services {
                store: Store::new(&config.state_dir),
                network: NetworkSetup::new(driver),
                provider,
                config,
            }),
            sandboxes: RwLock::new(HashMap::new()),
            reserved: StdMutex::new(HashSet::new()),
            cid_counter,
        }
    }

    /// Create a runtime using the installed VMM binaries and `ip`.
    pub fn from_config(config: RuntimeConfig) -> Self {
        let provider = Arc::new(DefaultProvider::new(
            &config.firecracker_bin,
            &config.cloud_hypervisor_bin,
        ));
        let driver = Arc::new(IpCommandDriver::new(&config.ip_bin));
        Self::new(config, provider, driver)
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.services.config
    }

    /// Prepare directories and recover every persisted sandbox.
    pub async fn init(&self) -> Result<RecoveryReport> {
        let config = &self.services.config;
        for dir in [&config.state_dir, &config.run_dir] {
            tokio::fs::create_dir_all(dir).await.map_err(|e| {
                CoreError::ResourceAllocation(format!("create {}: {e}", dir.display()))
            })?;
        }

        let records = self.services.store.load_all().await?;
        tracing::info!(count = records.len(), "Recovering sandboxes");

        let mut report = RecoveryReport::default();
        for record in records {
            let id = record.id;
            let had_vm = record.state.has_vm();
            match self.recover(record).await {
                Ok(state) => match (had_vm, state) {
                    (true, SandboxState::Failed) => report.failed += 1,
                    (true, _) => report.reattached += 1,
                    (false, _) => report.restored += 1,
                },
                Err(e) => {
                    tracing::warn!(sandbox_id = %id, error = %e, "Skipping sandbox record");
                    report.skipped += 1;
                }
            }
        }

        tracing::info!(
            reattached = report.reattached,
            restored = report.restored,
            failed = report.failed,
            skipped = report.skipped,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Rebuild one sandbox from `record` and register it.
    ///
    /// Returns the state the sandbox came back in, which is never
    /// `Created` for a record that had a running VM.
    pub async fn recover(&self, record: SandboxRecord) -> Result<SandboxState> {
        let id = record.id;
        let _reservation = self.reserve(id)?;
        if self.sandboxes.read().await.contains_key(&id) {
            return Err(CoreError::AlreadyExists(format!("sandbox {id}")).in_sandbox(id, None, false));
        }

        self.cid_counter
            .fetch_max(record.vsock_cid.saturating_add(1), Ordering::SeqCst);

        let sandbox = Sandbox::recover(record, Arc::clone(&self.services))
            .await
            .map_err(|e| e.in_sandbox(id, None, false))?;
        let state = sandbox.state();
        self.sandboxes
            .write()
            .await
            .insert(id, Arc::new(SandboxCell::new(sandbox)));
        Ok(state)
    }

    /// Drop every agent connection, leaving VMs running for the next
    /// process to recover.
    pub async fn shutdown(&self) {
        let cells: Vec<_> = self.sandboxes.write().await.drain().collect();
        for (_, cell) in cells {
            cell.sandbox.lock().await.detach();
        }
        tracing::info!("Runtime shut down");
    }

    fn reserve(&self, id: SandboxId) -> Result<Reservation<'_>> {
        let mut reserved = self
            .reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !reserved.insert(id) {
            return Err(
                CoreError::AlreadyExists(format!("sandbox {id} is being created"))
                    .in_sandbox(id, None, false),
            );
        }
        Ok(Reservation {
            set: &self.reserved,
            id,
        })
    }

    async fn cell(&self, id: SandboxId) -> Result<Arc<SandboxCell>> {
        self.sandboxes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| CoreError::NotFound(format!("sandbox {id}")).in_sandbox(id, None, false))
    }

    // Lifecycle

    /// Create a sandbox under a fresh id.
    pub async fn create_sandbox(&self, spec: SandboxSpec) -> Result<SandboxId> {
        self.create_sandbox_with_id(SandboxId::new(), spec).await
    }

    /// Create a sandbox under a caller-chosen id. Fails with
    /// `AlreadyExists` if the id is taken.
    pub async fn create_sandbox_with_id(&self, id: SandboxId, spec: SandboxSpec) -> Result<SandboxId> {
        let _reservation = self.reserve(id)?;
        let exists = self.sandboxes.read().await.contains_key(&id)
            || self
                .services
                .store
                .load(id)
                .await
                .map_err(|e| CoreError::from(e).in_sandbox(id, None, false))?
                .is_some();
        if exists {
            return Err(CoreError::AlreadyExists(format!("sandbox {id}")).in_sandbox(id, None, false));
        }

        let cid = self.cid_counter.fetch_add(1, Ordering::SeqCst);
        let sandbox = Sandbox::create(id, spec, cid, Arc::clone(&self.services))
            .await
            .map_err(|e| e.in_sandbox(id, None, false))?;

        self.sandboxes
            .write()
            .await
            .insert(id, Arc::new(SandboxCell::new(sandbox)));
        Ok(id)
    }

    /// Boot a created sandbox.
    pub async fn start_sandbox(&self, id: SandboxId) -> Result<()> {
        self.start_sandbox_with_cancel(id, &CancellationToken::new())
            .await
    }

    /// Boot a created sandbox, abandoning the boot when `cancel` fires.
    ///
    /// The start runs on its own task so that a cancelled or dropped caller
    /// still gets every partially acquired resource released.
    pub async fn start_sandbox_with_cancel(
        &self,
        id: SandboxId,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut guard = Arc::clone(&cell.sandbox).lock_owned().await;

        let token = cancel.child_token();
        let on_drop = token.clone().drop_guard();
        let task = tokio::spawn(async move {
            let before = guard.revision();
            let result = guard.start(&token).await;
            result.map_err(|e| e.in_sandbox(id, None, guard.revision() != before))
        });

        let result = task.await.map_err(|e| {
            CoreError::Internal(format!("start task failed: {e}")).in_sandbox(id, None, true)
        })?;
        on_drop.disarm();
        result
    }

    pub async fn stop_sandbox(&self, id: SandboxId, force: bool) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.stop(force).await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    pub async fn pause_sandbox(&self, id: SandboxId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.pause().await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    pub async fn resume_sandbox(&self, id: SandboxId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.resume().await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    /// Remove a sandbox and forget it. A removed id is `NotFound` from then on.
    pub async fn remove_sandbox(&self, id: SandboxId) -> Result<()> {
        let cell = self.cell(id).await?;
        {
            let mut sandbox = cell.sandbox.lock().await;
            let before = sandbox.state();
            let result = sandbox.remove().await;
            result.map_err(|e| e.in_sandbox(id, None, sandbox.state() != before))?;
        }
        self.sandboxes.write().await.remove(&id);
        Ok(())
    }

    /// Resize a running sandbox's vCPUs and memory.
    pub async fn update_resources(&self, id: SandboxId, vcpus: u8, memory_mib: u32) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.update_resources(vcpus, memory_mib).await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    /// Probe the guest agent.
    pub async fn check_sandbox(&self, id: SandboxId) -> Result<bool> {
        let cell = self.cell(id).await?;
        let (agent, timeout) = cell
            .sandbox
            .lock()
            .await
            .health_probe()
            .map_err(|e| e.in_sandbox(id, None, false))?;
        agent
            .check(timeout)
            .await
            .map_err(|e| e.in_sandbox(id, None, false))
    }

    // Status

    /// Latest published status of a sandbox.
    pub async fn status_sandbox(&self, id: SandboxId) -> Result<SandboxStatus> {
        let cell = self.cell(id).await?;
        let status = cell.status.borrow().clone();
        Ok(status)
    }

    /// Receiver that observes every status change of a sandbox.
    pub async fn watch_sandbox(&self, id: SandboxId) -> Result<watch::Receiver<SandboxStatus>> {
        Ok(self.cell(id).await?.status.clone())
    }

    /// Latest status of every sandbox, oldest first.
    pub async fn list_sandboxes(&self) -> Vec<SandboxStatus> {
        let mut list: Vec<SandboxStatus> = self
            .sandboxes
            .read()
            .await
            .values()
            .map(|cell| cell.status.borrow().clone())
            .collect();
        list.sort_by_key(|s| s.created_at);
        list
    }

    // Devices

    /// Hotplug a device into a running sandbox, optionally on behalf of a
    /// container.
    pub async fn attach_device(
        &self,
        id: SandboxId,
        request: DeviceRequest,
        container: Option<ContainerId>,
    ) -> Result<DeviceId> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.attach_device(&request, container).await;
        result.map_err(|e| e.in_sandbox(id, container, sandbox.revision() != before))
    }

    pub async fn release_device(&self, id: SandboxId, device: DeviceId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.release_device(device).await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    // Containers

    pub async fn create_container(&self, id: SandboxId, spec: ContainerSpec) -> Result<ContainerId> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.create_container(spec).await;
        result.map_err(|e| e.in_sandbox(id, None, sandbox.revision() != before))
    }

    pub async fn start_container(&self, id: SandboxId, container: ContainerId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.start_container(container).await;
        result.map_err(|e| e.in_sandbox(id, Some(container), sandbox.revision() != before))
    }

    pub async fn stop_container(&self, id: SandboxId, container: ContainerId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.stop_container(container).await;
        result.map_err(|e| e.in_sandbox(id, Some(container), sandbox.revision() != before))
    }

    pub async fn remove_container(&self, id: SandboxId, container: ContainerId) -> Result<()> {
        let cell = self.cell(id).await?;
        let mut sandbox = cell.sandbox.lock().await;
        let before = sandbox.revision();
        let result = sandbox.remove_container(container).await;
        result.map_err(|e| e.in_sandbox(id, Some(container), sandbox.revision() != before))
    }

    /// Start a process in a running container and stream its I/O.
    ///
    /// The sandbox lock is only held while the exec id is reserved.
    pub async fn exec_process(
        &self,
        id: SandboxId,
        container: ContainerId,
        process: ProcessSpec,
    ) -> Result<ProcessHandle> {
        let annotate = |e: CoreError| e.in_sandbox(id, Some(container), false);
        process.validate().map_err(annotate)?;

        let cell = self.cell(id).await?;
        let exec = cell
            .sandbox
            .lock()
            .await
            .prepare_exec(container)
            .await
            .map_err(annotate)?;

        let params = ExecProcessParams {
            container_id: container.to_string(),
            exec_id: exec.exec_id.clone(),
            process,
        };
        exec.agent
            .exec_process(&params, exec.rpc_timeout)
            .await
            .map_err(annotate)?;

        tracing::debug!(sandbox_id = %id, container_id = %container, exec_id = %exec.exec_id, "Process started");
        Ok(ProcessHandle::spawn(
            exec.agent,
            container,
            exec.exec_id,
            exec.io,
            exec.rpc_timeout,
        ))
    }

    /// Deliver a signal to a container's init process.
    pub async fn signal_container(
        &self,
        id: SandboxId,
        container: ContainerId,
        signal: i32,
    ) -> Result<()> {
        let annotate = |e: CoreError| e.in_sandbox(id, Some(container), false);
        let cell = self.cell(id).await?;
        let (agent, timeout) = cell
            .sandbox
            .lock()
            .await
            .prepare_signal(container)
            .map_err(annotate)?;

        let process = ProcessParams {
            container_id: container.to_string(),
            exec_id: String::new(),
        };
        agent
            .signal_process(&process, signal, timeout)
            .await
            .map_err(annotate)
    }
}
