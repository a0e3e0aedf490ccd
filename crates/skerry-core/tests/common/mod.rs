//! Shared fakes for the runtime integration tests.
//!
//! The fake provider boots nothing: it records every call in a shared log,
//! tracks which VMs are "alive" and wires `connect_agent` to a scripted
//! agent running on an in-memory duplex stream.

#![allow(dead_code)]

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde_json::{json, Value};
use skerry_core::agent::protocol::{Request, Response};
use skerry_core::skerry_vm::{
    AttachedDevice, BackendKind, BusAddress, Capabilities, DeviceKind, DeviceSpec, GuestChannel,
    Hypervisor, HypervisorProvider, SlotAllocator, VmError, VmHandle, VmSpec,
};
use skerry_core::{
    EndpointRequest, NetError, NetworkDriver, NetworkEndpoint, Runtime, RuntimeConfig, SandboxSpec,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// How the fake guest agent behaves.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentMode {
    /// Answers every request
    Normal,
    /// Reads requests and never answers
    Silent,
    /// Answers `version` with this protocol version
    Version(String),
}

/// Everything the fakes share with the test body.
#[derive(Debug)]
pub struct World {
    pub log: Vec<String>,
    pub alive: HashSet<String>,
    pub agent: AgentMode,
    pub hotplug: bool,
    pub live_resize: bool,
    pub pause: bool,
    /// Time the VMM takes to boot once its process exists
    pub boot_delay: Option<Duration>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            log: Vec::new(),
            alive: HashSet::new(),
            agent: AgentMode::Normal,
            hotplug: true,
            live_resize: true,
            pause: true,
            boot_delay: None,
        }
    }
}

pub type SharedWorld = Arc<Mutex<World>>;

fn record(world: &SharedWorld, entry: impl Into<String>) {
    world.lock().unwrap().log.push(entry.into());
}

pub struct FakeProvider {
    world: SharedWorld,
}

impl HypervisorProvider for FakeProvider {
    fn create(&self, kind: BackendKind) -> skerry_core::skerry_vm::Result<Box<dyn Hypervisor>> {
        Ok(Box::new(FakeHypervisor {
            kind,
            world: Arc::clone(&self.world),
            handle: None,
            booting: None,
            attached: HashSet::new(),
            slots: SlotAllocator::new(2, 31),
        }))
    }
}

struct FakeHypervisor {
    kind: BackendKind,
    world: SharedWorld,
    handle: Option<VmHandle>,
    /// VM whose process exists but whose boot has not finished
    booting: Option<String>,
    attached: HashSet<BusAddress>,
    slots: SlotAllocator,
}

fn slot_of(address: &BusAddress) -> Option<u32> {
    address
        .as_str()
        .get(8..10)
        .and_then(|s| u32::from_str_radix(s, 16).ok())
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        let world = self.world.lock().unwrap();
        Capabilities {
            coldplug: &[DeviceKind::Block],
            hotplug: if world.hotplug { &[DeviceKind::Block] } else { &[] },
            live_resize: world.live_resize,
            pause: world.pause,
        }
    }

    fn handle(&self) -> Option<&VmHandle> {
        self.handle.as_ref()
    }

    async fn boot(&mut self, spec: &VmSpec) -> skerry_core::skerry_vm::Result<VmHandle> {
        record(&self.world, "hv:boot");
        let delay = {
            let mut world = self.world.lock().unwrap();
            world.alive.insert(spec.vm_id.clone());
            world.boot_delay
        };
        self.booting = Some(spec.vm_id.clone());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let handle = VmHandle {
            vm_id: spec.vm_id.clone(),
            api_socket: spec.work_dir.join(format!("{}.sock", spec.vm_id)),
            agent_socket: spec.work_dir.join(format!("{}.vsock", spec.vm_id)),
            guest_cid: spec.vsock.guest_cid,
            pid: Some(4242),
            max_vcpus: spec.max_vcpus,
            max_memory_mib: spec.max_memory_mib,
        };
        self.booting = None;
        self.handle = Some(handle.clone());
        Ok(handle)
    }

    async fn reattach(
        &mut self,
        handle: &VmHandle,
        _paused: bool,
        devices: &[AttachedDevice],
    ) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:reattach");
        if !self.world.lock().unwrap().alive.contains(&handle.vm_id) {
            return Err(VmError::ProcessGone(handle.vm_id.clone()));
        }
        self.handle = Some(handle.clone());
        for device in devices {
            if let Some(slot) = slot_of(&device.address) {
                self.slots.reserve(slot);
            }
            self.attached.insert(device.address.clone());
        }
        Ok(())
    }

    async fn attach(&mut self, _device: &DeviceSpec) -> skerry_core::skerry_vm::Result<BusAddress> {
        record(&self.world, "hv:attach");
        let slot = self
            .slots
            .allocate()
            .ok_or_else(|| VmError::Hotplug("no free slot".into()))?;
        let address = BusAddress::new(format!("0000:00:{slot:02x}.0"));
        self.attached.insert(address.clone());
        Ok(address)
    }

    async fn detach(&mut self, address: &BusAddress) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:detach");
        if !self.attached.remove(address) {
            if self.handle.is_some() {
                return Err(VmError::Hotplug(format!("no device known at {address}")));
            }
            return Ok(());
        }
        if let Some(slot) = slot_of(address) {
            self.slots.release(slot);
        }
        Ok(())
    }

    async fn resize(&mut self, _vcpus: u8, _memory_mib: u32) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:resize");
        Ok(())
    }

    async fn pause(&mut self) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:pause");
        Ok(())
    }

    async fn resume(&mut self) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:resume");
        Ok(())
    }

    async fn shutdown(&mut self, _force: bool, _grace: Duration) -> skerry_core::skerry_vm::Result<()> {
        record(&self.world, "hv:shutdown");
        let vm_id = self
            .handle
            .take()
            .map(|h| h.vm_id)
            .or_else(|| self.booting.take());
        if let Some(vm_id) = vm_id {
            self.world.lock().unwrap().alive.remove(&vm_id);
        }
        self.attached.clear();
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        match &self.handle {
            Some(handle) => self.world.lock().unwrap().alive.contains(&handle.vm_id),
            None => false,
        }
    }

    async fn connect_agent(&self, _timeout: Duration) -> skerry_core::skerry_vm::Result<GuestChannel> {
        record(&self.world, "hv:connect");
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let mode = self.world.lock().unwrap().agent.clone();
        tokio::spawn(serve_agent(guest, mode, Arc::clone(&self.world)));
        Ok(Box::new(host))
    }
}

/// Scripted guest agent.
async fn serve_agent(guest: tokio::io::DuplexStream, mode: AgentMode, world: SharedWorld) {
    let (read, mut write) = tokio::io::split(guest);
    let mut lines = BufReader::new(read).lines();
    let mut served_stdout = HashSet::new();

    while let Ok(Some(line)) = lines.next_line().await {
        let Ok(req) = serde_json::from_str::<Request>(&line) else {
            continue;
        };
        record(&world, format!("agent:{}", req.method));
        if mode == AgentMode::Silent {
            continue;
        }

        let exec_id = req.params["exec_id"].as_str().unwrap_or_default().to_string();
        let result: Value = match req.method.as_str() {
            "version" => {
                let protocol = match &mode {
                    AgentMode::Version(v) => v.clone(),
                    _ => "1.0".to_string(),
                };
                json!({"protocol_version": protocol, "agent_version": "fake-0.1", "capabilities": []})
            }
            "check" => json!({"healthy": true}),
            "read_stdout" if served_stdout.insert(exec_id.clone()) => {
                json!({"data": general_purpose::STANDARD.encode("hello\n"), "eof": false})
            }
            "read_stdout" | "read_stderr" => json!({"data": "", "eof": true}),
            "write_stdin" => {
                let data = req.params["data"].as_str().unwrap_or_default();
                let len = general_purpose::STANDARD
                    .decode(data)
                    .map(|d| d.len())
                    .unwrap_or(0);
                json!({ "len": len })
            }
            "wait_process" if exec_id.is_empty() => json!({"exit_code": 0}),
            "wait_process" => json!({"exit_code": 42}),
            _ => json!({}),
        };

        let mut out = serde_json::to_string(&Response::success(req.id, result)).unwrap();
        out.push('\n');
        if write.write_all(out.as_bytes()).await.is_err() {
            break;
        }
    }
}

/// Network driver that only tracks which interfaces exist.
#[derive(Default)]
pub struct FakeNetwork {
    pub live: Mutex<HashSet<String>>,
    /// Fail the create call with this zero-based index
    pub fail_create_at: Mutex<Option<usize>>,
    creates: Mutex<usize>,
}

impl FakeNetwork {
    pub fn live_count(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

#[async_trait]
impl NetworkDriver for FakeNetwork {
    async fn create(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError> {
        let index = {
            let mut creates = self.creates.lock().unwrap();
            *creates += 1;
            *creates - 1
        };
        if *self.fail_create_at.lock().unwrap() == Some(index) {
            return Err(NetError::Command {
                command: format!("ip tuntap add {}", endpoint.host_name),
                stderr: "RTNETLINK answers: Operation not permitted".into(),
            });
        }
        self.live.lock().unwrap().insert(endpoint.host_name.clone());
        Ok(())
    }

    async fn delete(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError> {
        self.live.lock().unwrap().remove(&endpoint.host_name);
        Ok(())
    }
}

/// A temp directory with boot images, a shared fake world and a config
/// pointing into it.
pub struct Harness {
    pub dir: TempDir,
    pub world: SharedWorld,
    pub net: Arc<FakeNetwork>,
    pub config: RuntimeConfig,
    kernel: PathBuf,
    rootfs: PathBuf,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_world(World::default())
    }

    pub fn with_world(world: World) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let kernel = dir.path().join("vmlinux");
        let rootfs = dir.path().join("rootfs.ext4");
        std::fs::write(&kernel, b"kernel").unwrap();
        std::fs::write(&rootfs, b"rootfs").unwrap();

        let config = RuntimeConfig {
            state_dir: dir.path().join("state"),
            run_dir: dir.path().join("run"),
            boot_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_millis(500),
            stop_timeout: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(2),
            ..RuntimeConfig::default()
        };

        Self {
            dir,
            world: Arc::new(Mutex::new(world)),
            net: Arc::new(FakeNetwork::default()),
            config,
            kernel,
            rootfs,
        }
    }

    /// A fresh runtime over the shared world and state directory.
    pub fn runtime(&self) -> Runtime {
        let provider = Arc::new(FakeProvider {
            world: Arc::clone(&self.world),
        });
        Runtime::new(self.config.clone(), provider, Arc::clone(&self.net) as Arc<dyn NetworkDriver>)
    }

    /// A one-NIC sandbox spec that can grow to 4 vCPUs and 1 GiB.
    pub fn spec(&self) -> SandboxSpec {
        SandboxSpec::builder()
            .kernel(&self.kernel)
            .rootfs(&self.rootfs)
            .vcpus(1)
            .max_vcpus(4)
            .memory_mib(256)
            .max_memory_mib(1024)
            .endpoint(EndpointRequest::tap())
            .build()
            .unwrap()
    }

    /// Create an empty disk image.
    pub fn disk(&self, name: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, b"").unwrap();
        path
    }

    pub fn log(&self) -> Vec<String> {
        self.world.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.world.lock().unwrap().log.clear();
    }

    pub fn set_agent(&self, mode: AgentMode) {
        self.world.lock().unwrap().agent = mode;
    }

    pub fn alive_vms(&self) -> usize {
        self.world.lock().unwrap().alive.len()
    }

    pub fn kill_all(&self) {
        self.world.lock().unwrap().alive.clear();
    }
}

/// Position of the first log entry equal to `entry`.
pub fn position(log: &[String], entry: &str) -> Option<usize> {
    log.iter().position(|e| e == entry)
}
