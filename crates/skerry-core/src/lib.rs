//! # skerry-core
//!
//! Sandbox orchestration engine for VM-backed skerry sandboxes.
//!
//! This crate owns the lifecycle of each sandbox: a lightweight VM with an
//! in-guest agent and one or more containers running inside it. It keeps
//! the VM, its devices and its host network endpoints consistent with the
//! persisted record, and reattaches to running VMs after a restart.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                   skerry-core (host)                     │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │    Runtime      │────▶│ HashMap<SandboxId,       │   │
//! │  │  - create_*()   │     │   Mutex<Sandbox>>        │   │
//! │  │  - start_*()    │     └──────────────────────────┘   │
//! │  │  - exec_*()     │                │                   │
//! │  └─────────────────┘                ▼                   │
//! │           │              ┌──────────────────────────┐   │
//! │           │              │        Sandbox           │   │
//! │           │              │  Hypervisor (skerry-vm)  │   │
//! │           │              │  DeviceManager           │   │
//! │           │              │  NetworkEndpoints        │   │
//! │           │              │  Containers              │   │
//! │           ▼              └──────────────────────────┘   │
//! │  ┌─────────────────┐                │ vsock             │
//! │  │     Store       │                ▼                   │
//! │  │ <id>/state.json │     ┌──────────────────────────┐   │
//! │  └─────────────────┘     │  AgentClient (JSON-RPC)  │   │
//! │                          └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │                  guest agent (in VM)                     │
//! │              Listening on vsock port 1024                │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use skerry_core::{ContainerSpec, ProcessSpec, Runtime, RuntimeConfig, SandboxSpec};
//!
//! # async fn example() -> skerry_core::Result<()> {
//! let runtime = Runtime::from_config(RuntimeConfig::from_env());
//! runtime.init().await?;
//!
//! let spec = SandboxSpec::builder()
//!     .kernel("/var/lib/skerry/vmlinux")
//!     .rootfs("/var/lib/skerry/rootfs.ext4")
//!     .vcpus(2)
//!     .memory_mib(2048)
//!     .build()?;
//!
//! let id = runtime.create_sandbox(spec).await?;
//! runtime.start_sandbox(id).await?;
//!
//! let container = runtime
//!     .create_container(id, ContainerSpec::new(ProcessSpec::new(["sleep", "infinity"])))
//!     .await?;
//! runtime.start_container(id, container).await?;
//!
//! let mut process = runtime
//!     .exec_process(id, container, ProcessSpec::new(["echo", "hello"]))
//!     .await?;
//! while let Some(chunk) = process.stdout().recv().await {
//!     print!("{}", String::from_utf8_lossy(&chunk));
//! }
//!
//! runtime.stop_sandbox(id, false).await?;
//! runtime.remove_sandbox(id).await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
mod config;
mod container;
mod device;
mod error;
mod network;
mod runtime;
mod sandbox;
mod store;

pub use agent::{AgentClient, AgentInfo, OutputStream, ProcessHandle, PROTOCOL_VERSION};
pub use config::{RuntimeConfig, SandboxSpec, SandboxSpecBuilder};
pub use container::{
    Container, ContainerId, ContainerSpec, ContainerState, Mount, ProcessSpec,
};
pub use device::{AttachState, DeviceDescriptor, DeviceId, DeviceManager, DeviceRequest};
pub use error::{CoreError, Result, Subsystem};
pub use network::{
    EndpointKind, EndpointRequest, IpCommandDriver, NetError, NetworkDriver, NetworkEndpoint,
    NetworkSetup, MAX_IFNAME_LEN,
};
pub use runtime::{RecoveryReport, Runtime};
pub use sandbox::{ContainerStatus, Sandbox, SandboxId, SandboxState, SandboxStatus};
pub use store::{SandboxRecord, Store, StoreError, RECORD_FILE};

// Re-export the backend layer for callers that plug in their own.
pub use skerry_vm;
