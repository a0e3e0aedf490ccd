//! Containers: isolated process groups running inside a sandbox's guest.

use crate::device::{DeviceId, DeviceRequest};
use crate::error::{CoreError, Result};
use crate::sandbox::SandboxId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique container identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContainerId(Uuid);

impl ContainerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ContainerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContainerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// A process to run inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Program and arguments
    pub args: Vec<String>,
    /// Environment in `KEY=VALUE` form
    #[serde(default)]
    pub env: Vec<String>,
    /// Working directory inside the container
    #[serde(default = "default_cwd")]
    pub cwd: String,
}

fn default_cwd() -> String {
    "/".to_string()
}

impl ProcessSpec {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: default_cwd(),
        }
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn cwd(mut self, dir: impl Into<String>) -> Self {
        self.cwd = dir.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.args.first().map_or(true, |a| a.is_empty()) {
            return Err(CoreError::InvalidSpec("process args must not be empty".into()));
        }
        if let Some(bad) = self.env.iter().find(|e| !e.contains('=')) {
            return Err(CoreError::InvalidSpec(format!(
                "environment entry {bad:?} is not KEY=VALUE"
            )));
        }
        Ok(())
    }
}

/// A filesystem mount inside the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub source: String,
    pub destination: String,
    #[serde(default)]
    pub fstype: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// What to run and what it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// The container's init process
    pub process: ProcessSpec,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    /// Devices hotplugged for this container
    #[serde(default)]
    pub devices: Vec<DeviceRequest>,
}

impl ContainerSpec {
    pub fn new(process: ProcessSpec) -> Self {
        Self {
            process,
            mounts: Vec::new(),
            devices: Vec::new(),
        }
    }

    pub fn mount(mut self, mount: Mount) -> Self {
        self.mounts.push(mount);
        self
    }

    pub fn device(mut self, request: DeviceRequest) -> Self {
        self.devices.push(request);
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.process.validate()?;
        if let Some(m) = self.mounts.iter().find(|m| !m.destination.starts_with('/')) {
            return Err(CoreError::InvalidSpec(format!(
                "mount destination {:?} must be absolute",
                m.destination
            )));
        }
        Ok(())
    }
}

/// A container tracked by its sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    id: ContainerId,
    sandbox_id: SandboxId,
    state: ContainerState,
    spec: ContainerSpec,
    /// Devices owned by this container
    devices: Vec<DeviceId>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    exec_counter: u64,
    /// Parent of every I/O stream opened for this container
    #[serde(skip)]
    io: CancellationToken,
}

impl Container {
    pub(crate) fn new(
        id: ContainerId,
        sandbox_id: SandboxId,
        spec: ContainerSpec,
        devices: Vec<DeviceId>,
    ) -> Self {
        Self {
            id,
            sandbox_id,
            state: ContainerState::Created,
            spec,
            devices,
            created_at: Utc::now(),
            exec_counter: 0,
            io: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> ContainerId {
        self.id
    }

    pub fn sandbox_id(&self) -> SandboxId {
        self.sandbox_id
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn spec(&self) -> &ContainerSpec {
        &self.spec
    }

    pub fn devices(&self) -> &[DeviceId] {
        &self.devices
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn set_state(&mut self, state: ContainerState) {
        tracing::debug!(container_id = %self.id, from = %self.state, to = %state, "Container state change");
        self.state = state;
    }

    pub(crate) fn add_device(&mut self, id: DeviceId) {
        self.devices.push(id);
    }

    pub(crate) fn remove_device(&mut self, id: DeviceId) {
        self.devices.retain(|d| *d != id);
    }

    /// Allocate an id for a new exec'd process.
    pub(crate) fn next_exec_id(&mut self) -> String {
        self.exec_counter += 1;
        format!("exec-{}", self.exec_counter)
    }

    /// Token for a new I/O stream; cancelled when the container stops.
    pub(crate) fn io_token(&self) -> CancellationToken {
        self.io.child_token()
    }

    /// Cancel every open I/O stream.
    pub(crate) fn cancel_io(&mut self) {
        self.io.cancel();
        self.io = CancellationToken::new();
    }
}
