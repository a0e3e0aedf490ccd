//! Host-side network endpoints for sandboxes.
//!
//! Setup is all-or-nothing: if any endpoint of a sandbox fails to come up,
//! the ones already created are torn down again before the error is
//! returned. Teardown is best-effort and never stops at the first failure.

use crate::sandbox::SandboxId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;

/// Longest interface name the kernel accepts.
pub const MAX_IFNAME_LEN: usize = 15;

/// Network setup errors.
#[derive(Debug, Error)]
pub enum NetError {
    /// A host command ran and failed
    #[error("`{command}` failed: {stderr}")]
    Command { command: String, stderr: String },

    /// A host command could not be started
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The endpoint request cannot be satisfied as written
    #[error("invalid endpoint: {0}")]
    Invalid(String),
}

/// Kind of host endpoint backing a guest NIC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Tap,
    Macvtap,
    /// Served by an external vhost-user backend
    VhostUser,
}

impl EndpointKind {
    fn prefix(self) -> &'static str {
        match self {
            Self::Tap => "skt",
            Self::Macvtap => "skm",
            Self::VhostUser => "skv",
        }
    }
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tap => write!(f, "tap"),
            Self::Macvtap => write!(f, "macvtap"),
            Self::VhostUser => write!(f, "vhost-user"),
        }
    }
}

/// One guest NIC as requested by a sandbox spec.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointRequest {
    pub kind: EndpointKind,
    /// Guest-side interface name, `eth<N>` by default
    #[serde(default)]
    pub guest_name: Option<String>,
    /// Guest MAC; generated when absent
    #[serde(default)]
    pub mac: Option<String>,
    /// Lower device for macvtap
    #[serde(default)]
    pub parent: Option<String>,
    /// Backend socket for vhost-user
    #[serde(default)]
    pub socket: Option<PathBuf>,
}

impl EndpointRequest {
    pub fn tap() -> Self {
        Self {
            kind: EndpointKind::Tap,
            guest_name: None,
            mac: None,
            parent: None,
            socket: None,
        }
    }

    pub fn macvtap(parent: impl Into<String>) -> Self {
        Self {
            kind: EndpointKind::Macvtap,
            parent: Some(parent.into()),
            ..Self::tap()
        }
    }

    pub fn vhost_user(socket: impl Into<PathBuf>) -> Self {
        Self {
            kind: EndpointKind::VhostUser,
            socket: Some(socket.into()),
            ..Self::tap()
        }
    }

    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }
}

/// A host endpoint that exists for a sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkEndpoint {
    pub kind: EndpointKind,
    /// Host interface name
    pub host_name: String,
    /// Network namespace the interface lives in
    pub netns: Option<String>,
    pub guest_name: String,
    pub guest_mac: String,
    /// Lower device for macvtap
    pub parent: Option<String>,
    /// Backend socket for vhost-user
    pub socket: Option<PathBuf>,
}

impl NetworkEndpoint {
    /// Work out names and addresses for the `index`th endpoint of a sandbox.
    pub fn plan(
        sandbox_id: SandboxId,
        index: usize,
        netns: Option<&str>,
        request: &EndpointRequest,
    ) -> Result<Self, NetError> {
        let simple = sandbox_id.as_uuid().simple().to_string();
        let host_name = format!("{}{}{index}", request.kind.prefix(), &simple[..8]);
        if host_name.len() > MAX_IFNAME_LEN {
            return Err(NetError::Invalid(format!(
                "interface name {host_name} is longer than {MAX_IFNAME_LEN} bytes"
            )));
        }

        let guest_mac = match &request.mac {
            Some(mac) if is_valid_mac(mac) => mac.to_ascii_lowercase(),
            Some(mac) => return Err(NetError::Invalid(format!("malformed MAC address {mac}"))),
            None => generate_mac(sandbox_id, index)?,
        };

        match request.kind {
            EndpointKind::Macvtap if request.parent.is_none() => {
                return Err(NetError::Invalid("macvtap needs a parent device".into()))
            }
            EndpointKind::VhostUser if request.socket.is_none() => {
                return Err(NetError::Invalid("vhost-user needs a socket path".into()))
            }
            _ => {}
        }

        Ok(Self {
            kind: request.kind,
            host_name,
            netns: netns.map(str::to_string),
            guest_name: request
                .guest_name
                .clone()
                .unwrap_or_else(|| format!("eth{index}")),
            guest_mac,
            parent: request.parent.clone(),
            socket: request.socket.clone(),
        })
    }
}

/// Locally administered unicast MAC derived from the sandbox id.
///
/// The last octet is the endpoint index, so at most 256 endpoints get a
/// generated address.
fn generate_mac(sandbox_id: SandboxId, index: usize) -> Result<String, NetError> {
    let last = u8::try_from(index).map_err(|_| {
        NetError::Invalid(format!(
            "endpoint {index} needs an explicit MAC, only 256 can be generated"
        ))
    })?;
    let b = sandbox_id.as_uuid().as_bytes();
    Ok(format!(
        "02:{:02x}:{:02x}:{:02x}:{:02x}:{last:02x}",
        b[0], b[1], b[2], b[3]
    ))
}

fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Creates and deletes host endpoints.
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    /// Create one endpoint. Must leave nothing behind on failure.
    async fn create(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError>;

    /// Delete one endpoint.
    async fn delete(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError>;
}

/// [`NetworkDriver`] built on iproute2.
#[derive(Debug, Clone)]
pub struct IpCommandDriver {
    ip_bin: PathBuf,
}

impl IpCommandDriver {
    pub fn new(ip_bin: impl Into<PathBuf>) -> Self {
        Self {
            ip_bin: ip_bin.into(),
        }
    }

    /// Run `ip` with `args`, inside `netns` when given.
    async fn run(&self, netns: Option<&str>, args: &[&str]) -> Result<(), NetError> {
        let mut cmd = Command::new(&self.ip_bin);
        if let Some(ns) = netns {
            cmd.args(["netns", "exec", ns]).arg(&self.ip_bin);
        }
        cmd.args(args);

        let rendered = render(&self.ip_bin, netns, args);
        tracing::debug!(command = %rendered, "Running ip command");

        let output = cmd.output().await.map_err(|source| NetError::Spawn {
            program: self.ip_bin.display().to_string(),
            source,
        })?;
        if !output.status.success() {
            return Err(NetError::Command {
                command: rendered,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }

    async fn bring_up(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError> {
        let ns = endpoint.netns.as_deref();
        let name = endpoint.host_name.as_str();
        match endpoint.kind {
            EndpointKind::Tap => {
                self.run(ns, &["tuntap", "add", "dev", name, "mode", "tap"])
                    .await?;
            }
            EndpointKind::Macvtap => {
                let parent = endpoint
                    .parent
                    .as_deref()
                    .ok_or_else(|| NetError::Invalid("macvtap needs a parent device".into()))?;
                self.run(
                    None,
                    &["link", "add", "link", parent, "name", name, "type", "macvtap", "mode", "bridge"],
                )
                .await?;
                if let Some(ns) = ns {
                    self.run(None, &["link", "set", "dev", name, "netns", ns])
                        .await?;
                }
                self.run(ns, &["link", "set", "dev", name, "address", &endpoint.guest_mac])
                    .await?;
            }
            EndpointKind::VhostUser => return Ok(()),
        }
        self.run(ns, &["link", "set", "dev", name, "up"]).await
    }
}

fn render(ip_bin: &std::path::Path, netns: Option<&str>, args: &[&str]) -> String {
    let ip = ip_bin.display().to_string();
    let mut parts = vec![ip.clone()];
    if let Some(ns) = netns {
        parts.extend(["netns".to_string(), "exec".to_string(), ns.to_string(), ip]);
    }
    parts.extend(args.iter().map(|a| a.to_string()));
    parts.join(" ")
}

#[async_trait]
impl NetworkDriver for IpCommandDriver {
    async fn create(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError> {
        if let Err(e) = self.bring_up(endpoint).await {
            // a half-configured link may exist
            if endpoint.kind != EndpointKind::VhostUser {
                if let Err(cleanup) = self.delete(endpoint).await {
                    tracing::warn!(host_name = %endpoint.host_name, error = %cleanup, "Failed to delete half-configured endpoint");
                }
            }
            return Err(e);
        }
        tracing::debug!(host_name = %endpoint.host_name, kind = %endpoint.kind, "Endpoint created");
        Ok(())
    }

    async fn delete(&self, endpoint: &NetworkEndpoint) -> Result<(), NetError> {
        match endpoint.kind {
            EndpointKind::VhostUser => Ok(()),
            EndpointKind::Tap | EndpointKind::Macvtap => {
                self.run(
                    endpoint.netns.as_deref(),
                    &["link", "del", "dev", &endpoint.host_name],
                )
                .await
            }
        }
    }
}

/// Configures and tears down all endpoints of a sandbox.
#[derive(Clone)]
pub struct NetworkSetup {
    driver: Arc<dyn NetworkDriver>,
}

impl NetworkSetup {
    pub fn new(driver: Arc<dyn NetworkDriver>) -> Self {
        Self { driver }
    }

    /// Create every requested endpoint, or none of them.
    pub async fn configure(
        &self,
        sandbox_id: SandboxId,
        netns: Option<&str>,
        requests: &[EndpointRequest],
    ) -> Result<Vec<NetworkEndpoint>, NetError> {
        let mut created = Vec::with_capacity(requests.len());

        for (index, request) in requests.iter().enumerate() {
            let result = match NetworkEndpoint::plan(sandbox_id, index, netns, request) {
                Ok(endpoint) => self.driver.create(&endpoint).await.map(|()| endpoint),
                Err(e) => Err(e),
            };
            match result {
                Ok(endpoint) => created.push(endpoint),
                Err(e) => {
                    tracing::warn!(%sandbox_id, index, error = %e, "Endpoint setup failed, rolling back");
                    self.teardown(sandbox_id, &created).await;
                    return Err(e);
                }
            }
        }

        if !created.is_empty() {
            tracing::info!(%sandbox_id, count = created.len(), "Network endpoints configured");
        }
        Ok(created)
    }

    /// Delete endpoints in reverse creation order. Returns how many could
    /// not be deleted.
    pub async fn teardown(&self, sandbox_id: SandboxId, endpoints: &[NetworkEndpoint]) -> usize {
        let mut failed = 0;
        for endpoint in endpoints.iter().rev() {
            if let Err(e) = self.driver.delete(endpoint).await {
                failed += 1;
                tracing::warn!(%sandbox_id, host_name = %endpoint.host_name, error = %e, "Failed to delete endpoint");
            }
        }
        if !endpoints.is_empty() {
            tracing::debug!(%sandbox_id, count = endpoints.len(), failed, "Network endpoints torn down");
        }
        failed
    }
}

impl fmt::Debug for NetworkSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkSetup").finish_non_exhaustive()
    }
}
