//! JSON-RPC 2.0 wire types for the guest agent protocol.
//!
//! Messages are newline-delimited JSON objects. Requests carry numeric ids
//! and responses may arrive in any order.

use crate::container::ProcessSpec;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version spoken by this host. Guests must share the major version.
pub const PROTOCOL_VERSION: &str = "1.0";

/// JSON-RPC 2.0 standard error codes.
pub mod error_codes {
    /// Parse error - Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// Method not found - The method does not exist / is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid params - Invalid method parameter(s).
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal error - Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 request.
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    /// Protocol version, always "2.0".
    pub jsonrpc: String,
    /// Request identifier.
    pub id: u64,
    /// Method name to invoke.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response.
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub jsonrpc: String,
    /// Request identifier; absent when the agent could not parse the request.
    #[serde(default)]
    pub id: Option<u64>,
    /// Result on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Create a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    /// Create an error response.
    pub fn error(id: u64, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            result: None,
            error: Some(RpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

// Method parameters and results

/// Parameters for the `version` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct VersionParams {
    pub protocol_version: String,
}

/// Result of the `version` method.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Protocol version spoken by the agent ("major.minor").
    pub protocol_version: String,
    /// Agent build version, informational.
    #[serde(default)]
    pub agent_version: String,
    /// Optional features the agent supports.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl AgentInfo {
    /// Whether the agent advertises `capability`.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Result of the `check` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct CheckResult {
    pub healthy: bool,
}

/// A hotplugged or cold-plugged device as the guest sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuestDevice {
    /// Bus address the host attached the device at.
    pub address: String,
    /// Device kind, e.g. "block".
    pub kind: String,
    /// Mount point or device node the container expects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_path: Option<String>,
}

/// Parameters for the `create_container` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateContainerParams {
    pub container_id: String,
    pub process: ProcessSpec,
    #[serde(default)]
    pub mounts: Vec<crate::container::Mount>,
    #[serde(default)]
    pub devices: Vec<GuestDevice>,
}

/// Parameters for methods addressing a container.
#[derive(Debug, Serialize, Deserialize)]
pub struct ContainerParams {
    pub container_id: String,
}

/// Parameters for the `exec_process` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExecProcessParams {
    pub container_id: String,
    pub exec_id: String,
    pub process: ProcessSpec,
}

/// Identifies a process: the container's init process when `exec_id` is empty.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessParams {
    pub container_id: String,
    #[serde(default)]
    pub exec_id: String,
}

/// Parameters for the `signal_process` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct SignalParams {
    pub container_id: String,
    #[serde(default)]
    pub exec_id: String,
    pub signal: i32,
}

/// Result of the `wait_process` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct WaitResult {
    pub exit_code: i32,
}

/// Parameters for the `write_stdin` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteStdinParams {
    pub container_id: String,
    #[serde(default)]
    pub exec_id: String,
    /// Base64-encoded bytes.
    pub data: String,
}

/// Result of the `write_stdin` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct WriteStdinResult {
    pub len: usize,
}

/// Result of `read_stdout` / `read_stderr`.
///
/// The agent holds the request until output is available; an empty `data`
/// without `eof` means the poll expired.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadStreamResult {
    /// Base64-encoded bytes.
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eof: bool,
}

/// Parameters for the `online_resources` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct OnlineResourcesParams {
    pub vcpus: u8,
    pub memory_mib: u32,
}

/// Parameters for the `wait_device` method.
#[derive(Debug, Serialize, Deserialize)]
pub struct WaitDeviceParams {
    pub address: String,
}

/// Result of calls that only acknowledge.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Empty {}

/// Major component of a "major.minor" version string.
pub fn major_version(version: &str) -> Option<u32> {
    version.split('.').next()?.trim().parse().ok()
}
