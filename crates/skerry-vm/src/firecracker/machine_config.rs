//! Machine resources for Firecracker VMs.
//!
//! firepilot's high-level API doesn't expose machine configuration, so the
//! vCPU/memory sizing is sent straight to the API socket.

use crate::api;
use crate::error::{Result, VmError};
use firepilot_models::models::MachineConfiguration;
use hyper::Method;
use std::path::Path;

/// Configure machine resources on a Firecracker instance.
///
/// This sends a PUT request to `/machine-config` on the Firecracker API socket.
/// **Must be called BEFORE starting the VM.** A rejection here almost always
/// means the host cannot back the requested size, so it is reported as a
/// resource error.
pub async fn configure_machine(
    socket_path: &Path,
    vcpu_count: u8,
    mem_size_mib: u32,
) -> Result<()> {
    tracing::debug!(vcpu_count, mem_size_mib, "Configuring machine resources");

    let config = MachineConfiguration::new(mem_size_mib as i32, vcpu_count as i32);
    api::send_json(socket_path, Method::PUT, "/machine-config", &config)
        .await
        .map_err(|e| match e {
            VmError::Api(msg) => VmError::Resource(msg),
            other => other,
        })?;

    tracing::info!(vcpu_count, mem_size_mib, "Machine resources configured");
    Ok(())
}
