//! Hybrid vsock: the host side of the guest agent channel.
//!
//! Firecracker and Cloud Hypervisor both expose guest vsock ports through a
//! Unix socket on the host. A client connects to the socket, writes
//! `CONNECT <port>\n` and receives `OK <host_port>\n` once the guest accepts.

use crate::api;
use crate::config::VsockConfig;
use crate::error::{Result, VmError};
use crate::hypervisor::GuestChannel;
use firepilot_models::models::Vsock;
use hyper::Method;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

/// Guest port the agent listens on.
pub const AGENT_PORT: u32 = 1024;

/// Interval between connection retry attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Longest handshake reply we accept.
const MAX_REPLY_LEN: usize = 64;

/// Configure vsock on a Firecracker instance before it starts.
///
/// This sends a PUT request to `/vsock` on the Firecracker API socket.
pub async fn configure_vsock(socket_path: &Path, config: &VsockConfig) -> Result<()> {
    let start = Instant::now();
    tracing::debug!(
        cid = config.guest_cid,
        uds_path = %config.uds_path.display(),
        socket = %socket_path.display(),
        "Configuring vsock"
    );

    let vsock = Vsock::new(
        config.guest_cid as i32,
        config.uds_path.to_string_lossy().to_string(),
    );
    api::send_json(socket_path, Method::PUT, "/vsock", &vsock).await?;

    tracing::info!(
        cid = config.guest_cid,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "vsock configured successfully"
    );
    Ok(())
}

/// Connect to `port` in the guest through the hybrid vsock socket.
///
/// The guest agent may not be listening yet right after boot, so the
/// connection is retried every 100ms until `timeout` elapses.
pub async fn connect_guest(uds_path: &Path, port: u32, timeout: Duration) -> Result<GuestChannel> {
    let start = Instant::now();
    tracing::debug!(path = %uds_path.display(), port, "Connecting to guest");

    let mut attempts = 0u32;
    loop {
        attempts += 1;
        match try_connect(uds_path, port).await {
            Ok(stream) => {
                tracing::info!(
                    path = %uds_path.display(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    attempts,
                    "Connected to guest"
                );
                return Ok(Box::new(stream));
            }
            Err(e) => {
                if start.elapsed() >= timeout {
                    tracing::warn!(
                        path = %uds_path.display(),
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        attempts,
                        error = %e,
                        "Guest connection timeout"
                    );
                    return Err(VmError::Timeout(timeout));
                }
                tracing::trace!(error = %e, attempt = attempts, "Connection attempt failed, retrying...");
                tokio::time::sleep(RETRY_INTERVAL).await;
            }
        }
    }
}

/// Attempt a single connection and handshake.
async fn try_connect(uds_path: &Path, port: u32) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(uds_path)
        .await
        .map_err(|e| VmError::Connect(format!("socket connect failed: {e}")))?;

    stream
        .write_all(format!("CONNECT {port}\n").as_bytes())
        .await
        .map_err(|e| VmError::Connect(format!("handshake write failed: {e}")))?;
    stream.flush().await?;

    // Read byte-wise so nothing past the reply line is consumed
    let mut reply = Vec::with_capacity(16);
    loop {
        let byte = stream
            .read_u8()
            .await
            .map_err(|e| VmError::Connect(format!("handshake read failed: {e}")))?;
        if byte == b'\n' {
            break;
        }
        reply.push(byte);
        if reply.len() > MAX_REPLY_LEN {
            return Err(VmError::Connect("handshake reply too long".into()));
        }
    }

    let reply = String::from_utf8_lossy(&reply);
    if !reply.starts_with("OK ") {
        tracing::debug!(response = %reply.trim(), "Handshake failed");
        return Err(VmError::Connect(format!("handshake failed: {}", reply.trim())));
    }

    tracing::debug!(response = %reply.trim(), "vsock handshake successful");
    Ok(stream)
}
