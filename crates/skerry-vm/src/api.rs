//! Minimal HTTP-over-UDS client for VMM API sockets.
//!
//! Both backends expose a REST API on a Unix socket; this module sends one
//! request and returns the response body, mapping non-2xx statuses to
//! [`VmError::Api`].

use crate::error::{Result, VmError};
use hyper::{Body, Client, Method, Request};
use hyperlocal::{UnixClientExt, Uri};
use serde::Serialize;
use std::path::Path;

/// Send `method path` with an optional JSON body and return the raw response body.
pub(crate) async fn send(
    socket_path: &Path,
    method: Method,
    path: &str,
    body: Option<String>,
) -> Result<Vec<u8>> {
    tracing::trace!(socket = %socket_path.display(), %method, path, body = ?body, "VMM API request");

    let uri: hyper::Uri = Uri::new(socket_path, path).into();
    let mut builder = Request::builder().method(method.clone()).uri(uri);
    if body.is_some() {
        builder = builder.header("Content-Type", "application/json");
    }
    let request = builder
        .body(body.map(Body::from).unwrap_or_else(Body::empty))
        .map_err(|e| VmError::Config(format!("failed to build {path} request: {e}")))?;

    let client = Client::unix();
    let response = client
        .request(request)
        .await
        .map_err(|e| VmError::Api(format!("{method} {path} request failed: {e}")))?;

    let status = response.status();
    let body_bytes = hyper::body::to_bytes(response.into_body())
        .await
        .map_err(|e| VmError::Api(format!("{method} {path} body read failed: {e}")))?;

    if !status.is_success() {
        let body_str = String::from_utf8_lossy(&body_bytes);
        tracing::debug!(%method, path, status = %status, body = %body_str, "VMM API request rejected");
        return Err(VmError::Api(format!(
            "{method} {path} failed with status {status}: {body_str}"
        )));
    }

    Ok(body_bytes.to_vec())
}

/// Serialize `payload` and send it with `method`.
pub(crate) async fn send_json<T: Serialize>(
    socket_path: &Path,
    method: Method,
    path: &str,
    payload: &T,
) -> Result<Vec<u8>> {
    let body = serde_json::to_string(payload)
        .map_err(|e| VmError::Config(format!("failed to serialize {path} body: {e}")))?;
    send(socket_path, method, path, Some(body)).await
}
