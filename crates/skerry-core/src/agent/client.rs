//! Multiplexed JSON-RPC client for the guest agent.
//!
//! One connection carries any number of concurrent calls. A writer task owns
//! the outbound half so a cancelled caller can never leave half a line on the
//! wire; a reader task routes each response to its waiting caller by id.

use super::protocol::{
    error_codes, major_version, AgentInfo, CheckResult, ContainerParams, CreateContainerParams,
    Empty, ExecProcessParams, OnlineResourcesParams, ProcessParams, ReadStreamResult, Request,
    Response, SignalParams, VersionParams, WaitDeviceParams, WaitResult, WriteStdinParams,
    WriteStdinResult, PROTOCOL_VERSION,
};
use super::stream::OutputStream;
use crate::error::{CoreError, Result};
use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, LinesCodec};
use tokio_util::sync::CancellationToken;

/// Lines queued for the writer task before callers start waiting.
const OUTBOUND_QUEUE: usize = 64;

/// Upper bound on a single message (large stdout chunks are base64).
const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024;

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Response>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Response>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Client for one guest agent connection.
///
/// Cheap to clone; all clones share the connection. The I/O tasks stop when
/// the last clone is dropped.
#[derive(Clone)]
pub struct AgentClient {
    inner: Arc<Inner>,
}

struct Inner {
    outbound: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Removes a call's waiter when the call finishes, times out or is dropped.
struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

impl AgentClient {
    /// Start serving a connected agent channel.
    pub fn new<T>(io: T) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let framed = Framed::new(io, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
        let (mut sink, mut stream) = framed.split();
        let (outbound, mut rx) = mpsc::channel::<String>(OUTBOUND_QUEUE);
        let pending: Pending = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let writer = tokio::spawn({
            let closed = Arc::clone(&closed);
            async move {
                while let Some(line) = rx.recv().await {
                    if let Err(e) = sink.send(line).await {
                        tracing::warn!(error = %e, "Agent connection write failed");
                        break;
                    }
                }
                closed.store(true, Ordering::SeqCst);
            }
        });

        let reader = tokio::spawn({
            let pending = Arc::clone(&pending);
            let closed = Arc::clone(&closed);
            async move {
                while let Some(line) = stream.next().await {
                    let line = match line {
                        Ok(line) => line,
                        Err(e) => {
                            tracing::warn!(error = %e, "Agent connection read failed");
                            break;
                        }
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    tracing::trace!(response = %line, "RPC response body");

                    let response: Response = match serde_json::from_str(&line) {
                        Ok(r) => r,
                        Err(e) => {
                            tracing::warn!(error = %e, "Discarding malformed agent message");
                            continue;
                        }
                    };
                    let Some(id) = response.id else {
                        tracing::warn!(error = ?response.error, "Agent error without request id");
                        continue;
                    };

                    let waiter = lock(&pending).remove(&id);
                    match waiter {
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => tracing::debug!(id, "Response for abandoned request"),
                    }
                }

                closed.store(true, Ordering::SeqCst);
                // Dropping the senders wakes every waiter with a closed error
                lock(&pending).clear();
                tracing::debug!("Agent connection closed");
            }
        });

        Self {
            inner: Arc::new(Inner {
                outbound,
                pending,
                next_id: AtomicU64::new(1),
                closed,
                tasks: vec![writer, reader],
            }),
        }
    }

    /// Whether the connection has gone away.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Call `method` and wait up to `timeout` for its result.
    pub async fn call<P, R>(&self, method: &str, params: P, timeout: Duration) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        self.call_until(method, params, timeout, &CancellationToken::new())
            .await
    }

    /// Call `method`, giving up when `timeout` elapses or `cancel` fires.
    ///
    /// A timed-out call is not retried; its late response is discarded.
    pub async fn call_until<P, R>(
        &self,
        method: &str,
        params: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let params = serde_json::to_value(params)
            .map_err(|e| CoreError::Internal(format!("encode {method} params: {e}")))?;
        let line = serde_json::to_string(&Request::new(id, method, params))
            .map_err(|e| CoreError::Internal(format!("encode {method} request: {e}")))?;

        let (tx, rx) = oneshot::channel();
        lock(&self.inner.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.inner.pending,
            id,
        };
        // The reader sets the flag before clearing waiters, so a waiter
        // registered after the clear is caught here.
        if self.is_closed() {
            return Err(CoreError::AgentClosed);
        }

        tracing::debug!(method, id, "Sending RPC request");
        tracing::trace!(request = %line, "RPC request body");

        let exchange = async {
            self.inner
                .outbound
                .send(line)
                .await
                .map_err(|_| CoreError::AgentClosed)?;
            rx.await.map_err(|_| CoreError::AgentClosed)
        };

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(method, id, "RPC call cancelled");
                return Err(CoreError::Cancelled);
            }
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(response) => response?,
                Err(_) => {
                    tracing::warn!(method, id, timeout_ms = timeout.as_millis() as u64, "RPC response timeout");
                    return Err(CoreError::AgentTimeout {
                        method: method.to_string(),
                        timeout,
                    });
                }
            },
        };

        if let Some(err) = response.error {
            tracing::debug!(method, id, code = err.code, message = %err.message, "Agent returned error");
            return Err(CoreError::Agent {
                code: err.code,
                message: err.message,
            });
        }

        let result = match response.result {
            None | Some(Value::Null) => Value::Object(Default::default()),
            Some(value) => value,
        };
        serde_json::from_value(result).map_err(|e| CoreError::Agent {
            code: error_codes::INTERNAL_ERROR,
            message: format!("unexpected {method} result: {e}"),
        })
    }

    /// Negotiate the protocol version.
    ///
    /// Any failure other than cancellation is reported as a handshake failure.
    pub async fn handshake(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AgentInfo> {
        let params = VersionParams {
            protocol_version: PROTOCOL_VERSION.to_string(),
        };
        let info: AgentInfo = match self.call_until("version", params, timeout, cancel).await {
            Ok(info) => info,
            Err(CoreError::Cancelled) => return Err(CoreError::Cancelled),
            Err(e) => return Err(CoreError::HandshakeFailed(e.to_string())),
        };

        let theirs = major_version(&info.protocol_version);
        if theirs.is_none() || theirs != major_version(PROTOCOL_VERSION) {
            return Err(CoreError::HandshakeFailed(format!(
                "agent speaks protocol {}, host speaks {PROTOCOL_VERSION}",
                info.protocol_version
            )));
        }

        tracing::info!(
            protocol = %info.protocol_version,
            agent_version = %info.agent_version,
            "Agent handshake complete"
        );
        Ok(info)
    }

    /// Ask the agent whether the guest is healthy.
    pub async fn check(&self, timeout: Duration) -> Result<bool> {
        let result: CheckResult = self.call("check", Empty {}, timeout).await?;
        Ok(result.healthy)
    }

    pub async fn create_container(
        &self,
        params: &CreateContainerParams,
        timeout: Duration,
    ) -> Result<()> {
        let _: Empty = self.call("create_container", params, timeout).await?;
        Ok(())
    }

    pub async fn start_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let _: Empty = self
            .call("start_container", container(container_id), timeout)
            .await?;
        Ok(())
    }

    pub async fn remove_container(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let _: Empty = self
            .call("remove_container", container(container_id), timeout)
            .await?;
        Ok(())
    }

    pub async fn exec_process(&self, params: &ExecProcessParams, timeout: Duration) -> Result<()> {
        let _: Empty = self.call("exec_process", params, timeout).await?;
        Ok(())
    }

    pub async fn signal_process(
        &self,
        process: &ProcessParams,
        signal: i32,
        timeout: Duration,
    ) -> Result<()> {
        let params = SignalParams {
            container_id: process.container_id.clone(),
            exec_id: process.exec_id.clone(),
            signal,
        };
        let _: Empty = self.call("signal_process", params, timeout).await?;
        Ok(())
    }

    /// Wait for a process to exit and return its exit code.
    pub async fn wait_process(&self, process: &ProcessParams, timeout: Duration) -> Result<i32> {
        let result: WaitResult = self.call("wait_process", process, timeout).await?;
        Ok(result.exit_code)
    }

    pub async fn write_stdin(
        &self,
        process: &ProcessParams,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        let params = WriteStdinParams {
            container_id: process.container_id.clone(),
            exec_id: process.exec_id.clone(),
            data: general_purpose::STANDARD.encode(data),
        };
        let result: WriteStdinResult = self.call("write_stdin", params, timeout).await?;
        Ok(result.len)
    }

    pub async fn close_stdin(&self, process: &ProcessParams, timeout: Duration) -> Result<()> {
        let _: Empty = self.call("close_stdin", process, timeout).await?;
        Ok(())
    }

    /// Long-poll one output stream. Returns the decoded bytes and whether the
    /// stream reached end of file.
    pub async fn read_output(
        &self,
        stream: OutputStream,
        process: &ProcessParams,
        timeout: Duration,
    ) -> Result<(Bytes, bool)> {
        let result: ReadStreamResult = self.call(stream.method(), process, timeout).await?;
        let data = general_purpose::STANDARD
            .decode(result.data.as_bytes())
            .map_err(|e| CoreError::Agent {
                code: error_codes::INVALID_PARAMS,
                message: format!("undecodable {stream} data: {e}"),
            })?;
        Ok((Bytes::from(data), result.eof))
    }

    /// Tell the agent the sandbox is going away.
    pub async fn destroy_sandbox(&self, timeout: Duration) -> Result<()> {
        let _: Empty = self.call("destroy_sandbox", Empty {}, timeout).await?;
        Ok(())
    }

    /// Bring hot-added vCPUs and memory online inside the guest.
    pub async fn online_resources(
        &self,
        vcpus: u8,
        memory_mib: u32,
        timeout: Duration,
    ) -> Result<()> {
        let params = OnlineResourcesParams { vcpus, memory_mib };
        let _: Empty = self.call("online_resources", params, timeout).await?;
        Ok(())
    }

    /// Wait until the guest has bound a driver to the device at `address`.
    pub async fn wait_device(&self, address: &str, timeout: Duration) -> Result<()> {
        let params = WaitDeviceParams {
            address: address.to_string(),
        };
        let _: Empty = self.call("wait_device", params, timeout).await?;
        Ok(())
    }
}

fn container(container_id: &str) -> ContainerParams {
    ContainerParams {
        container_id: container_id.to_string(),
    }
}

impl std::fmt::Debug for AgentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentClient")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    /// Reads requests from the agent side and hands them to the test.
    async fn next_request(reader: &mut BufReader<tokio::io::ReadHalf<DuplexStream>>) -> Request {
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn reply(writer: &mut tokio::io::WriteHalf<DuplexStream>, response: Response) {
        let mut line = serde_json::to_string(&response).unwrap();
        line.push('\n');
        writer.write_all(line.as_bytes()).await.unwrap();
    }

    fn pair() -> (
        AgentClient,
        BufReader<tokio::io::ReadHalf<DuplexStream>>,
        tokio::io::WriteHalf<DuplexStream>,
    ) {
        let (host, guest) = tokio::io::duplex(64 * 1024);
        let (read, write) = tokio::io::split(guest);
        (AgentClient::new(host), BufReader::new(read), write)
    }

    #[tokio::test]
    async fn test_out_of_order_responses() {
        let (client, mut reader, mut writer) = pair();

        let c1 = client.clone();
        let first = tokio::spawn(async move { c1.wait_process(&proc("a"), Duration::from_secs(5)).await });
        let req1 = next_request(&mut reader).await;
        let c2 = client.clone();
        let second = tokio::spawn(async move { c2.wait_process(&proc("b"), Duration::from_secs(5)).await });
        let req2 = next_request(&mut reader).await;

        // Answer the second call first
        reply(&mut writer, Response::success(req2.id, serde_json::json!({"exit_code": 2}))).await;
        reply(&mut writer, Response::success(req1.id, serde_json::json!({"exit_code": 1}))).await;

        assert_eq!(first.await.unwrap().unwrap(), 1);
        assert_eq!(second.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_timeout_is_not_retried() {
        let (client, mut reader, _writer) = pair();

        let err = client
            .check(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AgentTimeout { ref method, .. } if method == "check"));

        // Exactly one request went out
        let req = next_request(&mut reader).await;
        assert_eq!(req.method, "check");
        let mut line = String::new();
        let more = tokio::time::timeout(Duration::from_millis(50), reader.read_line(&mut line)).await;
        assert!(more.is_err());
        assert!(lock(&client.inner.pending).is_empty());
    }

    #[tokio::test]
    async fn test_agent_error_is_reported() {
        let (client, mut reader, mut writer) = pair();

        let call = tokio::spawn(async move {
            client.start_container("c1", Duration::from_secs(5)).await
        });
        let req = next_request(&mut reader).await;
        reply(&mut writer, Response::error(req.id, error_codes::METHOD_NOT_FOUND, "nope")).await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::Agent { code: error_codes::METHOD_NOT_FOUND, .. }));
    }

    #[tokio::test]
    async fn test_closed_connection_fails_pending_calls() {
        let (client, mut reader, writer) = pair();

        let c = client.clone();
        let call = tokio::spawn(async move { c.check(Duration::from_secs(5)).await });
        let _ = next_request(&mut reader).await;
        drop(writer);
        drop(reader);

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::AgentClosed));
        assert!(client.is_closed());
        assert!(matches!(
            client.check(Duration::from_secs(1)).await.unwrap_err(),
            CoreError::AgentClosed
        ));
    }

    #[tokio::test]
    async fn test_cancelled_call() {
        let (client, _reader, _writer) = pair();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .call_until::<_, Empty>("check", Empty {}, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_handshake_rejects_other_major_version() {
        let (client, mut reader, mut writer) = pair();

        let call = tokio::spawn(async move {
            client
                .handshake(Duration::from_secs(5), &CancellationToken::new())
                .await
        });
        let req = next_request(&mut reader).await;
        assert_eq!(req.method, "version");
        reply(
            &mut writer,
            Response::success(req.id, serde_json::json!({"protocol_version": "2.0"})),
        )
        .await;

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, CoreError::HandshakeFailed(_)));
    }

    #[tokio::test]
    async fn test_handshake_timeout_is_handshake_failure() {
        let (client, _reader, _writer) = pair();
        let err = client
            .handshake(Duration::from_millis(20), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::HandshakeFailed(_)));
    }

    fn proc(container_id: &str) -> ProcessParams {
        ProcessParams {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        }
    }
}
