/// JSON-RPC over a raw socket (delve)
///
/// There is no handshake: a successful call is the proof of readiness.
/// Responses are pulled out of the byte stream with a streaming JSON
/// deserializer, so message boundaries need not line up with newlines or
/// TCP chunks.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;

use crate::communication::{connect_tcp, PendingRequests};
use crate::{ProbeError, Result};

pub const METHOD_GET_VERSION: &str = "RPCServer.GetVersion";
pub const METHOD_COMMAND: &str = "RPCServer.Command";
pub const METHOD_DETACH: &str = "RPCServer.Detach";

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'a str,
    params: &'a Value,
    id: u32,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    id: Option<u32>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<Value>,
}

pub struct JsonRpcClient {
    peer: String,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    pending: PendingRequests<RpcResponse>,
    reader: Mutex<Option<JoinHandle<()>>>,
    detached: AtomicBool,
}

impl JsonRpcClient {
    pub async fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let stream = connect_tcp(host, port, timeout).await?;
        let peer = format!("{}:{}", host, port);
        let (read_half, write_half) = stream.into_split();
        let pending = PendingRequests::new();
        let reader = tokio::spawn(read_loop(read_half, pending.clone(), peer.clone()));

        Ok(JsonRpcClient {
            peer,
            writer: tokio::sync::Mutex::new(Some(write_half)),
            pending,
            reader: Mutex::new(Some(reader)),
            detached: AtomicBool::new(false),
        })
    }

    /// Call `method` and wait for the response with the matching id.
    ///
    /// Without a timeout the call waits until the response arrives or the
    /// connection closes.
    pub async fn call(&self, method: &str, params: Value, timeout: Option<Duration>) -> Result<Value> {
        let (id, receiver) = self.pending.register()?;
        let request = RpcRequest {
            jsonrpc: "2.0",
            method,
            params: &params,
            id,
        };
        let mut line = serde_json::to_vec(&request)
            .map_err(|e| ProbeError::Rpc {
                method: method.to_string(),
                message: format!("failed to serialize request: {}", e),
            })?;
        line.push(b'\n');

        {
            let mut writer = self.writer.lock().await;
            let write = match writer.as_mut() {
                Some(writer) => writer.write_all(&line).await,
                None => Err(std::io::ErrorKind::NotConnected.into()),
            };
            if let Err(e) = write {
                self.pending.remove(id);
                return Err(match e.kind() {
                    std::io::ErrorKind::NotConnected => ProbeError::ConnectionClosed,
                    _ => ProbeError::Io(e),
                });
            }
        }
        log::debug!("SEND[{}]: {} {}", id, method, params);

        let response = match self.pending.wait(id, receiver, timeout).await {
            Err(ProbeError::ProbeTimeout { after }) => {
                log::debug!("RECV[{}]: {} timed out after {:?}", id, method, after);
                return Err(ProbeError::ProbeTimeout { after });
            }
            other => other?,
        };

        match response.error {
            Some(error) if !error.is_null() => Err(ProbeError::Rpc {
                method: method.to_string(),
                message: error_message(&error),
            }),
            _ => Ok(response.result.unwrap_or(Value::Null)),
        }
    }

    /// Query the server version
    pub async fn probe_liveness(&self, timeout: Duration) -> Result<Value> {
        let version = self
            .call(METHOD_GET_VERSION, json!([{}]), Some(timeout))
            .await?;
        log::info!(
            "delve {} live: {}",
            self.peer,
            version
                .get("DelveVersion")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown version")
        );
        Ok(version)
    }

    /// Halt, detach and close; never fails
    pub async fn detach(&self, step_timeout: Duration) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("delve {}: detaching", self.peer);

        if let Err(e) = self
            .call(METHOD_COMMAND, json!([{ "name": "halt" }]), Some(step_timeout))
            .await
        {
            log::warn!("delve {}: halt failed: {}", self.peer, e);
        }
        if let Err(e) = self
            .call(METHOD_DETACH, json!([{ "Kill": false }]), Some(step_timeout))
            .await
        {
            log::warn!("delve {}: detach failed: {}", self.peer, e);
        }
        self.shutdown().await;
    }

    /// Drop the connection without halting the target
    pub async fn close(&self) {
        if self.detached.swap(true, Ordering::SeqCst) {
            return;
        }
        log::debug!("delve {}: closing", self.peer);
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            if let Err(e) = writer.shutdown().await {
                log::debug!("delve {}: socket shutdown failed: {}", self.peer, e);
            }
        }
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
        self.pending.fail_all(|| ProbeError::ConnectionClosed);
    }
}

impl Drop for JsonRpcClient {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().unwrap().take() {
            reader.abort();
        }
    }
}

fn error_message(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        Value::Object(map) => map
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string()),
        other => other.to_string(),
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, pending: PendingRequests<RpcResponse>, peer: String) {
    log::debug!("delve {}: reader started", peer);
    let mut buf: Vec<u8> = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = match read_half.read(&mut chunk).await {
            Ok(0) => {
                log::debug!("delve {}: EOF reached", peer);
                break;
            }
            Ok(n) => n,
            Err(e) => {
                log::error!("delve {}: read error: {}", peer, e);
                break;
            }
        };
        buf.extend_from_slice(&chunk[..n]);

        let mut consumed = 0;
        let mut stream = serde_json::Deserializer::from_slice(&buf).into_iter::<RpcResponse>();
        loop {
            match stream.next() {
                Some(Ok(response)) => {
                    consumed = stream.byte_offset();
                    match response.id {
                        Some(id) => {
                            log::debug!("RECV[{}]: response", id);
                            pending.complete(id, Ok(response));
                        }
                        None => log::debug!("delve {}: response without id ignored", peer),
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    let failure = ProbeError::decode(format!("invalid JSON-RPC message: {}", e), &buf);
                    log::debug!("delve {}: {:?}", peer, failure);
                    if let ProbeError::ProtocolDecode { reason, raw } = failure {
                        pending.fail_all(|| ProbeError::ProtocolDecode {
                            reason: reason.clone(),
                            raw: raw.clone(),
                        });
                    }
                    return;
                }
                None => {
                    consumed = buf.len();
                    break;
                }
            }
        }
        buf.drain(..consumed);
    }

    pending.fail_all(|| ProbeError::ConnectionClosed);
    log::debug!("delve {}: reader finished", peer);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    /// Reads `count` requests, then answers them in reverse order
    async fn reversed_server(count: usize) -> (u16, JoinHandle<Vec<Value>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let requests = read_requests(&mut stream, count).await;
            for request in requests.iter().rev() {
                let reply = json!({
                    "id": request["id"],
                    "result": { "echo": request["method"] },
                    "error": null,
                });
                stream.write_all(reply.to_string().as_bytes()).await.unwrap();
            }
            requests
        });
        (port, handle)
    }

    async fn read_requests(stream: &mut TcpStream, count: usize) -> Vec<Value> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let values: Vec<Value> = serde_json::Deserializer::from_slice(&buf)
                .into_iter::<Value>()
                .filter_map(|v| v.ok())
                .collect();
            if values.len() >= count {
                return values;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client closed early");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[tokio::test]
    async fn test_concurrent_calls_answered_out_of_order() {
        let (port, server) = reversed_server(2).await;
        let client = JsonRpcClient::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            client.call("First", json!([]), Some(Duration::from_secs(2))),
            client.call("Second", json!([]), Some(Duration::from_secs(2))),
        );
        assert_eq!(first.unwrap()["echo"], "First");
        assert_eq!(second.unwrap()["echo"], "Second");

        let requests = server.await.unwrap();
        assert_eq!(requests[0]["jsonrpc"], "2.0");
        assert!(requests.iter().all(|r| r["id"].is_u64()));
    }

    #[tokio::test]
    async fn test_call_times_out_when_server_is_silent() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let client = JsonRpcClient::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        let err = client
            .probe_liveness(Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProbeError::ProbeTimeout { .. }));
    }

    #[tokio::test]
    async fn test_rpc_error_and_split_response() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let _server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let requests = read_requests(&mut stream, 1).await;
            let reply = json!({ "id": requests[0]["id"], "result": null, "error": "process has exited" })
                .to_string();
            let (head, tail) = reply.as_bytes().split_at(7);
            stream.write_all(head).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(tail).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let client = JsonRpcClient::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        match client.call(METHOD_COMMAND, json!([{ "name": "halt" }]), None).await {
            Err(ProbeError::Rpc { method, message }) => {
                assert_eq!(method, METHOD_COMMAND);
                assert_eq!(message, "process has exited");
            }
            other => panic!("Expected rpc error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_detach_sends_halt_then_detach() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            for _ in 0..2 {
                let request = read_requests(&mut stream, 1).await.remove(0);
                let reply = json!({ "id": request["id"], "result": {}, "error": null });
                stream.write_all(reply.to_string().as_bytes()).await.unwrap();
                seen.push(request["method"].as_str().unwrap().to_string());
            }
            seen
        });

        let client = JsonRpcClient::connect("127.0.0.1", port, Duration::from_secs(2))
            .await
            .unwrap();
        client.detach(Duration::from_secs(1)).await;
        client.detach(Duration::from_secs(1)).await;

        let seen = server.await.unwrap();
        assert_eq!(seen, vec![METHOD_COMMAND.to_string(), METHOD_DETACH.to_string()]);
    }
}
