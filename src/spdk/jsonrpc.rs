//! JSON-RPC 2.0 Transport
//!
//! SPDK serves JSON-RPC on a Unix domain socket. Responses are not
//! newline delimited, so the reader accumulates bytes until one complete
//! JSON object decodes.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;

const READ_CHUNK: usize = 4096;

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
}

// =============================================================================
// Transport Ports
// =============================================================================

/// One established connection to the storage engine
#[async_trait]
pub trait RpcTransport: Send + Sync {
    /// Issue `method` and return its `result`, or `Error::Rpc` for an error reply
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value>;

    /// True once the underlying connection has failed
    fn is_closed(&self) -> bool;
}

pub type RpcTransportRef = Arc<dyn RpcTransport>;

/// Opens new connections to the storage engine
#[async_trait]
pub trait RpcConnector: Send + Sync {
    async fn connect(&self) -> Result<RpcTransportRef>;
}

pub type RpcConnectorRef = Arc<dyn RpcConnector>;

// =============================================================================
// Unix Socket Transport
// =============================================================================

pub struct UnixSocketTransport {
    stream: Mutex<UnixStream>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl UnixSocketTransport {
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream: Mutex::new(stream),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn broken(&self, method: &str, reason: impl std::fmt::Display) -> Error {
        self.closed.store(true, Ordering::SeqCst);
        Error::RpcTransport(format!("{}: {}", method, reason))
    }

    async fn read_response(&self, stream: &mut UnixStream, method: &str) -> Result<RpcResponse> {
        let mut buf = Vec::with_capacity(READ_CHUNK);
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            let n = stream
                .read(&mut chunk)
                .await
                .map_err(|e| self.broken(method, e))?;
            if n == 0 {
                return Err(self.broken(method, "connection closed by peer"));
            }
            buf.extend_from_slice(&chunk[..n]);

            match serde_json::from_slice::<RpcResponse>(&buf) {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_eof() => continue,
                Err(e) => return Err(self.broken(method, e)),
            }
        }
    }
}

#[async_trait]
impl RpcTransport for UnixSocketTransport {
    async fn call(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            method,
            params,
        };
        let payload = serde_json::to_vec(&request)?;
        debug!("rpc request: {}", String::from_utf8_lossy(&payload));

        let mut stream = self.stream.lock().await;
        stream
            .write_all(&payload)
            .await
            .map_err(|e| self.broken(method, e))?;

        let response = self.read_response(&mut stream, method).await?;
        if let Some(err) = response.error {
            return Err(Error::Rpc {
                method: method.to_string(),
                code: err.code,
                message: err.message,
            });
        }

        Ok(response.result.unwrap_or(Value::Null))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Connects to the SPDK RPC socket
pub struct UnixSocketConnector {
    path: PathBuf,
}

impl UnixSocketConnector {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl RpcConnector for UnixSocketConnector {
    async fn connect(&self) -> Result<RpcTransportRef> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            Error::RpcTransport(format!("connect {}: {}", self.path.display(), e))
        })?;
        debug!("connected to {}", self.path.display());
        Ok(Arc::new(UnixSocketTransport::new(stream)))
    }
}
