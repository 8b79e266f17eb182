//! # transport
//!
//! why: carry raft rpcs and status queries between processes
//! relations: the engine and cluster_status only see the Transport trait;
//! RpcServer feeds inbound calls to a NodeHandle
//! what: Transport, TcpTransport, RpcServer, frame codec
//!
//! Calls travel as u32 length-prefixed JSON frames over tokio TCP, one connection
//! per call. The in-memory transport used by tests lives in [`crate::mem_network`].

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use raft_core::{ClusterConfig, NodeId, RaftMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use crate::error::TransportError;
use crate::handle::NodeHandle;
use crate::status::NodeStatus;

/// Timeout for RPC connection establishment.
const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Timeout for RPC read/write operations.
const RPC_OPERATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Largest frame accepted in either direction.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Outbound half of the rpc surface, as seen by one node.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver a RequestVote or AppendEntries to `target` and wait for its reply.
    async fn send(&self, target: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError>;

    /// Read-only status of `target`.
    async fn status(&self, target: NodeId) -> Result<NodeStatus, TransportError>;
}

/// Message types for raft RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcRequest {
    Raft(RaftMessage),
    Status,
}

/// Response types for raft RPC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcResponse {
    Raft(RaftMessage),
    Status(NodeStatus),
    Error(String),
}

/// Write `value` as a u32 big-endian length followed by its JSON encoding.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let data = serde_json::to_vec(value)?;
    if data.len() > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(data.len()));
    }
    writer.write_all(&(data.len() as u32).to_be_bytes()).await?;
    writer.write_all(&data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame written by [`write_frame`].
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T, TransportError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(TransportError::FrameTooLarge(len));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(serde_json::from_slice(&buf)?)
}

/// TCP client side: one short-lived connection per call.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    addresses: BTreeMap<NodeId, String>,
}

impl TcpTransport {
    pub fn new(addresses: BTreeMap<NodeId, String>) -> Self {
        Self { addresses }
    }

    pub fn from_cluster(cluster: &ClusterConfig) -> Self {
        Self::new(cluster.nodes.clone())
    }

    async fn call(&self, target: NodeId, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let addr = self
            .addresses
            .get(&target)
            .ok_or(TransportError::UnknownNode(target))?;

        let mut stream = timeout(RPC_CONNECT_TIMEOUT, TcpStream::connect(addr.as_str()))
            .await
            .map_err(|_| TransportError::Timeout(target))?
            .map_err(|e| {
                tracing::debug!(peer = target, addr = %addr, error = %e, "connect failed");
                TransportError::Unreachable(target)
            })?;
        stream.set_nodelay(true)?;

        timeout(RPC_OPERATION_TIMEOUT, async {
            write_frame(&mut stream, request).await?;
            read_frame(&mut stream).await
        })
        .await
        .map_err(|_| TransportError::Timeout(target))?
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, target: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        match self.call(target, &RpcRequest::Raft(message)).await? {
            RpcResponse::Raft(reply) => Ok(reply),
            RpcResponse::Error(e) => Err(TransportError::Remote(e)),
            RpcResponse::Status(_) => Err(TransportError::UnexpectedResponse("status")),
        }
    }

    async fn status(&self, target: NodeId) -> Result<NodeStatus, TransportError> {
        match self.call(target, &RpcRequest::Status).await? {
            RpcResponse::Status(status) => Ok(status),
            RpcResponse::Error(e) => Err(TransportError::Remote(e)),
            RpcResponse::Raft(_) => Err(TransportError::UnexpectedResponse("raft message")),
        }
    }
}

/// Server for handling incoming raft RPC requests.
pub struct RpcServer {
    listener: TcpListener,
    handle: NodeHandle,
}

impl RpcServer {
    pub async fn bind(addr: &str, handle: NodeHandle) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, handle })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections until the listener fails.
    pub async fn run(self) -> std::io::Result<()> {
        tracing::info!(node = self.handle.id(), addr = ?self.listener.local_addr().ok(), "raft RPC server listening");

        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            let handle = self.handle.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(handle, stream).await {
                    tracing::warn!(peer = %peer_addr, error = %e, "error handling raft RPC");
                }
            });
        }
    }

    async fn handle_connection(handle: NodeHandle, mut stream: TcpStream) -> Result<(), TransportError> {
        let request: RpcRequest = read_frame(&mut stream).await?;
        let response = match request {
            RpcRequest::Raft(message) => match handle.deliver(message).await {
                Ok(reply) => RpcResponse::Raft(reply),
                Err(e) => RpcResponse::Error(e.to_string()),
            },
            RpcRequest::Status => match handle.status().await {
                Ok(status) => RpcResponse::Status(status),
                Err(e) => RpcResponse::Error(e.to_string()),
            },
        };
        write_frame(&mut stream, &response).await
    }
}
