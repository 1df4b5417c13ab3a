//! Moving payloads and acknowledgments between nodes.
//!
//! The engine talks to remote nodes only through [`Transport`]. Two
//! implementations ship with the crate:
//!
//! - [`LoopbackTransport`] connects engines running in the same process and
//!   can inject transport failures and redirects
//! - [`DirectoryTransport`] exchanges payload and ack files through a shared
//!   directory, one subdirectory per node

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use sync_core::{BatchAck, Node, SyncError};

use crate::ack::{decode_acks, encode_acks};

/// Reply from a remote node.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportResponse<T> {
    Ok(T),
    /// The remote node asked to be contacted at another URL.
    Redirect(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch the batches `remote` has waiting for this node.
    async fn open_pull(&self, remote: &Node) -> Result<TransportResponse<Vec<u8>>>;

    /// Deliver a payload to `remote`, returning the acknowledgments it sent back.
    async fn push(&self, remote: &Node, payload: Vec<u8>) -> Result<TransportResponse<Vec<BatchAck>>>;

    async fn send_acks(&self, remote: &Node, acks: &[BatchAck]) -> Result<TransportResponse<()>>;
}

/// Receiving side of a transport: what a node does when another node
/// pulls from it, pushes to it, or acknowledges batches.
#[async_trait]
pub trait SyncEndpoint: Send + Sync {
    async fn handle_pull(&self, node_id: &str) -> Result<Vec<u8>>;
    async fn handle_push(&self, node_id: &str, payload: &[u8]) -> Result<Vec<BatchAck>>;
    async fn handle_acks(&self, acks: &[BatchAck]) -> Result<()>;
}

/// Failure the loopback network reports instead of reaching an endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimulatedFault {
    ConnectionRefused,
    UnknownHost,
    Busy,
    AuthenticationFailed,
    SyncDisabled,
    RegistrationRequired,
}

impl SimulatedFault {
    fn to_error(&self, node_id: &str) -> SyncError {
        let node_id = node_id.to_string();
        match self {
            SimulatedFault::ConnectionRefused => SyncError::ConnectionRefused(node_id),
            SimulatedFault::UnknownHost => SyncError::UnknownHost(node_id),
            SimulatedFault::Busy => SyncError::ConnectionRejected(node_id),
            SimulatedFault::AuthenticationFailed => SyncError::AuthenticationFailed(node_id),
            SimulatedFault::SyncDisabled => SyncError::SyncDisabled(node_id),
            SimulatedFault::RegistrationRequired => SyncError::RegistrationRequired(node_id),
        }
    }
}

#[derive(Default)]
struct NetworkState {
    endpoints: HashMap<String, Arc<dyn SyncEndpoint>>,
    /// Faults consumed one per request, per node.
    faults: HashMap<String, Vec<SimulatedFault>>,
    redirects: HashMap<String, String>,
}

/// Registry of in-process endpoints shared by every [`LoopbackTransport`].
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, node_id: impl Into<String>, endpoint: Arc<dyn SyncEndpoint>) {
        self.state
            .write()
            .await
            .endpoints
            .insert(node_id.into(), endpoint);
    }

    /// Fail the next `count` requests to a node with `fault`.
    pub async fn inject_fault(&self, node_id: &str, fault: SimulatedFault, count: usize) {
        let mut state = self.state.write().await;
        let queue = state.faults.entry(node_id.to_string()).or_default();
        queue.extend(std::iter::repeat(fault).take(count));
    }

    /// Answer every request to a node with a redirect until cleared.
    pub async fn redirect(&self, node_id: &str, url: Option<&str>) {
        let mut state = self.state.write().await;
        match url {
            Some(url) => state.redirects.insert(node_id.to_string(), url.to_string()),
            None => state.redirects.remove(node_id),
        };
    }

    pub fn transport(&self, local_node_id: impl Into<String>) -> LoopbackTransport {
        LoopbackTransport {
            network: self.clone(),
            local_node_id: local_node_id.into(),
        }
    }

    async fn connect(&self, node_id: &str) -> Result<Result<Arc<dyn SyncEndpoint>, String>> {
        let mut state = self.state.write().await;
        if let Some(queue) = state.faults.get_mut(node_id) {
            if !queue.is_empty() {
                let fault = queue.remove(0);
                return Err(fault.to_error(node_id).into());
            }
        }
        if let Some(url) = state.redirects.get(node_id) {
            return Ok(Err(url.clone()));
        }
        let endpoint = state
            .endpoints
            .get(node_id)
            .cloned()
            .ok_or_else(|| SyncError::UnknownHost(node_id.to_string()))?;
        Ok(Ok(endpoint))
    }
}

pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local_node_id: String,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open_pull(&self, remote: &Node) -> Result<TransportResponse<Vec<u8>>> {
        match self.network.connect(&remote.node_id).await? {
            Ok(endpoint) => Ok(TransportResponse::Ok(
                endpoint.handle_pull(&self.local_node_id).await?,
            )),
            Err(url) => Ok(TransportResponse::Redirect(url)),
        }
    }

    async fn push(&self, remote: &Node, payload: Vec<u8>) -> Result<TransportResponse<Vec<BatchAck>>> {
        match self.network.connect(&remote.node_id).await? {
            Ok(endpoint) => Ok(TransportResponse::Ok(
                endpoint.handle_push(&self.local_node_id, &payload).await?,
            )),
            Err(url) => Ok(TransportResponse::Redirect(url)),
        }
    }

    async fn send_acks(&self, remote: &Node, acks: &[BatchAck]) -> Result<TransportResponse<()>> {
        match self.network.connect(&remote.node_id).await? {
            Ok(endpoint) => {
                endpoint.handle_acks(acks).await?;
                Ok(TransportResponse::Ok(()))
            }
            Err(url) => Ok(TransportResponse::Redirect(url)),
        }
    }
}

const INCOMING_DIR: &str = "incoming";
const ACKS_DIR: &str = "acks";
const PAYLOAD_EXTENSION: &str = "batch";
const ACK_EXTENSION: &str = "jsonl";

/// File based transport.
///
/// ```text
/// <root>/<node>/incoming/<source>_<millis>.batch   payloads waiting for <node>
/// <root>/<node>/acks/<source>_<millis>.jsonl       acks waiting for <node>
/// ```
///
/// Pushes return no acknowledgments; they arrive later as ack files.
pub struct DirectoryTransport {
    root: PathBuf,
    local_node_id: String,
}

impl DirectoryTransport {
    pub fn new(root: impl Into<PathBuf>, local_node_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            local_node_id: local_node_id.into(),
        }
    }

    fn dir(&self, node_id: &str, kind: &str) -> PathBuf {
        self.root.join(node_id).join(kind)
    }

    async fn write_file(&self, dir: PathBuf, extension: &str, content: &[u8]) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let millis = chrono::Utc::now().timestamp_millis();
        let mut path = dir.join(format!("{}_{millis}.{extension}", self.local_node_id));
        let mut suffix = 0;
        while tokio::fs::try_exists(&path).await? {
            suffix += 1;
            path = dir.join(format!("{}_{millis}_{suffix}.{extension}", self.local_node_id));
        }
        let partial = path.with_extension("tmp");
        tokio::fs::write(&partial, content)
            .await
            .with_context(|| format!("Failed to write {}", partial.display()))?;
        tokio::fs::rename(&partial, &path).await?;
        Ok(path)
    }

    /// Files in `dir` with `extension` whose name starts with `prefix`, oldest name first.
    async fn list(dir: &Path, extension: &str, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(extension) {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if prefix.map_or(true, |p| name.starts_with(&format!("{p}_"))) {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Nodes that left payloads for this node.
    pub async fn pending_sources(&self) -> Result<Vec<String>> {
        let files = Self::list(&self.dir(&self.local_node_id, INCOMING_DIR), PAYLOAD_EXTENSION, None).await?;
        let mut sources: Vec<String> = files
            .iter()
            .filter_map(|p| p.file_stem()?.to_str()?.split('_').next().map(str::to_string))
            .collect();
        sources.dedup();
        Ok(sources)
    }

    /// Read and remove every ack file addressed to this node.
    pub async fn take_acks(&self) -> Result<Vec<BatchAck>> {
        let mut acks = Vec::new();
        for path in Self::list(&self.dir(&self.local_node_id, ACKS_DIR), ACK_EXTENSION, None).await? {
            let content = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            acks.extend(decode_acks(&content).with_context(|| format!("Invalid ack file {}", path.display()))?);
            tokio::fs::remove_file(&path).await?;
        }
        Ok(acks)
    }
}

#[async_trait]
impl Transport for DirectoryTransport {
    async fn open_pull(&self, remote: &Node) -> Result<TransportResponse<Vec<u8>>> {
        let dir = self.dir(&self.local_node_id, INCOMING_DIR);
        let mut payload = Vec::new();
        for path in Self::list(&dir, PAYLOAD_EXTENSION, Some(&remote.node_id)).await? {
            payload.extend(
                tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?,
            );
            tokio::fs::remove_file(&path).await?;
        }
        Ok(TransportResponse::Ok(payload))
    }

    async fn push(&self, remote: &Node, payload: Vec<u8>) -> Result<TransportResponse<Vec<BatchAck>>> {
        let path = self
            .write_file(self.dir(&remote.node_id, INCOMING_DIR), PAYLOAD_EXTENSION, &payload)
            .await?;
        tracing::debug!("Wrote {} bytes for node {} to {}", payload.len(), remote.node_id, path.display());
        Ok(TransportResponse::Ok(Vec::new()))
    }

    async fn send_acks(&self, remote: &Node, acks: &[BatchAck]) -> Result<TransportResponse<()>> {
        let content = encode_acks(acks)?;
        self.write_file(self.dir(&remote.node_id, ACKS_DIR), ACK_EXTENSION, content.as_bytes())
            .await?;
        Ok(TransportResponse::Ok(()))
    }
}
