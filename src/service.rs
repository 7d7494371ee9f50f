//! External collaborator interfaces.
//!
//! The balancer never holds authoritative cluster state; it consumes reports
//! from the metadata authority ("name service") and asks transfer peers to
//! copy replicas. This module defines those seams: the report types, the
//! [`NameService`] trait implemented by deployment-specific connectors, the
//! [`KeyManager`] issuing short-lived block access tokens, and the
//! [`ChannelAuthenticator`] that wraps transfer sockets when the cluster
//! requires negotiated streams.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{ServiceError, TransferError};

/// Storage media class of a storage group. Replicas only move between groups
/// of identical type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StorageType {
    Disk,
    Ssd,
    Archive,
}

impl Default for StorageType {
    fn default() -> Self {
        StorageType::Disk
    }
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::Disk => write!(f, "DISK"),
            StorageType::Ssd => write!(f, "SSD"),
            StorageType::Archive => write!(f, "ARCHIVE"),
        }
    }
}

impl StorageType {
    /// All known storage types, in classification order.
    pub fn all() -> [StorageType; 3] {
        [StorageType::Disk, StorageType::Ssd, StorageType::Archive]
    }
}

/// Identity and placement data of a storage node, as reported by the name
/// service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Opaque node identity issued by the name service.
    pub node_uuid: String,
    pub hostname: String,
    pub ip_addr: String,
    /// Port of the peer-to-peer transfer service.
    pub transfer_port: u16,
    /// Rack path, e.g. "/dc1/r42".
    pub rack: String,
    /// Node-group path within the rack, when the topology defines one.
    pub node_group: Option<String>,
    pub decommissioned: bool,
    pub decommissioning: bool,
}

impl NodeInfo {
    /// Address of the node's transfer service.
    pub fn transfer_addr(&self) -> String {
        format!("{}:{}", self.ip_addr, self.transfer_port)
    }
}

/// Per-storage-type capacity figures on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageReport {
    pub storage_type: StorageType,
    pub capacity: u64,
    pub used: u64,
    pub remaining: u64,
}

/// Utilization report for one node, covering all its storage types.
#[derive(Debug, Clone)]
pub struct NodeStorageReport {
    pub node: NodeInfo,
    pub storages: Vec<StorageReport>,
}

impl NodeStorageReport {
    /// Total capacity of the given storage type on this node.
    pub fn capacity(&self, t: StorageType) -> u64 {
        self.storages
            .iter()
            .filter(|s| s.storage_type == t)
            .map(|s| s.capacity)
            .sum()
    }

    /// Total remaining space of the given storage type on this node.
    pub fn remaining(&self, t: StorageType) -> u64 {
        self.storages
            .iter()
            .filter(|s| s.storage_type == t)
            .map(|s| s.remaining)
            .sum()
    }
}

/// Pool-qualified identity of a replicated block.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub pool_id: String,
    pub block_id: u64,
    pub generation: u64,
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "blk_{}_{}", self.block_id, self.generation)
    }
}

/// Immutable descriptor of a block: identity plus length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub id: BlockId,
    pub num_bytes: u64,
}

/// A block together with the storage groups currently holding its replicas,
/// as returned by a block listing.
#[derive(Debug, Clone)]
pub struct BlockWithLocations {
    pub block: BlockMeta,
    /// (node uuid, storage type) per replica.
    pub locations: Vec<(String, StorageType)>,
}

/// Short-lived token authorizing a transfer operation on one block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessToken(pub Vec<u8>);

/// Issues access tokens for block transfer operations.
pub trait KeyManager: Send + Sync {
    fn access_token(&self, block: &BlockId) -> Result<AccessToken, ServiceError>;
}

/// Key manager for clusters that run without block tokens.
pub struct InsecureKeyManager;

impl KeyManager for InsecureKeyManager {
    fn access_token(&self, _block: &BlockId) -> Result<AccessToken, ServiceError> {
        Ok(AccessToken(Vec::new()))
    }
}

/// A bidirectional byte stream to a transfer peer, possibly wrapped by a
/// negotiated security layer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> PeerStream for T {}

pub type BoxedPeerStream = Pin<Box<dyn PeerStream>>;

/// Wraps a raw transfer socket according to the cluster's security
/// configuration before any protocol bytes are exchanged.
#[async_trait]
pub trait ChannelAuthenticator: Send + Sync {
    async fn negotiate(
        &self,
        stream: TcpStream,
        token: &AccessToken,
        target: &NodeInfo,
    ) -> Result<BoxedPeerStream, TransferError>;
}

/// Pass-through authenticator for clusters without negotiated transfer
/// streams.
pub struct PlainChannel;

#[async_trait]
impl ChannelAuthenticator for PlainChannel {
    async fn negotiate(
        &self,
        stream: TcpStream,
        _token: &AccessToken,
        _target: &NodeInfo,
    ) -> Result<BoxedPeerStream, TransferError> {
        Ok(Box::pin(stream))
    }
}

/// Client of one metadata authority. Implementations connect to a concrete
/// deployment; the balancer core only consumes this trait.
#[async_trait]
pub trait NameService: Send + Sync {
    /// Identifier of the block pool this service manages.
    fn block_pool_id(&self) -> String;

    /// Acquire the cluster-wide "only one balancer" lease. Fails with
    /// [`ServiceError::AlreadyRunning`] if another coordinator holds it.
    async fn acquire_lease(&self) -> Result<(), ServiceError>;

    /// Storage utilization reports for all live nodes.
    async fn storage_reports(&self) -> Result<Vec<NodeStorageReport>, ServiceError>;

    /// Up to `size_bytes` worth of blocks residing on the given node.
    async fn blocks_on_node(
        &self,
        node_uuid: &str,
        size_bytes: u64,
    ) -> Result<Vec<BlockWithLocations>, ServiceError>;

    /// Token issuer for this block pool.
    fn key_manager(&self) -> Arc<dyn KeyManager>;

    /// Whether balancing against this service should continue, given the
    /// bytes moved in the iteration that just finished. Returns false after
    /// five consecutive iterations without progress.
    fn should_continue(&self, bytes_moved: u64) -> bool;

    /// Release the lease and any connection state.
    async fn close(&self) -> Result<(), ServiceError>;
}

/// Tracks consecutive no-progress iterations for [`NameService::should_continue`].
/// Connectors embed one and feed it each iteration's byte delta.
pub struct StallTracker {
    max_stalls: u32,
    stalled: Mutex<u32>,
}

impl StallTracker {
    pub fn new(max_stalls: u32) -> Self {
        Self {
            max_stalls,
            stalled: Mutex::new(0),
        }
    }

    /// Record an iteration's progress; returns false once the stall limit is
    /// reached.
    pub fn should_continue(&self, bytes_moved: u64) -> bool {
        let mut stalled = self.stalled.lock();
        if bytes_moved > 0 {
            *stalled = 0;
            return true;
        }
        *stalled += 1;
        *stalled < self.max_stalls
    }
}

impl Default for StallTracker {
    fn default() -> Self {
        Self::new(5)
    }
}
