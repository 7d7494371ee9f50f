//! Transfer peer wire protocol.
//!
//! The balancer asks a storage node to copy one replica from a proxy peer by
//! sending a single framed `ReplaceBlockRequest` and reading back a framed
//! [`BlockOpResponse`]. Frames are bincode payloads behind a u32 big-endian
//! length prefix.

use bytes::{BufMut, BytesMut};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransferError;
use crate::service::{AccessToken, BlockId, StorageType};

/// Upper bound on a single control frame.
const MAX_FRAME_LEN: u32 = 1 << 20;

/// Addressing data of the proxy peer the target should copy from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyDescriptor {
    pub node_uuid: String,
    pub transfer_addr: String,
}

/// Ask the receiving node to copy a replica from the proxy and then report
/// the new replica to the name service through its normal channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplaceBlockRequest {
    pub block: BlockId,
    pub num_bytes: u64,
    pub storage_type: StorageType,
    pub token: AccessToken,
    /// Storage group owner whose quota this move is debited against; the
    /// name service drops the replica there once the copy is reported.
    pub source_uuid: String,
    pub proxy: ProxyDescriptor,
}

/// Status of a block operation at the transfer peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpStatus {
    Success,
    Error,
    ErrorAccessToken,
    ErrorBusy,
}

/// Framed response to a block operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockOpResponse {
    pub status: OpStatus,
    pub message: Option<String>,
}

impl BlockOpResponse {
    pub fn success() -> Self {
        Self {
            status: OpStatus::Success,
            message: None,
        }
    }

    pub fn error(status: OpStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: Some(message.into()),
        }
    }
}

/// Write one length-prefixed frame.
pub async fn write_frame<S, T>(stream: &mut S, msg: &T) -> Result<(), TransferError>
where
    S: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = bincode::serialize(msg).map_err(|e| TransferError::Wire(e.to_string()))?;
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(TransferError::Wire(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }
    let mut frame = BytesMut::with_capacity(4 + payload.len());
    frame.put_u32(payload.len() as u32);
    frame.put_slice(&payload);
    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame.
pub async fn read_frame<S, T>(stream: &mut S) -> Result<T, TransferError>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = stream.read_u32().await?;
    if len > MAX_FRAME_LEN {
        return Err(TransferError::Wire(format!("frame too large: {} bytes", len)));
    }
    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await?;
    bincode::deserialize(&payload).map_err(|e| TransferError::Wire(e.to_string()))
}
