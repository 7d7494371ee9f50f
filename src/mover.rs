//! Single block-move execution.
//!
//! A mover task connects to the target node's transfer service, wraps the
//! socket through the configured channel authenticator, sends one framed
//! replace-block request and reads the framed response. Failures are
//! absorbed here: the involved nodes get an error back-off and the iteration
//! carries on without the block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::error::TransferError;
use crate::model::PendingMove;
use crate::service::{ChannelAuthenticator, KeyManager};
use crate::wire::{self, BlockOpResponse, OpStatus, ProxyDescriptor, ReplaceBlockRequest};

/// Everything a mover task needs besides the move itself.
pub struct MoveContext {
    pub key_manager: Arc<dyn KeyManager>,
    pub authenticator: Arc<dyn ChannelAuthenticator>,
    pub bytes_moved: Arc<AtomicU64>,
    pub progress: Arc<Notify>,
    pub read_timeout: Duration,
    pub delay_after_error: Duration,
}

/// Execute one pending move to completion. Always releases the proxy and
/// target slots and broadcasts progress, whatever the outcome.
pub async fn dispatch_move(ctx: &MoveContext, pending: PendingMove) {
    let outcome = match tokio::time::timeout(ctx.read_timeout, execute_move(ctx, &pending)).await {
        Ok(result) => result,
        Err(_) => Err(TransferError::Timeout),
    };

    match outcome {
        Ok(()) => {
            ctx.bytes_moved
                .fetch_add(pending.block.num_bytes(), Ordering::SeqCst);
            info!("Successfully moved {}", pending);
        }
        Err(e) => {
            // The proxy or target may be struggling; keep both out of new
            // moves briefly so the balancer does not hammer them.
            warn!("Failed to move {}: {}", pending, e);
            pending.proxy.node.activate_delay(ctx.delay_after_error);
            pending.target.node.activate_delay(ctx.delay_after_error);
        }
    }

    pending.proxy.node.release_slot();
    pending.target.node.release_slot();
    ctx.progress.notify_waiters();
}

async fn execute_move(ctx: &MoveContext, pending: &PendingMove) -> Result<(), TransferError> {
    let addr = pending.target.node.info.transfer_addr();
    let stream = TcpStream::connect(&addr)
        .await
        .map_err(|source| TransferError::Connect { addr, source })?;

    let token = ctx
        .key_manager
        .access_token(pending.block.id())
        .map_err(|e| TransferError::Negotiation(e.to_string()))?;
    let mut channel = ctx
        .authenticator
        .negotiate(stream, &token, &pending.target.node.info)
        .await?;

    let request = ReplaceBlockRequest {
        block: pending.block.id().clone(),
        num_bytes: pending.block.num_bytes(),
        storage_type: Default::default(),
        token,
        source_uuid: pending.source.group.node.info.node_uuid.clone(),
        proxy: ProxyDescriptor {
            node_uuid: pending.proxy.node.info.node_uuid.clone(),
            transfer_addr: pending.proxy.node.info.transfer_addr(),
        },
    };
    wire::write_frame(&mut channel, &request).await?;

    let response: BlockOpResponse = wire::read_frame(&mut channel).await?;
    match response.status {
        OpStatus::Success => Ok(()),
        OpStatus::ErrorAccessToken => Err(TransferError::AccessToken),
        _ => Err(TransferError::Rejected(
            response.message.unwrap_or_else(|| "no message".to_string()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockStore;
    use crate::model::{Node, Source, StorageGroup};
    use crate::service::{
        BlockId, BlockMeta, InsecureKeyManager, NodeInfo, PlainChannel, StorageType,
    };
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn make_node(uuid: &str, port: u16) -> Arc<Node> {
        Arc::new(Node::new(
            NodeInfo {
                node_uuid: uuid.to_string(),
                hostname: format!("{}.example.com", uuid),
                ip_addr: "127.0.0.1".to_string(),
                transfer_port: port,
                rack: "/r1".to_string(),
                node_group: None,
                decommissioned: false,
                decommissioning: false,
            },
            5,
        ))
    }

    fn make_context() -> MoveContext {
        MoveContext {
            key_manager: Arc::new(InsecureKeyManager),
            authenticator: Arc::new(PlainChannel),
            bytes_moved: Arc::new(AtomicU64::new(0)),
            progress: Arc::new(Notify::new()),
            read_timeout: Duration::from_secs(5),
            delay_after_error: Duration::from_secs(10),
        }
    }

    fn make_pending(target_port: u16) -> PendingMove {
        let store = BlockStore::new(Duration::from_secs(60));
        let src_node = make_node("dn-src", 1);
        let tgt_node = make_node("dn-tgt", target_port);

        let src_group = Arc::new(StorageGroup::new(
            src_node.clone(),
            StorageType::Disk,
            90.0,
            1 << 30,
        ));
        let tgt_group = Arc::new(StorageGroup::new(
            tgt_node.clone(),
            StorageType::Disk,
            10.0,
            1 << 30,
        ));
        let block = store.update_or_insert(BlockMeta {
            id: BlockId {
                pool_id: "BP-1".to_string(),
                block_id: 7,
                generation: 1,
            },
            num_bytes: 1 << 20,
        });
        block.set_locations(vec![src_group.clone()]);

        // The selector reserves both slots before the mover runs.
        assert!(src_node.try_reserve_slot());
        assert!(tgt_node.try_reserve_slot());

        PendingMove {
            block,
            source: Arc::new(Source::new(src_group.clone())),
            target: tgt_group,
            proxy: src_group,
        }
    }

    async fn spawn_peer(response: BlockOpResponse) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let _req: ReplaceBlockRequest = wire::read_frame(&mut socket).await.unwrap();
            wire::write_frame(&mut socket, &response).await.unwrap();
        });
        port
    }

    #[tokio::test]
    async fn test_successful_move_counts_bytes_and_releases_slots() {
        let port = spawn_peer(BlockOpResponse::success()).await;
        let ctx = make_context();
        let pending = make_pending(port);
        let proxy_node = pending.proxy.node.clone();
        let target_node = pending.target.node.clone();

        dispatch_move(&ctx, pending).await;

        assert_eq!(ctx.bytes_moved.load(Ordering::SeqCst), 1 << 20);
        assert_eq!(proxy_node.pending_moves(), 0);
        assert_eq!(target_node.pending_moves(), 0);
        assert!(!proxy_node.delay_active());
        assert!(!target_node.delay_active());
    }

    #[tokio::test]
    async fn test_failed_move_arms_backoff_on_proxy_and_target() {
        let port = spawn_peer(BlockOpResponse::error(OpStatus::Error, "disk full")).await;
        let ctx = make_context();
        let pending = make_pending(port);
        let proxy_node = pending.proxy.node.clone();
        let target_node = pending.target.node.clone();

        dispatch_move(&ctx, pending).await;

        assert_eq!(ctx.bytes_moved.load(Ordering::SeqCst), 0);
        // Slots are released, but both nodes refuse new reservations while
        // the back-off is active.
        assert_eq!(proxy_node.pending_moves(), 0);
        assert_eq!(target_node.pending_moves(), 0);
        assert!(proxy_node.delay_active());
        assert!(target_node.delay_active());
        assert!(!proxy_node.try_reserve_slot());
        assert!(!target_node.try_reserve_slot());
    }

    #[tokio::test]
    async fn test_connect_failure_is_absorbed() {
        // Bind-then-drop to get a port nothing listens on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let ctx = make_context();
        let pending = make_pending(port);
        let target_node = pending.target.node.clone();

        dispatch_move(&ctx, pending).await;
        assert_eq!(ctx.bytes_moved.load(Ordering::SeqCst), 0);
        assert!(target_node.delay_active());
    }

    #[tokio::test]
    async fn test_request_carries_proxy_descriptor() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let req: ReplaceBlockRequest = wire::read_frame(&mut socket).await.unwrap();
            wire::write_frame(&mut socket, &BlockOpResponse::success())
                .await
                .unwrap();
            req
        });

        let ctx = make_context();
        let pending = make_pending(port);
        dispatch_move(&ctx, pending).await;

        let req = peer.await.unwrap();
        assert_eq!(req.source_uuid, "dn-src");
        assert_eq!(req.proxy.node_uuid, "dn-src");
        assert_eq!(req.block.block_id, 7);
    }

    #[tokio::test]
    async fn test_mover_times_out_on_stalled_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // Accept and go quiet; never answer.
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = socket.shutdown().await;
        });

        let mut ctx = make_context();
        ctx.read_timeout = Duration::from_millis(100);
        let pending = make_pending(port);
        let target_node = pending.target.node.clone();

        dispatch_move(&ctx, pending).await;
        assert_eq!(ctx.bytes_moved.load(Ordering::SeqCst), 0);
        assert!(target_node.delay_active());
        assert_eq!(target_node.pending_moves(), 0);
    }
}
