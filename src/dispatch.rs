//! Concurrent move dispatching.
//!
//! One dispatcher task per source runs the block-selection loop; every
//! selected block becomes a mover task speaking the transfer protocol. Both
//! task sets are bounded by semaphores. Progress (slot releases, finished
//! moves) is broadcast on a shared notifier so stalled selectors wake up as
//! soon as capacity frees.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{Notify, Semaphore};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::block::{BlockRef, BlockStore};
use crate::classifier::GroupEntry;
use crate::config::{Config, MAX_BLOCKS_TO_FETCH};
use crate::error::ServiceError;
use crate::model::{GroupKey, PendingMove, Source, StorageGroup};
use crate::mover::{self, MoveContext};
use crate::service::{ChannelAuthenticator, NameService};
use crate::topology::NetworkTopology;

/// A source gives up on its remaining quota after this many consecutive
/// selection rounds without a schedulable block.
const MAX_NO_PENDING_BLOCK_ITERATIONS: usize = 5;

/// Fetch another block listing once the working set shrinks below this.
const SOURCE_BLOCKS_MIN: usize = 5;

/// Shared state of one dispatch round.
#[derive(Clone)]
pub struct DispatchContext {
    pub topology: Arc<NetworkTopology>,
    pub store: Arc<BlockStore>,
    pub service: Arc<dyn NameService>,
    pub authenticator: Arc<dyn ChannelAuthenticator>,
    pub group_map: Arc<HashMap<GroupKey, GroupEntry>>,
    pub bytes_moved: Arc<AtomicU64>,
    pub progress: Arc<Notify>,
    pub dispatcher_pool: Arc<Semaphore>,
    pub mover_pool: Arc<Semaphore>,
    pub config: Config,
}

impl DispatchContext {
    fn move_context(&self) -> MoveContext {
        MoveContext {
            key_manager: self.service.key_manager(),
            authenticator: self.authenticator.clone(),
            bytes_moved: self.bytes_moved.clone(),
            progress: self.progress.clone(),
            read_timeout: self.config.block_move_read_timeout,
            delay_after_error: self.config.delay_after_error,
        }
    }
}

/// Run the per-source dispatcher tasks, wait until every scheduled move has
/// been confirmed or abandoned, and return the bytes moved in this round.
pub async fn dispatch_block_moves(
    ctx: &DispatchContext,
    sources: &[Arc<Source>],
    targets: &[Arc<StorageGroup>],
) -> u64 {
    let bytes_before = ctx.bytes_moved.load(Ordering::SeqCst);

    let mut handles = Vec::with_capacity(sources.len());
    for source in sources {
        let ctx = ctx.clone();
        let source = source.clone();
        handles.push(tokio::spawn(async move {
            let Ok(_permit) = ctx.dispatcher_pool.acquire().await else {
                return;
            };
            dispatch_source(&ctx, source).await;
        }));
    }
    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "dispatcher task failed");
        }
    }

    wait_for_move_completion(targets, ctx.config.block_move_wait_time).await;

    ctx.bytes_moved.load(Ordering::SeqCst) - bytes_before
}

/// Poll until no target node is party to a pending move.
pub async fn wait_for_move_completion(targets: &[Arc<StorageGroup>], wait: Duration) {
    loop {
        let busy = targets.iter().any(|t| t.node.has_pending_moves());
        if !busy {
            return;
        }
        tokio::time::sleep(wait).await;
    }
}

/// Selection loop of one source: pick a block and proxy, hand them to the
/// mover pool, refill the working set from the name service as it drains,
/// and give up once nothing schedulable remains.
async fn dispatch_source(ctx: &DispatchContext, source: Arc<Source>) {
    let start = Instant::now();
    let mut blocks_to_receive = 2u64.saturating_mul(source.scheduled_bytes());
    let mut no_pending_iterations = 0usize;

    while start.elapsed() < ctx.config.max_iteration_time
        && source.scheduled_bytes() > 0
        && (source.src_block_count() > 0 || blocks_to_receive > 0)
    {
        if let Some(pending) = choose_next_block_to_move(ctx, &source) {
            debug!("Start moving {}", pending);
            schedule_block_move(ctx, pending);
            continue;
        }

        // Nothing schedulable right now: shed blocks that were moved in the
        // meantime and consider refilling the working set.
        filter_moved_blocks(&source, &ctx.store);
        if source.src_block_count() < SOURCE_BLOCKS_MIN && blocks_to_receive > 0 {
            match fetch_block_list(ctx, &source, blocks_to_receive).await {
                Ok((_, 0)) => {
                    // The name service has no more blocks for this node.
                    blocks_to_receive = 0;
                    continue;
                }
                Ok((bytes_received, _)) => {
                    blocks_to_receive = blocks_to_receive.saturating_sub(bytes_received);
                    continue;
                }
                Err(e) => {
                    warn!(
                        source = %source.group.display_name(),
                        error = %e,
                        "failed to fetch block list"
                    );
                    return;
                }
            }
        } else {
            no_pending_iterations += 1;
            if no_pending_iterations >= MAX_NO_PENDING_BLOCK_ITERATIONS {
                // Give up on this source for the iteration.
                source.group.reset_scheduled();
            }
        }

        // Wait for targets or proxies to free slots.
        let _ = timeout(Duration::from_secs(1), ctx.progress.notified()).await;
    }
}

fn schedule_block_move(ctx: &DispatchContext, pending: PendingMove) {
    let mover_pool = ctx.mover_pool.clone();
    let move_ctx = ctx.move_context();
    tokio::spawn(async move {
        match mover_pool.acquire().await {
            Ok(_permit) => mover::dispatch_move(&move_ctx, pending).await,
            Err(_) => {
                pending.proxy.node.release_slot();
                pending.target.node.release_slot();
                move_ctx.progress.notify_waiters();
            }
        }
    });
}

/// Walk this source's tasks and pick the first (block, proxy) pair that can
/// move right now. Reserves pending-move slots on the target and proxy
/// nodes, marks the block moved, and debits the task and the source quota.
fn choose_next_block_to_move(ctx: &DispatchContext, source: &Arc<Source>) -> Option<PendingMove> {
    let mut tasks = source.tasks().lock();
    let mut i = 0;
    while i < tasks.len() {
        let target = tasks[i].target.clone();
        if !target.node.try_reserve_slot() {
            i += 1;
            continue;
        }
        if let Some((block, proxy)) = choose_block_and_proxy(ctx, source, &target) {
            let block_size = block.num_bytes();
            source.group.dec_scheduled(block_size);
            tasks[i].size = tasks[i].size.saturating_sub(block_size);
            if tasks[i].size == 0 {
                tasks.remove(i);
            }
            return Some(PendingMove {
                block,
                source: source.clone(),
                target,
                proxy,
            });
        }
        // Cancel the tentative reservation and try the next task.
        target.node.release_slot();
        i += 1;
    }
    None
}

/// First block in the working set that qualifies for the target and has a
/// reservable proxy. Qualification and the moved-window insert happen in
/// one critical section so concurrent selectors cannot pick the same block.
fn choose_block_and_proxy(
    ctx: &DispatchContext,
    source: &Arc<Source>,
    target: &Arc<StorageGroup>,
) -> Option<(Arc<BlockRef>, Arc<StorageGroup>)> {
    let mut blocks = source.src_blocks().lock();
    for i in 0..blocks.len() {
        let block = blocks[i].clone();
        let mut proxy = None;
        let selected = ctx.store.select_and_mark(block.id(), || {
            if !is_good_candidate_unmoved(&ctx.topology, source, target, &block) {
                return false;
            }
            proxy = choose_proxy(&ctx.topology, &block, target);
            proxy.is_some()
        });
        if selected {
            blocks.remove(i);
            return Some((block, proxy.expect("proxy chosen when selected")));
        }
    }
    None
}

/// Pick the replica to copy from, preferring the target's node group, then
/// its rack, then any replica whose node can take another pending move.
fn choose_proxy(
    topology: &NetworkTopology,
    block: &BlockRef,
    target: &StorageGroup,
) -> Option<Arc<StorageGroup>> {
    let locations = block.locations();
    if topology.node_group_aware() {
        for loc in &locations {
            if topology.same_node_group(&loc.node.info, &target.node.info)
                && loc.node.try_reserve_slot()
            {
                return Some(loc.clone());
            }
        }
    }
    for loc in &locations {
        if topology.same_rack(&loc.node.info, &target.node.info) && loc.node.try_reserve_slot() {
            return Some(loc.clone());
        }
    }
    for loc in &locations {
        if loc.node.try_reserve_slot() {
            return Some(loc.clone());
        }
    }
    None
}

/// Whether moving `block` from `source` to `target` is allowed: the types
/// match, the block is not in the moved window, the target holds no replica,
/// node-group safety holds, and the move does not reduce the number of
/// distinct racks hosting the block.
pub fn is_good_block_candidate(
    store: &BlockStore,
    topology: &NetworkTopology,
    source: &Source,
    target: &StorageGroup,
    block: &BlockRef,
) -> bool {
    !store.contains_moved(block.id())
        && is_good_candidate_unmoved(topology, source, target, block)
}

fn is_good_candidate_unmoved(
    topology: &NetworkTopology,
    source: &Source,
    target: &StorageGroup,
    block: &BlockRef,
) -> bool {
    if source.group.storage_type != target.storage_type {
        return false;
    }
    if block.located_on(target) {
        return false;
    }
    let locations = block.locations();
    let source_key = source.group.key();

    // Never end up with two replicas in the target's node group.
    if topology.node_group_aware()
        && locations.iter().any(|loc| {
            loc.key() != source_key
                && topology.same_node_group(&loc.node.info, &target.node.info)
        })
    {
        return false;
    }

    // Rack safety: moving within a rack never changes the rack count.
    if topology.same_rack(&source.group.node.info, &target.node.info) {
        return true;
    }
    // Moving onto a rack with no replica adds a rack.
    if !locations
        .iter()
        .any(|loc| topology.same_rack(&loc.node.info, &target.node.info))
    {
        return true;
    }
    // Otherwise the source's rack must keep a replica after the move.
    locations.iter().any(|loc| {
        loc.key() != source_key && topology.same_rack(&loc.node.info, &source.group.node.info)
    })
}

/// Drop working-set blocks that entered the moved window since the last
/// round.
fn filter_moved_blocks(source: &Source, store: &BlockStore) {
    source
        .src_blocks()
        .lock()
        .retain(|b| !store.contains_moved(b.id()));
}

/// One block-listing round: dedupe through the arena, refresh locations, and
/// admit blocks that qualify for any current task. Returns the listed byte
/// total and count.
async fn fetch_block_list(
    ctx: &DispatchContext,
    source: &Arc<Source>,
    blocks_to_receive: u64,
) -> Result<(u64, usize), ServiceError> {
    let size = MAX_BLOCKS_TO_FETCH.min(blocks_to_receive);
    let listed = ctx
        .service
        .blocks_on_node(&source.group.node.info.node_uuid, size)
        .await?;
    let count = listed.len();

    let targets = source.task_targets();
    let mut bytes_received = 0u64;
    for with_locations in listed {
        bytes_received += with_locations.block.num_bytes;
        let block = ctx.store.update_or_insert(with_locations.block);

        let locations: Vec<Arc<StorageGroup>> = with_locations
            .locations
            .iter()
            .filter_map(|(uuid, t)| ctx.group_map.get(&(uuid.clone(), *t)))
            .map(|entry| entry.group().clone())
            .collect();
        block.set_locations(locations);

        let mut src_blocks = source.src_blocks().lock();
        let already_known = src_blocks.iter().any(|b| b.id() == block.id());
        if !already_known
            && targets
                .iter()
                .any(|t| is_good_block_candidate(&ctx.store, &ctx.topology, source, t, &block))
        {
            src_blocks.push(block.clone());
        }
    }
    Ok((bytes_received, count))
}
