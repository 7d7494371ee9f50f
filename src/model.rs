//! Cluster data model for one balancing iteration.
//!
//! A [`Node`] is a storage host with a bounded budget of in-flight moves and
//! an error back-off clock. A [`StorageGroup`] is the balancing unit: all
//! storage of one type on one node. Groups whose utilization sits above the
//! cluster average become [`Source`]s, which additionally carry the planned
//! [`Task`]s and the working set of candidate blocks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::block::BlockRef;
use crate::service::{NodeInfo, StorageType};

/// Key of a storage group: node identity plus storage type.
pub type GroupKey = (String, StorageType);

#[derive(Debug)]
struct NodeState {
    delay_until: Option<Instant>,
    pending_moves: usize,
}

/// A storage host participating in this iteration.
#[derive(Debug)]
pub struct Node {
    pub info: NodeInfo,
    max_concurrent_moves: usize,
    state: Mutex<NodeState>,
}

impl Node {
    pub fn new(info: NodeInfo, max_concurrent_moves: usize) -> Self {
        Self {
            info,
            max_concurrent_moves,
            state: Mutex::new(NodeState {
                delay_until: None,
                pending_moves: 0,
            }),
        }
    }

    pub fn max_concurrent_moves(&self) -> usize {
        self.max_concurrent_moves
    }

    /// Reserve a pending-move slot. Fails while the node is backing off from
    /// an error or already runs its maximum number of concurrent moves.
    pub fn try_reserve_slot(&self) -> bool {
        let mut state = self.state.lock();
        if let Some(until) = state.delay_until {
            if Instant::now() < until {
                return false;
            }
            state.delay_until = None;
        }
        if state.pending_moves >= self.max_concurrent_moves {
            return false;
        }
        state.pending_moves += 1;
        true
    }

    /// Release a slot taken by [`Node::try_reserve_slot`]. Both success and
    /// failure paths of a move must release.
    pub fn release_slot(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.pending_moves > 0);
        state.pending_moves = state.pending_moves.saturating_sub(1);
    }

    /// Reject new pending moves on this node for the given delay.
    pub fn activate_delay(&self, delay: Duration) {
        self.state.lock().delay_until = Some(Instant::now() + delay);
    }

    /// True while the error back-off is in effect.
    pub fn delay_active(&self) -> bool {
        let mut state = self.state.lock();
        match state.delay_until {
            Some(until) if Instant::now() < until => true,
            Some(_) => {
                state.delay_until = None;
                false
            }
            None => false,
        }
    }

    pub fn pending_moves(&self) -> usize {
        self.state.lock().pending_moves
    }

    pub fn has_pending_moves(&self) -> bool {
        self.pending_moves() > 0
    }
}

/// All storage of one type on one node; the unit the balancer schedules
/// bytes against.
#[derive(Debug)]
pub struct StorageGroup {
    pub node: Arc<Node>,
    pub storage_type: StorageType,
    /// Utilization of this group in percent.
    pub utilization: f64,
    /// Bytes this group may send or receive in this iteration.
    pub max_size_to_move: u64,
    scheduled: Mutex<u64>,
}

impl StorageGroup {
    pub fn new(
        node: Arc<Node>,
        storage_type: StorageType,
        utilization: f64,
        max_size_to_move: u64,
    ) -> Self {
        Self {
            node,
            storage_type,
            utilization,
            max_size_to_move,
            scheduled: Mutex::new(0),
        }
    }

    pub fn key(&self) -> GroupKey {
        (self.node.info.node_uuid.clone(), self.storage_type)
    }

    /// Bytes still schedulable against this group's iteration budget.
    pub fn available_to_move(&self) -> u64 {
        self.max_size_to_move.saturating_sub(*self.scheduled.lock())
    }

    pub fn has_space(&self) -> bool {
        self.available_to_move() > 0
    }

    pub fn scheduled_bytes(&self) -> u64 {
        *self.scheduled.lock()
    }

    pub fn inc_scheduled(&self, bytes: u64) {
        let mut scheduled = self.scheduled.lock();
        *scheduled += bytes;
        debug_assert!(*scheduled <= self.max_size_to_move);
    }

    pub fn dec_scheduled(&self, bytes: u64) {
        let mut scheduled = self.scheduled.lock();
        *scheduled = scheduled.saturating_sub(bytes);
    }

    pub fn reset_scheduled(&self) {
        *self.scheduled.lock() = 0;
    }

    /// Name used in log lines and the progress report.
    pub fn display_name(&self) -> String {
        format!("{}:{}", self.node.info.node_uuid, self.storage_type)
    }
}

/// A planned transfer quota from one source to one target group. `size`
/// shrinks as individual blocks are dispatched; the task is dropped at zero.
#[derive(Debug)]
pub struct Task {
    pub target: Arc<StorageGroup>,
    pub size: u64,
}

/// An over- or above-average group: a storage group that will send replicas
/// away, with its planned tasks and candidate-block working set.
#[derive(Debug)]
pub struct Source {
    pub group: Arc<StorageGroup>,
    tasks: Mutex<Vec<Task>>,
    src_blocks: Mutex<Vec<Arc<BlockRef>>>,
}

impl Source {
    pub fn new(group: Arc<StorageGroup>) -> Self {
        Self {
            group,
            tasks: Mutex::new(Vec::new()),
            src_blocks: Mutex::new(Vec::new()),
        }
    }

    /// Record a planned transfer and reserve its bytes on this source.
    pub fn add_task(&self, task: Task) {
        debug_assert!(
            task.target.key() != self.group.key(),
            "source and target are the same storage group {}",
            self.group.display_name()
        );
        self.group.inc_scheduled(task.size);
        self.tasks.lock().push(task);
    }

    pub fn tasks(&self) -> &Mutex<Vec<Task>> {
        &self.tasks
    }

    pub fn task_targets(&self) -> Vec<Arc<StorageGroup>> {
        self.tasks.lock().iter().map(|t| t.target.clone()).collect()
    }

    pub fn src_blocks(&self) -> &Mutex<Vec<Arc<BlockRef>>> {
        &self.src_blocks
    }

    pub fn src_block_count(&self) -> usize {
        self.src_blocks.lock().len()
    }

    pub fn scheduled_bytes(&self) -> u64 {
        self.group.scheduled_bytes()
    }
}

/// A staged transfer of one block: copy from `proxy` to `target`, debited
/// against `source`'s quota. Holds one pending-move slot on the proxy's node
/// and one on the target's node until the mover releases them.
pub struct PendingMove {
    pub block: Arc<BlockRef>,
    pub source: Arc<Source>,
    pub target: Arc<StorageGroup>,
    pub proxy: Arc<StorageGroup>,
}

impl std::fmt::Display for PendingMove {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} with size={} from {} to {} through {}",
            self.block.meta().id,
            self.block.meta().num_bytes,
            self.source.group.display_name(),
            self.target.display_name(),
            self.proxy.node.info.node_uuid,
        )
    }
}
