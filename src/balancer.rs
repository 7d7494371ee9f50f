//! One balancing iteration against one name service.
//!
//! An iteration runs classify → pair → dispatch → report and returns a
//! status that drives the outer loop: `InProgress` keeps iterating,
//! `Success` means the cluster is balanced, everything else terminates the
//! run. Block identity (the arena) and the moved-block window survive
//! across iterations; all other state is cleared by [`Balancer::reset_data`].

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Notify, Semaphore};
use tracing::{error, info};

use crate::block::BlockStore;
use crate::classifier::{self, NodeFilter};
use crate::config::Config;
use crate::dispatch::{self, DispatchContext};
use crate::error::{ConfigError, ExitStatus, ServiceError};
use crate::model::{GroupKey, Node, Source, StorageGroup};
use crate::pairer;
use crate::policy::{BalancingPolicy, PolicyKind};
use crate::service::{ChannelAuthenticator, NameService};
use crate::topology::NetworkTopology;
use crate::util;

/// Operator-supplied balancing parameters.
#[derive(Debug, Clone)]
pub struct BalancerParams {
    pub policy: PolicyKind,
    /// Allowed deviation from the cluster average, in percent.
    pub threshold: f64,
    pub excluded: HashSet<String>,
    pub included: HashSet<String>,
    pub node_group_aware: bool,
}

impl Default for BalancerParams {
    fn default() -> Self {
        Self {
            policy: PolicyKind::Node,
            threshold: 10.0,
            excluded: HashSet::new(),
            included: HashSet::new(),
            node_group_aware: false,
        }
    }
}

impl BalancerParams {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1.0..=100.0).contains(&self.threshold) {
            return Err(ConfigError::ThresholdOutOfRange(self.threshold));
        }
        if !self.excluded.is_empty() && !self.included.is_empty() {
            return Err(ConfigError::ExcludeIncludeConflict);
        }
        Ok(())
    }
}

/// Per-iteration collections retained for inspection until the next
/// `reset_data`.
struct IterationState {
    sources: Vec<Arc<Source>>,
    targets: Vec<Arc<StorageGroup>>,
    group_map: Arc<HashMap<GroupKey, classifier::GroupEntry>>,
    nodes: Vec<Arc<Node>>,
}

/// Drives balancing iterations against one name service.
pub struct Balancer {
    service: Arc<dyn NameService>,
    authenticator: Arc<dyn ChannelAuthenticator>,
    params: BalancerParams,
    config: Config,
    policy: BalancingPolicy,
    topology: Arc<NetworkTopology>,
    store: Arc<BlockStore>,
    bytes_moved: Arc<AtomicU64>,
    progress: Arc<Notify>,
    dispatcher_pool: Arc<Semaphore>,
    mover_pool: Arc<Semaphore>,
    iteration_state: Option<IterationState>,
}

impl Balancer {
    pub fn new(
        service: Arc<dyn NameService>,
        authenticator: Arc<dyn ChannelAuthenticator>,
        params: BalancerParams,
        config: Config,
    ) -> Self {
        let topology = Arc::new(NetworkTopology::new(params.node_group_aware));
        let store = Arc::new(BlockStore::new(config.moved_win_width));
        let dispatcher_pool = Arc::new(Semaphore::new(config.dispatcher_threads));
        let mover_pool = Arc::new(Semaphore::new(config.mover_threads));
        let policy = BalancingPolicy::new(params.policy);
        Self {
            service,
            authenticator,
            params,
            config,
            policy,
            topology,
            store,
            bytes_moved: Arc::new(AtomicU64::new(0)),
            progress: Arc::new(Notify::new()),
            dispatcher_pool,
            mover_pool,
            iteration_state: None,
        }
    }

    /// Total bytes moved against this name service so far.
    pub fn bytes_moved(&self) -> u64 {
        self.bytes_moved.load(Ordering::SeqCst)
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    /// True between `run_iteration` and `reset_data`.
    pub fn has_iteration_state(&self) -> bool {
        self.iteration_state.is_some()
    }

    /// Run one iteration: fetch reports, classify, pair, dispatch, report.
    pub async fn run_iteration(&mut self, iteration: usize) -> ExitStatus {
        match self.run_iteration_inner(iteration).await {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, "iteration failed");
                println!("{}.  Exiting ...", e);
                ExitStatus::from(&e)
            }
        }
    }

    async fn run_iteration_inner(&mut self, iteration: usize) -> Result<ExitStatus, ServiceError> {
        let reports = self.service.storage_reports().await?;

        self.policy.reset();
        let filter = NodeFilter {
            excluded: self.params.excluded.clone(),
            included: self.params.included.clone(),
        };
        let mut classification = classifier::classify(
            &mut self.policy,
            &reports,
            self.params.threshold,
            &filter,
            self.config.max_concurrent_moves_per_node,
        );

        let bytes_left_to_move = classification.bytes_left_to_move;
        if bytes_left_to_move == 0 {
            println!("The cluster is balanced. Exiting...");
            return Ok(ExitStatus::Success);
        }
        info!(
            "Need to move {} to make the cluster balanced.",
            util::byte_desc(bytes_left_to_move)
        );

        let outcome = pairer::choose_storage_groups(&mut classification, &self.topology);
        if outcome.bytes_to_move == 0 {
            println!("No block can be moved. Exiting...");
            return Ok(ExitStatus::NoMoveBlock);
        }
        info!(
            "Will move {} in this iteration",
            util::byte_desc(outcome.bytes_to_move)
        );

        println!(
            "{:<24} {:>10}  {:>19}  {:>18}  {:>17}",
            chrono::Local::now()
                .format("%b %-d, %Y %-I:%M:%S %p")
                .to_string(),
            iteration,
            util::byte_desc(self.bytes_moved()),
            util::byte_desc(bytes_left_to_move),
            util::byte_desc(outcome.bytes_to_move),
        );

        let group_map = Arc::new(std::mem::take(&mut classification.group_map));
        let ctx = DispatchContext {
            topology: self.topology.clone(),
            store: self.store.clone(),
            service: self.service.clone(),
            authenticator: self.authenticator.clone(),
            group_map: group_map.clone(),
            bytes_moved: self.bytes_moved.clone(),
            progress: self.progress.clone(),
            dispatcher_pool: self.dispatcher_pool.clone(),
            mover_pool: self.mover_pool.clone(),
            config: self.config.clone(),
        };
        let moved_this_iteration =
            dispatch::dispatch_block_moves(&ctx, &outcome.sources, &outcome.targets).await;

        self.iteration_state = Some(IterationState {
            sources: outcome.sources,
            targets: outcome.targets,
            group_map,
            nodes: std::mem::take(&mut classification.nodes),
        });

        if !self.service.should_continue(moved_this_iteration) {
            return Ok(ExitStatus::NoMoveProgress);
        }
        Ok(ExitStatus::InProgress)
    }

    /// Sources participating in the last iteration, until `reset_data`.
    pub fn last_source_count(&self) -> usize {
        self.iteration_state.as_ref().map_or(0, |s| s.sources.len())
    }

    /// Targets participating in the last iteration, until `reset_data`.
    pub fn last_target_count(&self) -> usize {
        self.iteration_state.as_ref().map_or(0, |s| s.targets.len())
    }

    /// Storage groups classified in the last iteration, until `reset_data`.
    pub fn last_group_count(&self) -> usize {
        self.iteration_state.as_ref().map_or(0, |s| s.group_map.len())
    }

    /// Nodes that participated in the last iteration, until `reset_data`.
    pub fn last_cluster_size(&self) -> usize {
        self.iteration_state.as_ref().map_or(0, |s| s.nodes.len())
    }

    /// Clear per-iteration state: buckets, pair sets, the group map and the
    /// node list are dropped; the block arena is trimmed to blocks still in
    /// the moved window; the window itself ages out by time.
    pub fn reset_data(&mut self) {
        self.iteration_state = None;
        self.policy.reset();
        self.store.reset();
    }
}
