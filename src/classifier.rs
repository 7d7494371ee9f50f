//! Utilization classifier.
//!
//! Consumes the name service's storage reports, computes per-type cluster
//! averages through the balancing policy, and assigns every participating
//! storage group to one of four utilization buckets. The report list is
//! shuffled first so that the locality-constrained pairing passes do not
//! systematically favor earlier-seen nodes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, trace};

use crate::config::MAX_SIZE_TO_MOVE;
use crate::model::{GroupKey, Node, Source, StorageGroup};
use crate::policy::BalancingPolicy;
use crate::service::{NodeStorageReport, StorageType};
use crate::util;

/// A classified storage group: plain groups are move targets, sources carry
/// the extra dispatch state.
#[derive(Clone)]
pub enum GroupEntry {
    Plain(Arc<StorageGroup>),
    Source(Arc<Source>),
}

impl GroupEntry {
    pub fn group(&self) -> &Arc<StorageGroup> {
        match self {
            GroupEntry::Plain(g) => g,
            GroupEntry::Source(s) => &s.group,
        }
    }
}

/// Result of classifying one round of storage reports.
pub struct Classification {
    pub over_utilized: Vec<Arc<Source>>,
    pub above_avg_utilized: Vec<Arc<Source>>,
    pub below_avg_utilized: Vec<Arc<StorageGroup>>,
    pub under_utilized: Vec<Arc<StorageGroup>>,
    /// Every classified group, keyed by (node uuid, storage type).
    pub group_map: HashMap<GroupKey, GroupEntry>,
    /// Every participating node.
    pub nodes: Vec<Arc<Node>>,
    /// `max(Σ overloaded, Σ underloaded)` bytes outside the threshold band.
    pub bytes_left_to_move: u64,
}

impl Classification {
    pub fn bucket_sizes(&self) -> (usize, usize, usize, usize) {
        (
            self.over_utilized.len(),
            self.above_avg_utilized.len(),
            self.below_avg_utilized.len(),
            self.under_utilized.len(),
        )
    }
}

/// Filtering rules for node participation.
pub struct NodeFilter {
    pub excluded: HashSet<String>,
    pub included: HashSet<String>,
}

impl NodeFilter {
    pub fn none() -> Self {
        Self {
            excluded: HashSet::new(),
            included: HashSet::new(),
        }
    }

    /// Decommissioned/decommissioning nodes never participate; excluded
    /// nodes are skipped; a non-empty include set restricts participation to
    /// its members.
    pub fn should_ignore(&self, report: &NodeStorageReport) -> bool {
        let node = &report.node;
        let ignored = node.decommissioned
            || node.decommissioning
            || util::host_set_matches(&self.excluded, node)
            || (!self.included.is_empty() && !util::host_set_matches(&self.included, node));
        if ignored {
            trace!(node = %node.node_uuid, "excluding node from balancing");
        }
        ignored
    }
}

/// Convert a percentage of a capacity into bytes.
pub fn pct_to_bytes(pct: f64, capacity: u64) -> u64 {
    debug_assert!(pct >= 0.0, "pct = {} < 0", pct);
    (pct * capacity as f64 / 100.0) as u64
}

/// Per-group move budget: one threshold band worth of bytes, capped at
/// [`MAX_SIZE_TO_MOVE`]; receiving groups are further capped by their
/// remaining space.
fn compute_max_size_to_move(
    capacity: u64,
    remaining: u64,
    utilization_diff: f64,
    threshold: f64,
) -> u64 {
    let diff = threshold.min(utilization_diff.abs());
    let mut max_size = pct_to_bytes(diff, capacity);
    if utilization_diff < 0.0 {
        max_size = max_size.min(remaining);
    }
    max_size.min(MAX_SIZE_TO_MOVE)
}

/// Classify one round of storage reports into utilization buckets.
///
/// `policy` must be freshly reset; averages are accumulated here. Returns
/// the buckets plus the number of bytes that sit outside the threshold band
/// cluster-wide.
pub fn classify(
    policy: &mut BalancingPolicy,
    reports: &[NodeStorageReport],
    threshold: f64,
    filter: &NodeFilter,
    max_concurrent_moves_per_node: usize,
) -> Classification {
    for report in reports {
        if filter.should_ignore(report) {
            continue;
        }
        policy.accumulate(report);
    }
    policy.init_avg_utilization();

    let mut shuffled: Vec<&NodeStorageReport> =
        reports.iter().filter(|r| !filter.should_ignore(r)).collect();
    shuffled.shuffle(&mut rand::thread_rng());

    let mut classification = Classification {
        over_utilized: Vec::new(),
        above_avg_utilized: Vec::new(),
        below_avg_utilized: Vec::new(),
        under_utilized: Vec::new(),
        group_map: HashMap::new(),
        nodes: Vec::new(),
        bytes_left_to_move: 0,
    };

    let mut overloaded_bytes = 0u64;
    let mut underloaded_bytes = 0u64;

    for report in shuffled {
        let node = Arc::new(Node::new(report.node.clone(), max_concurrent_moves_per_node));
        classification.nodes.push(node.clone());

        for t in StorageType::all() {
            let Some(utilization) = policy.utilization(report, t) else {
                continue;
            };
            let capacity = report.capacity(t);
            let utilization_diff = utilization - policy.avg_utilization(t);
            let threshold_diff = utilization_diff.abs() - threshold;
            let max_size_to_move = compute_max_size_to_move(
                capacity,
                report.remaining(t),
                utilization_diff,
                threshold,
            );

            let group = Arc::new(StorageGroup::new(
                node.clone(),
                t,
                utilization,
                max_size_to_move,
            ));

            let entry = if utilization_diff > 0.0 {
                let source = Arc::new(Source::new(group));
                if threshold_diff <= 0.0 {
                    classification.above_avg_utilized.push(source.clone());
                } else {
                    overloaded_bytes += pct_to_bytes(threshold_diff, capacity);
                    classification.over_utilized.push(source.clone());
                }
                GroupEntry::Source(source)
            } else {
                if threshold_diff <= 0.0 {
                    classification.below_avg_utilized.push(group.clone());
                } else {
                    underloaded_bytes += pct_to_bytes(threshold_diff, capacity);
                    classification.under_utilized.push(group.clone());
                }
                GroupEntry::Plain(group)
            };
            classification
                .group_map
                .insert(entry.group().key(), entry);
        }
    }

    let (over, above, below, under) = classification.bucket_sizes();
    info!(over_utilized = over, under_utilized = under, "classified storage groups");
    debug!(above_average = above, below_average = below, "in-band storage groups");
    debug_assert_eq!(
        classification.group_map.len(),
        over + above + below + under,
        "mismatched number of storage groups"
    );

    classification.bytes_left_to_move = overloaded_bytes.max(underloaded_bytes);
    classification
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::PolicyKind;
    use crate::service::{NodeInfo, StorageReport};

    fn make_report(uuid: &str, rack: &str, capacity: u64, used: u64) -> NodeStorageReport {
        NodeStorageReport {
            node: NodeInfo {
                node_uuid: uuid.to_string(),
                hostname: format!("{}.example.com", uuid),
                ip_addr: format!("10.0.0.{}", uuid.len()),
                transfer_port: 9866,
                rack: rack.to_string(),
                node_group: None,
                decommissioned: false,
                decommissioning: false,
            },
            storages: vec![StorageReport {
                storage_type: StorageType::Disk,
                capacity,
                used,
                remaining: capacity - used,
            }],
        }
    }

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_balanced_cluster_has_nothing_to_move() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 50 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 50 * GIB),
            make_report("dn-c", "/r2", 100 * GIB, 50 * GIB),
        ];
        let c = classify(&mut policy, &reports, 10.0, &NodeFilter::none(), 5);
        assert_eq!(c.bytes_left_to_move, 0);
        assert_eq!(c.bucket_sizes(), (0, 0, 3, 0));
    }

    #[test]
    fn test_over_and_under_bucketing() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 10 * GIB),
        ];
        let c = classify(&mut policy, &reports, 10.0, &NodeFilter::none(), 5);

        // avg = 50%; dn-a at +40, dn-b at -40, both outside the band.
        assert_eq!(c.bucket_sizes(), (1, 0, 0, 1));
        assert_eq!(c.over_utilized[0].group.node.info.node_uuid, "dn-a");
        assert_eq!(c.under_utilized[0].node.info.node_uuid, "dn-b");

        // 30% of 100 GiB outside the band on each side.
        assert_eq!(c.bytes_left_to_move, 30 * GIB);
    }

    #[test]
    fn test_every_live_node_lands_in_exactly_one_bucket() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 55 * GIB),
            make_report("dn-c", "/r2", 100 * GIB, 45 * GIB),
            make_report("dn-d", "/r2", 100 * GIB, 10 * GIB),
        ];
        let c = classify(&mut policy, &reports, 10.0, &NodeFilter::none(), 5);
        let (over, above, below, under) = c.bucket_sizes();
        assert_eq!(over + above + below + under, 4);
        assert_eq!(c.group_map.len(), 4);
        assert_eq!(c.nodes.len(), 4);
    }

    #[test]
    fn test_bytes_left_is_max_of_sides() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        // One node far over, two slightly under: overload side dominates.
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 95 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 35 * GIB),
            make_report("dn-c", "/r2", 100 * GIB, 35 * GIB),
        ];
        let c = classify(&mut policy, &reports, 10.0, &NodeFilter::none(), 5);

        // avg = 55%; overload = (95-55-10)% of 100 GiB = 30 GiB;
        // underload = 2 × (20-10)% of 100 GiB = 20 GiB.
        let expected_over = pct_to_bytes(30.0, 100 * GIB);
        let expected_under = 2 * pct_to_bytes(10.0, 100 * GIB);
        assert_eq!(c.bytes_left_to_move, expected_over.max(expected_under));
    }

    #[test]
    fn test_max_size_to_move_caps() {
        // Band smaller than the cap.
        assert_eq!(
            compute_max_size_to_move(100 * GIB, 50 * GIB, 25.0, 10.0),
            10 * GIB
        );
        // Band limited by the utilization diff.
        assert_eq!(
            compute_max_size_to_move(100 * GIB, 50 * GIB, 4.0, 10.0),
            4 * GIB
        );
        // Receiving side capped by remaining space.
        assert_eq!(
            compute_max_size_to_move(100 * GIB, 2 * GIB, -25.0, 10.0),
            2 * GIB
        );
        // Global 10 GiB cap.
        assert_eq!(
            compute_max_size_to_move(1000 * GIB, 1000 * GIB, 25.0, 10.0),
            10 * GIB
        );
    }

    #[test]
    fn test_excluded_nodes_do_not_participate() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 10 * GIB),
        ];
        let filter = NodeFilter {
            excluded: util::parse_host_list("dn-a.example.com"),
            included: HashSet::new(),
        };
        let c = classify(&mut policy, &reports, 10.0, &filter, 5);
        assert_eq!(c.nodes.len(), 1);
        assert_eq!(c.nodes[0].info.node_uuid, "dn-b");
        // With only dn-b, the average equals its own utilization.
        assert_eq!(c.bytes_left_to_move, 0);
    }

    #[test]
    fn test_include_list_restricts_participation() {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let mut decommissioning = make_report("dn-c", "/r2", 100 * GIB, 50 * GIB);
        decommissioning.node.decommissioning = true;
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 10 * GIB),
            decommissioning,
        ];
        let filter = NodeFilter {
            excluded: HashSet::new(),
            included: util::parse_host_list("dn-a.example.com,dn-b.example.com,dn-c.example.com"),
        };
        let c = classify(&mut policy, &reports, 10.0, &filter, 5);
        // dn-c is decommissioning and stays out despite being included.
        assert_eq!(c.nodes.len(), 2);
    }

    #[test]
    fn test_node_slot_capacity_comes_from_config() {
        // The per-node move cap must be the configured value, independent of
        // how many under-loaded bytes the cluster carries.
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        let reports = vec![
            make_report("dn-a", "/r1", 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", 100 * GIB, 10 * GIB),
        ];
        let c = classify(&mut policy, &reports, 10.0, &NodeFilter::none(), 7);
        assert!(c.bytes_left_to_move > 0);
        for node in &c.nodes {
            assert_eq!(node.max_concurrent_moves(), 7);
        }
    }
}
