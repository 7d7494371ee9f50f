//! Source/target pairing.
//!
//! Matches over-utilized groups to under-utilized groups in three passes of
//! progressively looser locality (same node group, same rack, anywhere),
//! each pass working through three bucket pairs. A match reserves
//! `min(source.available, target.available)` bytes on both sides and records
//! a task on the source. Exhausted groups fall out of their buckets.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::info;

use crate::classifier::Classification;
use crate::model::{GroupKey, Source, StorageGroup, Task};
use crate::topology::{Matcher, NetworkTopology};
use crate::util;

/// The pairing result: participating sources and targets, and the total
/// bytes scheduled for this iteration.
pub struct PairingOutcome {
    pub sources: Vec<Arc<Source>>,
    pub targets: Vec<Arc<StorageGroup>>,
    pub bytes_to_move: u64,
}

struct PairSets {
    sources: Vec<Arc<Source>>,
    targets: Vec<Arc<StorageGroup>>,
    source_keys: HashSet<GroupKey>,
    target_keys: HashSet<GroupKey>,
}

impl PairSets {
    fn record(&mut self, source: &Arc<Source>, target: &Arc<StorageGroup>) {
        if self.source_keys.insert(source.group.key()) {
            self.sources.push(source.clone());
        }
        if self.target_keys.insert(target.key()) {
            self.targets.push(target.clone());
        }
    }
}

/// Decide all (source, target) pairs for this iteration and the bytes to
/// move between each. Consumes the classification buckets.
pub fn choose_storage_groups(
    classification: &mut Classification,
    topology: &NetworkTopology,
) -> PairingOutcome {
    let mut sets = PairSets {
        sources: Vec::new(),
        targets: Vec::new(),
        source_keys: HashSet::new(),
        target_keys: HashSet::new(),
    };

    if topology.node_group_aware() {
        run_pass(classification, topology, Matcher::SameNodeGroup, &mut sets);
    }
    run_pass(classification, topology, Matcher::SameRack, &mut sets);
    run_pass(classification, topology, Matcher::AnyOther, &mut sets);

    let bytes_to_move = sets.sources.iter().map(|s| s.scheduled_bytes()).sum();
    PairingOutcome {
        sources: sets.sources,
        targets: sets.targets,
        bytes_to_move,
    }
}

fn run_pass(
    classification: &mut Classification,
    topology: &NetworkTopology,
    matcher: Matcher,
    sets: &mut PairSets,
) {
    // Over-utilized sources drain into under-utilized targets first, then
    // into below-average targets; remaining under-utilized targets pull from
    // above-average sources.
    pair_sources_with_targets(
        &mut classification.over_utilized,
        &mut classification.under_utilized,
        topology,
        matcher,
        sets,
    );
    pair_sources_with_targets(
        &mut classification.over_utilized,
        &mut classification.below_avg_utilized,
        topology,
        matcher,
        sets,
    );
    pair_targets_with_sources(
        &mut classification.under_utilized,
        &mut classification.above_avg_utilized,
        topology,
        matcher,
        sets,
    );
}

fn pair_sources_with_targets(
    sources: &mut Vec<Arc<Source>>,
    candidates: &mut Vec<Arc<StorageGroup>>,
    topology: &NetworkTopology,
    matcher: Matcher,
    sets: &mut PairSets,
) {
    let mut i = 0;
    while i < sources.len() {
        let source = sources[i].clone();
        while source.group.has_space() {
            let Some(target) = take_candidate(candidates, &source.group, topology, matcher) else {
                break;
            };
            match_source_with_target(&source, &target, sets);
        }
        if !source.group.has_space() {
            sources.remove(i);
        } else {
            i += 1;
        }
    }
}

fn pair_targets_with_sources(
    targets: &mut Vec<Arc<StorageGroup>>,
    candidates: &mut Vec<Arc<Source>>,
    topology: &NetworkTopology,
    matcher: Matcher,
    sets: &mut PairSets,
) {
    let mut i = 0;
    while i < targets.len() {
        let target = targets[i].clone();
        while target.has_space() {
            let chosen = {
                let mut j = 0;
                let mut found = None;
                while j < candidates.len() {
                    let c = &candidates[j];
                    if !c.group.has_space() {
                        candidates.remove(j);
                        continue;
                    }
                    if matcher.matches(topology, &c.group.node.info, &target.node.info) {
                        found = Some(candidates[j].clone());
                        break;
                    }
                    j += 1;
                }
                found
            };
            let Some(source) = chosen else {
                break;
            };
            match_source_with_target(&source, &target, sets);
            if !source.group.has_space() {
                candidates.retain(|c| c.group.key() != source.group.key());
            }
        }
        if !target.has_space() {
            targets.remove(i);
        } else {
            i += 1;
        }
    }
}

/// Scan `candidates` for a matching group with remaining space, pruning
/// exhausted entries along the way. The chosen candidate is removed once it
/// runs out of space.
fn take_candidate(
    candidates: &mut Vec<Arc<StorageGroup>>,
    group: &Arc<StorageGroup>,
    topology: &NetworkTopology,
    matcher: Matcher,
) -> Option<Arc<StorageGroup>> {
    let mut j = 0;
    while j < candidates.len() {
        let c = &candidates[j];
        if !c.has_space() {
            candidates.remove(j);
            continue;
        }
        if matcher.matches(topology, &group.node.info, &c.node.info) {
            let chosen = candidates[j].clone();
            return Some(chosen);
        }
        j += 1;
    }
    None
}

fn match_source_with_target(source: &Arc<Source>, target: &Arc<StorageGroup>, sets: &mut PairSets) {
    let size = source
        .group
        .available_to_move()
        .min(target.available_to_move());
    source.add_task(Task {
        target: target.clone(),
        size,
    });
    target.inc_scheduled(size);
    sets.record(source, target);
    info!(
        "Decided to move {} from {} to {}",
        util::byte_desc(size),
        source.group.display_name(),
        target.display_name()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::{classify, NodeFilter};
    use crate::policy::{BalancingPolicy, PolicyKind};
    use crate::service::{NodeInfo, NodeStorageReport, StorageReport, StorageType};

    const GIB: u64 = 1 << 30;

    fn make_report(
        uuid: &str,
        rack: &str,
        group: Option<&str>,
        capacity: u64,
        used: u64,
    ) -> NodeStorageReport {
        NodeStorageReport {
            node: NodeInfo {
                node_uuid: uuid.to_string(),
                hostname: format!("{}.example.com", uuid),
                ip_addr: "10.0.0.1".to_string(),
                transfer_port: 9866,
                rack: rack.to_string(),
                node_group: group.map(str::to_string),
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

    fn classify_reports(reports: &[NodeStorageReport]) -> Classification {
        let mut policy = BalancingPolicy::new(PolicyKind::Node);
        classify(&mut policy, reports, 10.0, &NodeFilter::none(), 5)
    }

    #[test]
    fn test_pairs_over_with_under() {
        let reports = vec![
            make_report("dn-a", "/r1", None, 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", None, 100 * GIB, 10 * GIB),
        ];
        let mut c = classify_reports(&reports);
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(false));

        assert_eq!(outcome.sources.len(), 1);
        assert_eq!(outcome.targets.len(), 1);
        assert_eq!(outcome.sources[0].group.node.info.node_uuid, "dn-a");
        assert_eq!(outcome.targets[0].node.info.node_uuid, "dn-b");
        // Both sides have a 10 GiB band budget.
        assert_eq!(outcome.bytes_to_move, 10 * GIB);

        // I2: task sizes account for every scheduled byte.
        for source in &outcome.sources {
            let task_sum: u64 = source.tasks().lock().iter().map(|t| t.size).sum();
            assert_eq!(task_sum, source.scheduled_bytes());
        }
    }

    #[test]
    fn test_quota_respected_on_both_sides() {
        let reports = vec![
            make_report("dn-a", "/r1", None, 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", None, 100 * GIB, 86 * GIB),
            make_report("dn-c", "/r1", None, 100 * GIB, 10 * GIB),
            make_report("dn-d", "/r1", None, 100 * GIB, 10 * GIB),
        ];
        let mut c = classify_reports(&reports);
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(false));

        for source in &outcome.sources {
            assert!(source.group.scheduled_bytes() <= source.group.max_size_to_move);
        }
        for target in &outcome.targets {
            assert!(target.scheduled_bytes() <= target.max_size_to_move);
        }
        let target_total: u64 = outcome.targets.iter().map(|t| t.scheduled_bytes()).sum();
        assert_eq!(outcome.bytes_to_move, target_total);
    }

    #[test]
    fn test_same_rack_preferred_over_remote() {
        // dn-b (same rack as the source) and dn-c (other rack) both have
        // room; the rack pass must fill dn-b before the any pass sees dn-c.
        let reports = vec![
            make_report("dn-a", "/r1", None, 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", None, 100 * GIB, 30 * GIB),
            make_report("dn-c", "/r2", None, 100 * GIB, 30 * GIB),
        ];
        let mut c = classify_reports(&reports);
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(false));

        let source = &outcome.sources[0];
        let tasks = source.tasks().lock();
        assert_eq!(tasks[0].target.node.info.node_uuid, "dn-b");
    }

    #[test]
    fn test_node_group_pass_runs_when_aware() {
        let reports = vec![
            make_report("dn-a", "/r1", Some("g1"), 100 * GIB, 90 * GIB),
            make_report("dn-b", "/r1", Some("g1"), 100 * GIB, 30 * GIB),
            make_report("dn-c", "/r1", Some("g2"), 100 * GIB, 30 * GIB),
        ];
        let mut c = classify_reports(&reports);
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(true));

        let source = &outcome.sources[0];
        let tasks = source.tasks().lock();
        assert_eq!(tasks[0].target.node.info.node_uuid, "dn-b");
    }

    #[test]
    fn test_above_average_feeds_under_utilized() {
        // Three nodes slightly above average (inside the band), one far
        // under. Sub-pass (c) pulls from the above-average sources.
        let reports = vec![
            make_report("dn-a", "/r1", None, 100 * GIB, 55 * GIB),
            make_report("dn-b", "/r1", None, 100 * GIB, 55 * GIB),
            make_report("dn-c", "/r1", None, 100 * GIB, 55 * GIB),
            make_report("dn-d", "/r1", None, 100 * GIB, 25 * GIB),
        ];
        let mut c = classify_reports(&reports);
        assert_eq!(c.bucket_sizes().0, 0, "no over-utilized group expected");
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(false));

        assert!(outcome.bytes_to_move > 0);
        assert!(outcome
            .targets
            .iter()
            .any(|t| t.node.info.node_uuid == "dn-d"));
    }

    #[test]
    fn test_balanced_cluster_pairs_nothing() {
        let reports = vec![
            make_report("dn-a", "/r1", None, 100 * GIB, 50 * GIB),
            make_report("dn-b", "/r1", None, 100 * GIB, 50 * GIB),
        ];
        let mut c = classify_reports(&reports);
        let outcome = choose_storage_groups(&mut c, &NetworkTopology::new(false));
        assert_eq!(outcome.bytes_to_move, 0);
        assert!(outcome.sources.is_empty());
        assert!(outcome.targets.is_empty());
    }
}
