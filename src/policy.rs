//! Balancing policies.
//!
//! A policy defines what "utilization" means for classification. The `Node`
//! policy sums every storage type on a node into one figure; the `Pool`
//! policy keeps a separate figure per storage type. Utilizations and
//! averages are percentages in [0, 100].

use std::collections::HashMap;

use crate::error::ConfigError;
use crate::service::{NodeStorageReport, StorageType};

/// Which utilization definition to balance by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    /// One figure per node, all storage types combined.
    Node,
    /// One figure per (node, storage type).
    Pool,
}

impl PolicyKind {
    pub fn parse(name: &str) -> Result<Self, ConfigError> {
        match name.to_ascii_lowercase().as_str() {
            "node" => Ok(PolicyKind::Node),
            "pool" => Ok(PolicyKind::Pool),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PolicyKind::Node => "node",
            PolicyKind::Pool => "pool",
        }
    }
}

/// Accumulates cluster-wide space figures and produces per-type averages.
#[derive(Debug)]
pub struct BalancingPolicy {
    kind: PolicyKind,
    total_capacity: HashMap<StorageType, u64>,
    total_used: HashMap<StorageType, u64>,
    avg_utilization: HashMap<StorageType, f64>,
}

impl BalancingPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            total_capacity: HashMap::new(),
            total_used: HashMap::new(),
            avg_utilization: HashMap::new(),
        }
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Feed one node's report into the cluster totals.
    pub fn accumulate(&mut self, report: &NodeStorageReport) {
        for s in &report.storages {
            *self.total_capacity.entry(s.storage_type).or_default() += s.capacity;
            *self.total_used.entry(s.storage_type).or_default() += s.used;
        }
    }

    /// Compute cluster averages from the accumulated totals.
    pub fn init_avg_utilization(&mut self) {
        self.avg_utilization.clear();
        match self.kind {
            PolicyKind::Node => {
                let capacity: u64 = self.total_capacity.values().sum();
                let used: u64 = self.total_used.values().sum();
                if capacity > 0 {
                    let avg = used as f64 * 100.0 / capacity as f64;
                    for t in StorageType::all() {
                        self.avg_utilization.insert(t, avg);
                    }
                }
            }
            PolicyKind::Pool => {
                for (t, &capacity) in &self.total_capacity {
                    if capacity > 0 {
                        let used = self.total_used.get(t).copied().unwrap_or(0);
                        self.avg_utilization
                            .insert(*t, used as f64 * 100.0 / capacity as f64);
                    }
                }
            }
        }
    }

    /// Cluster average utilization for the given storage type, in percent.
    pub fn avg_utilization(&self, t: StorageType) -> f64 {
        self.avg_utilization.get(&t).copied().unwrap_or(0.0)
    }

    /// Utilization of the given storage type on one node, in percent. `None`
    /// if the node carries no capacity of that type.
    pub fn utilization(&self, report: &NodeStorageReport, t: StorageType) -> Option<f64> {
        if report.capacity(t) == 0 {
            return None;
        }
        let (capacity, used) = match self.kind {
            PolicyKind::Node => report.storages.iter().fold((0u64, 0u64), |(c, u), s| {
                (c + s.capacity, u + s.used)
            }),
            PolicyKind::Pool => report
                .storages
                .iter()
                .filter(|s| s.storage_type == t)
                .fold((0u64, 0u64), |(c, u), s| (c + s.capacity, u + s.used)),
        };
        if capacity == 0 {
            None
        } else {
            Some(used as f64 * 100.0 / capacity as f64)
        }
    }

    /// Clear all accumulated state for the next iteration.
    pub fn reset(&mut self) {
        self.total_capacity.clear();
        self.total_used.clear();
        self.avg_utilization.clear();
    }
}
