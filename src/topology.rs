//! Rack and node-group locality queries.

use crate::service::NodeInfo;

/// Pure locality oracle over the placement fields the name service reports.
#[derive(Debug, Clone)]
pub struct NetworkTopology {
    node_group_aware: bool,
}

impl NetworkTopology {
    pub fn new(node_group_aware: bool) -> Self {
        Self { node_group_aware }
    }

    /// Whether the cluster topology defines node groups below the rack level.
    pub fn node_group_aware(&self) -> bool {
        self.node_group_aware
    }

    pub fn same_rack(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        a.rack == b.rack
    }

    pub fn same_node_group(&self, a: &NodeInfo, b: &NodeInfo) -> bool {
        match (&a.node_group, &b.node_group) {
            (Some(ga), Some(gb)) => a.rack == b.rack && ga == gb,
            _ => false,
        }
    }
}

/// Locality constraint applied during source/target pairing, from tightest
/// to loosest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Matcher {
    SameNodeGroup,
    SameRack,
    AnyOther,
}

impl Matcher {
    pub fn matches(self, topology: &NetworkTopology, a: &NodeInfo, b: &NodeInfo) -> bool {
        match self {
            Matcher::SameNodeGroup => topology.same_node_group(a, b),
            Matcher::SameRack => topology.same_rack(a, b),
            Matcher::AnyOther => true,
        }
    }
}
