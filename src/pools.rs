//! Pool gathering
//!
//! Projects the raw slices onto one node: keeps the slices whose devices are
//! reachable from that node, groups them by `(driver, pool)` and flags pools
//! which are still being published or which contradict themselves.

use std::collections::HashSet;

use indexmap::IndexMap;
use thiserror::Error;

use crate::model::{Node, NodeScope, NodeSelectorError, ResourceSlice};

/// Errors while gathering pools for a node
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Node selector in resource slice '{slice}': {source}")]
    NodeSelector {
        slice: String,
        #[source]
        source: NodeSelectorError,
    },

    #[error("Resource slice '{0}' sets more than one of nodeName, nodeSelector and allNodes")]
    ConflictingNodeScope(String),
}

/// Identifies a pool across all drivers
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PoolId {
    pub driver: String,
    pub pool: String,
}

impl std::fmt::Display for PoolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.driver, self.pool)
    }
}

/// All current slices of one pool that are visible from a node
#[derive(Debug, Clone)]
pub struct Pool<'a> {
    pub id: PoolId,

    /// Slices of the newest generation, in input order
    pub slices: Vec<&'a ResourceSlice>,

    /// Not all slices of the newest generation have been observed yet
    pub is_incomplete: bool,

    /// The pool contradicts itself and must not be allocated from
    pub is_invalid: bool,

    pub invalid_reason: Option<String>,
}

impl<'a> Pool<'a> {
    fn new(slice: &'a ResourceSlice) -> Self {
        Self {
            id: PoolId {
                driver: slice.driver.clone(),
                pool: slice.pool.name.clone(),
            },
            slices: vec![slice],
            is_incomplete: false,
            is_invalid: false,
            invalid_reason: None,
        }
    }

    fn generation(&self) -> i64 {
        self.slices.first().map(|s| s.pool.generation).unwrap_or_default()
    }

    fn add(&mut self, slice: &'a ResourceSlice) {
        let current = self.generation();
        if slice.pool.generation < current {
            // Outdated
            return;
        }
        if slice.pool.generation > current {
            self.slices.clear();
        }
        self.slices.push(slice);
    }

    fn finish(&mut self) {
        let expected = self
            .slices
            .first()
            .map(|s| s.pool.resource_slice_count)
            .unwrap_or_default();
        self.is_incomplete = self.slices.len() as i64 != expected;

        let mut names = HashSet::new();
        for slice in &self.slices {
            for device in &slice.devices {
                if !names.insert(device.name.as_str()) {
                    self.is_invalid = true;
                    self.invalid_reason = Some(format!("duplicate device name {}", device.name));
                    return;
                }
            }
        }
    }

    /// Total number of devices across all slices
    pub fn device_count(&self) -> usize {
        self.slices.iter().map(|s| s.devices.len()).sum()
    }
}

/// Gather the pools visible from `node`, in the order their first slice
/// appears in `slices`.
///
/// Slices whose node scope is unknown are skipped because they come from a
/// newer producer; other pools may still be usable.
pub fn gather_pools<'a>(
    slices: &'a [ResourceSlice],
    node: &Node,
) -> Result<Vec<Pool<'a>>, PoolError> {
    let mut pools: IndexMap<PoolId, Pool<'a>> = IndexMap::new();

    for slice in slices {
        let visible = match slice.node_scope() {
            NodeScope::Node(name) => name == node.name(),
            NodeScope::AllNodes => true,
            NodeScope::Selector(selector) => {
                selector
                    .matches(node)
                    .map_err(|source| PoolError::NodeSelector {
                        slice: slice.name.clone(),
                        source,
                    })?
            }
            NodeScope::Unknown => false,
            NodeScope::Conflicting => {
                return Err(PoolError::ConflictingNodeScope(slice.name.clone()));
            }
        };
        if !visible {
            continue;
        }

        let id = PoolId {
            driver: slice.driver.clone(),
            pool: slice.pool.name.clone(),
        };
        match pools.get_mut(&id) {
            Some(pool) => pool.add(slice),
            None => {
                pools.insert(id, Pool::new(slice));
            }
        }
    }

    Ok(pools
        .into_values()
        .map(|mut pool| {
            pool.finish();
            pool
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Device, NodeSelector, NodeSelectorOperator, NodeSelectorRequirement, NodeSelectorTerm};

    const DRIVER: &str = "gpu.example.com";

    fn devices(names: &[&str]) -> Vec<Device> {
        names.iter().map(|n| Device::basic(*n)).collect()
    }

    #[test]
    fn test_node_local_slices() {
        let slices = vec![
            ResourceSlice::new(DRIVER, "worker-1", devices(&["gpu-0"])).on_node("worker-1"),
            ResourceSlice::new(DRIVER, "worker-2", devices(&["gpu-0"])).on_node("worker-2"),
        ];
        let pools = gather_pools(&slices, &Node::new("worker-1")).unwrap();
        assert_eq!(pools.len(), 1);
        assert_eq!(pools[0].id.pool, "worker-1");
        assert!(!pools[0].is_incomplete);
        assert!(!pools[0].is_invalid);
    }

    #[test]
    fn test_node_selector_slices() {
        let selector = NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: vec![NodeSelectorRequirement::new(
                    "rack",
                    NodeSelectorOperator::In,
                    ["r1"],
                )],
                match_fields: Vec::new(),
            }],
        };
        let slices = vec![ResourceSlice::new(DRIVER, "rack-1", devices(&["nic-0"]))
            .with_node_selector(selector)];

        let in_rack = Node::new("worker-1").with_label("rack", "r1");
        let elsewhere = Node::new("worker-2").with_label("rack", "r2");
        assert_eq!(gather_pools(&slices, &in_rack).unwrap().len(), 1);
        assert!(gather_pools(&slices, &elsewhere).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_scope_is_skipped() {
        let mut slice = ResourceSlice::new(DRIVER, "pool", devices(&["gpu-0"]));
        slice.all_nodes = false;
        let slices = vec![slice];
        assert!(gather_pools(&slices, &Node::new("worker-1")).unwrap().is_empty());
    }

    #[test]
    fn test_conflicting_scope_is_an_error() {
        let mut slice = ResourceSlice::new(DRIVER, "pool", devices(&["gpu-0"])).with_name("bad");
        slice.node_name = Some("worker-1".into());
        let slices = vec![slice];
        assert_eq!(
            gather_pools(&slices, &Node::new("worker-1")).unwrap_err(),
            PoolError::ConflictingNodeScope("bad".into())
        );
    }

    #[test]
    fn test_incomplete_pool() {
        let slices = vec![
            ResourceSlice::new(DRIVER, "pool", devices(&["gpu-0"])).with_generation(1, 2),
        ];
        let pools = gather_pools(&slices, &Node::new("worker-1")).unwrap();
        assert!(pools[0].is_incomplete);
    }

    #[test]
    fn test_newer_generation_replaces_older() {
        let slices = vec![
            ResourceSlice::new(DRIVER, "pool", devices(&["old-0"])).with_generation(1, 1),
            ResourceSlice::new(DRIVER, "pool", devices(&["new-0"])).with_generation(2, 2),
            ResourceSlice::new(DRIVER, "pool", devices(&["stale-0"])).with_generation(1, 1),
            ResourceSlice::new(DRIVER, "pool", devices(&["new-1"])).with_generation(2, 2),
        ];
        let pools = gather_pools(&slices, &Node::new("worker-1")).unwrap();
        assert_eq!(pools.len(), 1);
        let names: Vec<_> = pools[0]
            .slices
            .iter()
            .flat_map(|s| s.devices.iter().map(|d| d.name.as_str()))
            .collect();
        assert_eq!(names, vec!["new-0", "new-1"]);
        assert!(!pools[0].is_incomplete);
        assert_eq!(pools[0].device_count(), 2);
    }

    #[test]
    fn test_duplicate_device_names_invalidate_pool() {
        let slices = vec![
            ResourceSlice::new(DRIVER, "pool", devices(&["gpu-0"])).with_generation(0, 2),
            ResourceSlice::new(DRIVER, "pool", devices(&["gpu-0"])).with_generation(0, 2),
        ];
        let pools = gather_pools(&slices, &Node::new("worker-1")).unwrap();
        assert!(pools[0].is_invalid);
        assert_eq!(
            pools[0].invalid_reason.as_deref(),
            Some("duplicate device name gpu-0")
        );
    }

    #[test]
    fn test_pool_order_follows_input() {
        let slices = vec![
            ResourceSlice::new("b.example.com", "pool", devices(&["x"])),
            ResourceSlice::new("a.example.com", "pool", devices(&["y"])),
        ];
        let pools = gather_pools(&slices, &Node::new("worker-1")).unwrap();
        let drivers: Vec<_> = pools.iter().map(|p| p.id.driver.as_str()).collect();
        assert_eq!(drivers, vec!["b.example.com", "a.example.com"]);
    }
}
