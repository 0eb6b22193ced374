//! Resource slices: batches of device advertisements published by drivers

use serde::{Deserialize, Serialize};

use super::device::Device;
use super::node::NodeSelector;

/// One published batch of devices for a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSlice {
    /// Object name, used in diagnostics only
    #[serde(default)]
    pub name: String,

    /// Driver which manages these devices
    pub driver: String,

    /// Pool this slice belongs to
    pub pool: ResourcePool,

    /// Devices are local to exactly this node
    #[serde(rename = "nodeName")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,

    /// Devices are reachable from nodes matching this selector
    #[serde(rename = "nodeSelector")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,

    /// Devices are reachable from every node
    #[serde(rename = "allNodes")]
    #[serde(default)]
    pub all_nodes: bool,

    #[serde(default)]
    pub devices: Vec<Device>,
}

/// Pool membership of a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcePool {
    pub name: String,

    /// Slices with an older generation than the newest one are outdated
    #[serde(default)]
    pub generation: i64,

    /// How many slices the pool consists of in this generation
    #[serde(rename = "resourceSliceCount")]
    #[serde(default = "default_slice_count")]
    pub resource_slice_count: i64,
}

fn default_slice_count() -> i64 {
    1
}

/// How a slice restricts the nodes its devices are reachable from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeScope<'a> {
    Node(&'a str),
    Selector(&'a NodeSelector),
    AllNodes,
    /// Set by a newer producer in a way this crate does not understand
    Unknown,
    /// More than one of the mutually exclusive fields is set
    Conflicting,
}

impl ResourceSlice {
    /// Create a slice for a single-slice pool that is reachable from all nodes
    pub fn new(driver: impl Into<String>, pool: impl Into<String>, devices: Vec<Device>) -> Self {
        Self {
            name: String::new(),
            driver: driver.into(),
            pool: ResourcePool {
                name: pool.into(),
                generation: 0,
                resource_slice_count: 1,
            },
            node_name: None,
            node_selector: None,
            all_nodes: true,
            devices,
        }
    }

    /// Pin the slice to one node (builder style)
    pub fn on_node(mut self, node: impl Into<String>) -> Self {
        self.node_name = Some(node.into());
        self.node_selector = None;
        self.all_nodes = false;
        self
    }

    /// Restrict the slice with a node selector (builder style)
    pub fn with_node_selector(mut self, selector: NodeSelector) -> Self {
        self.node_selector = Some(selector);
        self.node_name = None;
        self.all_nodes = false;
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set generation and slice count of the pool (builder style)
    pub fn with_generation(mut self, generation: i64, resource_slice_count: i64) -> Self {
        self.pool.generation = generation;
        self.pool.resource_slice_count = resource_slice_count;
        self
    }

    pub fn node_scope(&self) -> NodeScope<'_> {
        let node_name = self.node_name.as_deref().filter(|n| !n.is_empty());
        let set = [
            node_name.is_some(),
            self.node_selector.is_some(),
            self.all_nodes,
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set > 1 {
            return NodeScope::Conflicting;
        }
        match (node_name, &self.node_selector) {
            (Some(name), _) => NodeScope::Node(name),
            (None, Some(selector)) => NodeScope::Selector(selector),
            (None, None) if self.all_nodes => NodeScope::AllNodes,
            (None, None) => NodeScope::Unknown,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_scope() {
        let slice = ResourceSlice::new("gpu.example.com", "pool", vec![]);
        assert_eq!(slice.node_scope(), NodeScope::AllNodes);

        let slice = slice.on_node("worker-1");
        assert_eq!(slice.node_scope(), NodeScope::Node("worker-1"));

        let mut conflicting = slice.clone();
        conflicting.all_nodes = true;
        assert_eq!(conflicting.node_scope(), NodeScope::Conflicting);

        let mut unknown = slice;
        unknown.node_name = None;
        assert_eq!(unknown.node_scope(), NodeScope::Unknown);
    }

    #[test]
    fn test_selector_scope_compares_by_value() {
        let selector = NodeSelector::for_node_name("worker-1");
        let slice = ResourceSlice::new("gpu.example.com", "pool", vec![])
            .with_node_selector(selector.clone());
        assert_eq!(slice.node_scope(), NodeScope::Selector(&selector));
        assert_ne!(slice.node_scope(), NodeScope::AllNodes);
    }

    #[test]
    fn test_deserialize_defaults() {
        let json = r#"{
            "driver": "gpu.example.com",
            "pool": {"name": "worker-1"},
            "nodeName": "worker-1",
            "devices": [{"name": "gpu-0", "basic": {}}]
        }"#;
        let slice: ResourceSlice = serde_json::from_str(json).unwrap();
        assert_eq!(slice.pool.resource_slice_count, 1);
        assert_eq!(slice.pool.generation, 0);
        assert!(!slice.all_nodes);
        assert!(slice.devices[0].basic.is_some());
    }
}
