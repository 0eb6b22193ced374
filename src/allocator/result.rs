//! Turning a search solution into per-claim allocation results

use std::collections::HashSet;

use super::preprocess::RequestData;
use super::search::InternalDeviceResult;
use super::{AllocationError, Allocator};
use crate::model::{
    AllocationConfigSource, AllocationResult, DeviceAllocationConfiguration,
    DeviceAllocationResult, DeviceRequestAllocationResult, NodeSelector, NodeSelectorRequirement,
    NodeSelectorTerm,
};

pub(crate) fn assemble(
    allocator: &Allocator,
    requests: &[Vec<RequestData<'_>>],
    devices: &[Vec<InternalDeviceResult<'_>>],
) -> Result<Vec<AllocationResult>, AllocationError> {
    let mut results = Vec::with_capacity(allocator.claims.len());

    for (claim_index, claim) in allocator.claims.iter().enumerate() {
        let bound = &devices[claim_index];

        let device_results = bound
            .iter()
            .map(|d| DeviceRequestAllocationResult {
                request: d.request.to_string(),
                driver: d.id.driver.clone(),
                pool: d.id.pool.clone(),
                device: d.id.device.clone(),
                admin_access: d.admin_access,
            })
            .collect();

        let mut config = Vec::new();
        let mut seen_classes = HashSet::new();
        for data in &requests[claim_index] {
            if !seen_classes.insert(data.class.name()) {
                continue;
            }
            config.extend(data.class.spec.config.iter().map(|c| DeviceAllocationConfiguration {
                source: AllocationConfigSource::FromClass,
                requests: Vec::new(),
                opaque: c.opaque.clone(),
            }));
        }
        config.extend(
            claim
                .spec
                .devices
                .config
                .iter()
                .map(|c| DeviceAllocationConfiguration {
                    source: AllocationConfigSource::FromClaim,
                    requests: c.requests.clone(),
                    opaque: c.opaque.clone(),
                }),
        );

        let node_selector = node_selector_for(&claim.key(), bound)?;

        results.push(AllocationResult {
            devices: DeviceAllocationResult {
                results: device_results,
                config,
            },
            node_selector,
        });
    }

    Ok(results)
}

/// Derive where the bound devices are reachable from.
///
/// A device pinned to a node pins the whole claim to that node. Otherwise
/// the requirements of all slice selectors are merged into a single term.
fn node_selector_for(
    claim: &str,
    devices: &[InternalDeviceResult<'_>],
) -> Result<Option<NodeSelector>, AllocationError> {
    let mut term = NodeSelectorTerm::default();

    for device in devices {
        let slice = device.slice;
        if let Some(node_name) = slice.node_name.as_deref().filter(|n| !n.is_empty()) {
            return Ok(Some(NodeSelector::for_node_name(node_name)));
        }
        let Some(selector) = &slice.node_selector else {
            continue;
        };
        let [single] = selector.node_selector_terms.as_slice() else {
            return Err(AllocationError::NodeSelectorTerms {
                claim: claim.to_string(),
                terms: selector.node_selector_terms.len(),
            });
        };
        merge_requirements(&mut term.match_fields, &single.match_fields);
        merge_requirements(&mut term.match_expressions, &single.match_expressions);
    }

    if term.is_empty() {
        return Ok(None);
    }
    Ok(Some(NodeSelector {
        node_selector_terms: vec![term],
    }))
}

fn merge_requirements(into: &mut Vec<NodeSelectorRequirement>, from: &[NodeSelectorRequirement]) {
    for requirement in from {
        if !into.iter().any(|r| r.is_equivalent(requirement)) {
            into.push(requirement.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceId, NodeSelectorOperator, ResourceSlice};

    fn zone(values: &[&str]) -> NodeSelectorRequirement {
        NodeSelectorRequirement::new("zone", NodeSelectorOperator::In, values.iter().copied())
    }

    fn selector(requirements: Vec<NodeSelectorRequirement>) -> NodeSelector {
        NodeSelector {
            node_selector_terms: vec![NodeSelectorTerm {
                match_expressions: requirements,
                match_fields: Vec::new(),
            }],
        }
    }

    fn bound<'a>(slice: &'a ResourceSlice, device: &str) -> InternalDeviceResult<'a> {
        InternalDeviceResult {
            request: "r",
            id: DeviceId::new(&slice.driver, &slice.pool.name, device),
            slice,
            admin_access: None,
        }
    }

    #[test]
    fn test_no_restriction_yields_none() {
        let slice = ResourceSlice::new("gpu.example.com", "pool", Vec::new());
        assert_eq!(node_selector_for("c", &[bound(&slice, "a")]).unwrap(), None);
        assert_eq!(node_selector_for("c", &[]).unwrap(), None);
    }

    #[test]
    fn test_node_name_overrides_selectors() {
        let shared = ResourceSlice::new("nic.example.com", "fabric", Vec::new())
            .with_node_selector(selector(vec![zone(&["a"])]));
        let local = ResourceSlice::new("gpu.example.com", "worker-1", Vec::new()).on_node("worker-1");

        let result = node_selector_for("c", &[bound(&shared, "x"), bound(&local, "y")]).unwrap();
        assert_eq!(result, Some(NodeSelector::for_node_name("worker-1")));
    }

    #[test]
    fn test_selector_terms_are_merged_and_deduplicated() {
        let first = ResourceSlice::new("nic.example.com", "fabric", Vec::new())
            .with_node_selector(selector(vec![zone(&["a", "b"])]));
        let second = ResourceSlice::new("fpga.example.com", "fabric", Vec::new()).with_node_selector(
            selector(vec![
                zone(&["b", "a"]),
                NodeSelectorRequirement::new("rack", NodeSelectorOperator::Exists, Vec::<String>::new()),
            ]),
        );

        let result = node_selector_for("c", &[bound(&first, "x"), bound(&second, "y")])
            .unwrap()
            .unwrap();
        assert_eq!(result.node_selector_terms.len(), 1);
        let term = &result.node_selector_terms[0];
        assert_eq!(term.match_expressions.len(), 2);
        assert_eq!(term.match_expressions[0].values, vec!["a", "b"]);
        assert_eq!(term.match_expressions[1].key, "rack");
        assert!(term.match_fields.is_empty());
    }

    #[test]
    fn test_multiple_terms_are_rejected() {
        let mut multi = selector(vec![zone(&["a"])]);
        multi.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: vec![zone(&["b"])],
            match_fields: Vec::new(),
        });
        let slice = ResourceSlice::new("nic.example.com", "fabric", Vec::new()).with_node_selector(multi);

        assert_eq!(
            node_selector_for("ns/c", &[bound(&slice, "x")]),
            Err(AllocationError::NodeSelectorTerms {
                claim: "ns/c".into(),
                terms: 2
            })
        );
    }
}
