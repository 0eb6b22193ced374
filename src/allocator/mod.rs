//! # Structured device allocator
//!
//! Decides, for one candidate node, how to bind a set of unallocated claims to
//! the devices advertised in resource slices.
//!
//! An [`Allocator`] is built once per scheduling cycle from immutable inputs
//! and then asked about one node at a time via [`Allocator::allocate`]. Each
//! call owns its working state, so one allocator can serve many threads.
//!
//! ```text
//!   slices ──► gather pools for node ──► preprocess requests ──► search ──► results
//!                 (pools.rs)              (preprocess.rs)      (search.rs) (result.rs)
//! ```
//!
//! Outcomes:
//! - `Ok(Some(results))`: one result per claim, in claim order
//! - `Ok(None)`: the claims do not fit on this node; try another one
//! - `Err(_)`: the input itself is broken; no node will do until it is fixed

mod matching;
mod preprocess;
mod result;
mod search;

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::classes::{ClassLookupError, DeviceClassLister};
use crate::model::{AllocationResult, DeviceId, Node, ResourceClaim, ResourceSlice};
use crate::pools::{gather_pools, Pool, PoolError};
use crate::selector::{SelectorEngine, SelectorError};

/// Upstream limit on the number of device results per claim
pub const ALLOCATION_RESULTS_MAX_SIZE: usize = 32;

/// Errors that make an allocation impossible on any node
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AllocationError {
    #[error("Claim {claim}, request {request}, selector #{index}: expression empty (unsupported selector type?)")]
    UnsupportedSelector {
        claim: String,
        request: String,
        index: usize,
    },

    #[error("Claim {claim}, request {request}: device class {class}, selector #{index}: expression empty (unsupported selector type?)")]
    UnsupportedClassSelector {
        claim: String,
        request: String,
        class: String,
        index: usize,
    },

    #[error("Claim {claim}, request {request}: admin access is requested, but the feature is disabled")]
    AdminAccessDisabled { claim: String, request: String },

    #[error("Claim {claim}, request {request}: missing device class name (unsupported request type?)")]
    MissingDeviceClassName { claim: String, request: String },

    #[error("Claim {claim}, request {request}: could not retrieve device class {class}: {source}")]
    DeviceClass {
        claim: String,
        request: String,
        class: String,
        #[source]
        source: ClassLookupError,
    },

    #[error("Claim {claim}, request {request}: unsupported allocation mode")]
    UnsupportedAllocationMode { claim: String, request: String },

    #[error("Claim {claim}, request {request}: exact count {count} is too large")]
    CountTooLarge {
        claim: String,
        request: String,
        count: u64,
    },

    #[error("Claim {claim}, request {request}: asks for all devices, but resource pool {pool} is currently being updated")]
    PoolIncomplete {
        claim: String,
        request: String,
        pool: String,
    },

    #[error("Claim {claim}, request {request}: asks for all devices, but resource pool {pool} is currently invalid: {reason}")]
    PoolInvalidForAll {
        claim: String,
        request: String,
        pool: String,
        reason: String,
    },

    #[error("Pool {pool} is invalid: {reason}")]
    InvalidPool { pool: String, reason: String },

    #[error("Claim {claim}: number of requested devices {requested} exceeds the claim limit of {limit}")]
    TooManyDevices {
        claim: String,
        requested: usize,
        limit: usize,
    },

    #[error("Claim {claim}, constraint #{index}: empty constraint (unsupported constraint type?)")]
    UnsupportedConstraint { claim: String, index: usize },

    #[error("Claim {claim}, request {request}: cannot add device {device} because a claim constraint would not be satisfied")]
    ConstraintViolated {
        claim: String,
        request: String,
        device: DeviceId,
    },

    #[error("{owner}: selector #{index}: {source}")]
    Selector {
        owner: SelectorOwner,
        index: usize,
        #[source]
        source: SelectorError,
    },

    #[error("Create node selector for claim {claim}: unsupported resource slice node selector with {terms} terms")]
    NodeSelectorTerms { claim: String, terms: usize },

    #[error(transparent)]
    Pools(#[from] PoolError),

    #[error("Allocation was cancelled")]
    Cancelled,
}

/// Who a failing selector belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorOwner {
    Class(String),
    Claim(String),
}

impl fmt::Display for SelectorOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorOwner::Class(name) => write!(f, "class {}", name),
            SelectorOwner::Claim(key) => write!(f, "claim {}", key),
        }
    }
}

/// Allocator settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Whether requests may ask for admin access
    #[serde(rename = "adminAccessEnabled")]
    #[serde(default)]
    pub admin_access_enabled: bool,

    /// Maximum number of devices one claim may be allocated
    #[serde(rename = "maxDevicesPerClaim")]
    #[serde(default = "default_max_devices_per_claim")]
    pub max_devices_per_claim: usize,
}

fn default_max_devices_per_claim() -> usize {
    ALLOCATION_RESULTS_MAX_SIZE
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            admin_access_enabled: false,
            max_devices_per_claim: default_max_devices_per_claim(),
        }
    }
}

/// Allocates devices for a fixed set of claims, one candidate node at a time
pub struct Allocator {
    config: AllocatorConfig,
    claims: Vec<ResourceClaim>,
    allocated_devices: HashSet<DeviceId>,
    class_lister: Arc<dyn DeviceClassLister>,
    slices: Vec<ResourceSlice>,
    selectors: Arc<dyn SelectorEngine>,
}

impl Allocator {
    pub fn new(
        config: AllocatorConfig,
        claims: Vec<ResourceClaim>,
        allocated_devices: HashSet<DeviceId>,
        class_lister: Arc<dyn DeviceClassLister>,
        slices: Vec<ResourceSlice>,
        selectors: Arc<dyn SelectorEngine>,
    ) -> Self {
        Self {
            config,
            claims,
            allocated_devices,
            class_lister,
            slices,
            selectors,
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.config
    }

    /// The claims to allocate, in the order results are returned
    pub fn claims(&self) -> &[ResourceClaim] {
        &self.claims
    }

    /// Try to allocate all claims on `node`.
    ///
    /// The first complete solution wins; there is no scoring between
    /// alternatives. Identical inputs always produce the identical solution.
    pub fn allocate(
        &self,
        ctx: &CancellationToken,
        node: &Node,
    ) -> Result<Option<Vec<AllocationResult>>, AllocationError> {
        debug!(node = node.name(), num_claims = self.claims.len(), "Starting allocation");
        let outcome = self.try_allocate(ctx, node);
        match &outcome {
            Ok(results) => debug!(
                node = node.name(),
                success = results.is_some(),
                "Done with allocation"
            ),
            Err(e) => debug!(node = node.name(), error = %e, "Done with allocation"),
        }
        outcome
    }

    fn try_allocate(
        &self,
        ctx: &CancellationToken,
        node: &Node,
    ) -> Result<Option<Vec<AllocationResult>>, AllocationError> {
        if ctx.is_cancelled() {
            return Err(AllocationError::Cancelled);
        }

        let pools = gather_pools(&self.slices, node)?;
        let mut selectability = matching::Selectability::default();
        let plan = preprocess::preprocess(self, &pools, &mut selectability)?;

        debug!(
            num_allocated = self.allocated_devices.len(),
            to_be_allocated = plan.total_devices,
            num_pools = pools.len(),
            num_devices = pools.iter().map(Pool::device_count).sum::<usize>(),
            "Gathered information about devices"
        );

        let mut search = search::Search::new(self, ctx, &pools, plan, selectability);
        if !search.run()? {
            return Ok(None);
        }
        let (requests, devices) = search.into_parts();
        result::assemble(self, &requests, &devices).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classes::ClassRegistry;
    use crate::model::{DeviceClass, DeviceRequest};
    use crate::selector::SelectorCache;

    fn allocator(config: AllocatorConfig, claims: Vec<ResourceClaim>) -> Allocator {
        let classes: ClassRegistry = [DeviceClass::new("gpu")].into_iter().collect();
        Allocator::new(
            config,
            claims,
            HashSet::new(),
            Arc::new(classes),
            Vec::new(),
            Arc::new(SelectorCache::default()),
        )
    }

    #[test]
    fn test_config_defaults() {
        let config: AllocatorConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, AllocatorConfig::default());
        assert_eq!(config.max_devices_per_claim, 32);
        assert!(!config.admin_access_enabled);
    }

    #[test]
    fn test_cancelled_before_start() {
        let a = allocator(AllocatorConfig::default(), vec![]);
        let ctx = CancellationToken::new();
        ctx.cancel();
        assert_eq!(
            a.allocate(&ctx, &Node::new("worker-1")),
            Err(AllocationError::Cancelled)
        );
    }

    #[test]
    fn test_no_claims_is_trivially_satisfied() {
        let a = allocator(AllocatorConfig::default(), vec![]);
        let results = a
            .allocate(&CancellationToken::new(), &Node::new("worker-1"))
            .unwrap();
        assert_eq!(results, Some(vec![]));
    }

    #[test]
    fn test_zero_devices_available_is_soft_failure() {
        let claim = ResourceClaim::new("c").with_request(DeviceRequest::exact("r", "gpu", 1));
        let a = allocator(AllocatorConfig::default(), vec![claim]);
        assert_eq!(
            a.allocate(&CancellationToken::new(), &Node::new("worker-1")),
            Ok(None)
        );
    }

    #[test]
    fn test_error_messages_name_the_culprit() {
        let err = AllocationError::Selector {
            owner: SelectorOwner::Class("gpu".into()),
            index: 1,
            source: SelectorError::Compile("boom".into()),
        };
        assert_eq!(err.to_string(), "class gpu: selector #1: compile error: boom");
    }
}
