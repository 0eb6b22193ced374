//! # Allocation data model
//!
//! Plain serde records crossing the allocator boundary. Field names follow
//! the Kubernetes `resource.k8s.io` API so manifests can be fed in as-is.
//!
//! - **Device / DeviceId**: one advertised device and its `driver/pool/device` key
//! - **ResourceSlice**: a batch of devices published by a driver for a pool
//! - **ResourceClaim**: requests, constraints and configuration to satisfy
//! - **DeviceClass**: selectors and configuration shared by requests
//! - **AllocationResult**: per-claim bindings, configuration and node selector
//! - **Node / NodeSelector**: the candidate node and node affinity

pub mod claim;
pub mod device;
pub mod node;
pub mod result;
pub mod slice;

pub use claim::{
    AllocationMode, CelDeviceSelector, DeviceClaim, DeviceClaimConfiguration, DeviceClass,
    DeviceClassConfiguration, DeviceClassSpec, DeviceConstraint, DeviceRequest, DeviceSelector,
    ObjectMeta, OpaqueDeviceConfiguration, ResourceClaim, ResourceClaimSpec,
};
pub use device::{
    BasicDevice, Device, DeviceAttribute, DeviceId, DeviceIdError, Quantity, QuantityError,
};
pub use node::{
    Node, NodeMetadata, NodeSelector, NodeSelectorError, NodeSelectorOperator,
    NodeSelectorRequirement, NodeSelectorTerm, NODE_NAME_FIELD,
};
pub use result::{
    AllocationConfigSource, AllocationResult, DeviceAllocationConfiguration,
    DeviceAllocationResult, DeviceRequestAllocationResult,
};
pub use slice::{NodeScope, ResourcePool, ResourceSlice};
