//! Allocation results handed back to the caller

use serde::{Deserialize, Serialize};

use super::claim::OpaqueDeviceConfiguration;
use super::device::DeviceId;
use super::node::NodeSelector;

/// The outcome of allocating one claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AllocationResult {
    pub devices: DeviceAllocationResult,

    /// Where the allocated devices are reachable. `None` means everywhere.
    #[serde(rename = "nodeSelector")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<NodeSelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceAllocationResult {
    /// One entry per bound device, in the order they were bound
    #[serde(default)]
    pub results: Vec<DeviceRequestAllocationResult>,

    #[serde(default)]
    pub config: Vec<DeviceAllocationConfiguration>,
}

/// One device bound to one request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequestAllocationResult {
    pub request: String,
    pub driver: String,
    pub pool: String,
    pub device: String,

    #[serde(rename = "adminAccess")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_access: Option<bool>,
}

impl DeviceRequestAllocationResult {
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(&self.driver, &self.pool, &self.device)
    }
}

/// Where a piece of configuration came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationConfigSource {
    FromClass,
    FromClaim,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceAllocationConfiguration {
    pub source: AllocationConfigSource,

    /// Requests this applies to; empty means all requests of the claim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requests: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueDeviceConfiguration>,
}

impl AllocationResult {
    /// Device IDs in result order
    pub fn device_ids(&self) -> Vec<DeviceId> {
        self.devices
            .results
            .iter()
            .map(DeviceRequestAllocationResult::device_id)
            .collect()
    }

    /// Devices bound to the named request
    pub fn devices_for_request<'a>(
        &'a self,
        request: &'a str,
    ) -> impl Iterator<Item = &'a DeviceRequestAllocationResult> + 'a {
        self.devices
            .results
            .iter()
            .filter(move |r| r.request == request)
    }
}
