//! Resource claims, device requests, constraints and device classes

use serde::{Deserialize, Serialize};

/// Default count for `ExactCount` requests without an explicit count
pub const DEFAULT_REQUEST_COUNT: u64 = 1;

/// Object metadata shared by claims and classes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// A claim for one or more devices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub metadata: ObjectMeta,
    pub spec: ResourceClaimSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceClaimSpec {
    #[serde(default)]
    pub devices: DeviceClaim,
}

/// Everything a claim asks of the device allocator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceClaim {
    #[serde(default)]
    pub requests: Vec<DeviceRequest>,

    #[serde(default)]
    pub constraints: Vec<DeviceConstraint>,

    #[serde(default)]
    pub config: Vec<DeviceClaimConfiguration>,
}

impl ResourceClaim {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
            },
            spec: ResourceClaimSpec::default(),
        }
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.metadata.namespace = Some(namespace.into());
        self
    }

    pub fn with_request(mut self, request: DeviceRequest) -> Self {
        self.spec.devices.requests.push(request);
        self
    }

    pub fn with_constraint(mut self, constraint: DeviceConstraint) -> Self {
        self.spec.devices.constraints.push(constraint);
        self
    }

    pub fn with_config(mut self, config: DeviceClaimConfiguration) -> Self {
        self.spec.devices.config.push(config);
        self
    }

    /// `namespace/name`, or just `name` for cluster-scoped claims
    pub fn key(&self) -> String {
        match &self.metadata.namespace {
            Some(ns) if !ns.is_empty() => format!("{}/{}", ns, self.metadata.name),
            _ => self.metadata.name.clone(),
        }
    }

    pub fn requests(&self) -> &[DeviceRequest] {
        &self.spec.devices.requests
    }

    pub fn constraints(&self) -> &[DeviceConstraint] {
        &self.spec.devices.constraints
    }
}

/// A request for devices of one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRequest {
    /// Unique within the claim
    pub name: String,

    #[serde(rename = "deviceClassName")]
    #[serde(default)]
    pub device_class_name: String,

    #[serde(rename = "allocationMode")]
    #[serde(default)]
    pub allocation_mode: AllocationMode,

    /// Only used with `ExactCount`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<u64>,

    #[serde(default)]
    pub selectors: Vec<DeviceSelector>,

    /// Bypass exclusive device access
    #[serde(rename = "adminAccess")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_access: Option<bool>,
}

/// How many devices a request asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AllocationMode {
    #[default]
    ExactCount,
    All,
    /// A mode introduced by a newer API version
    #[serde(other)]
    Unsupported,
}

impl DeviceRequest {
    /// Request exactly `count` devices of a class
    pub fn exact(name: impl Into<String>, class: impl Into<String>, count: u64) -> Self {
        Self {
            name: name.into(),
            device_class_name: class.into(),
            allocation_mode: AllocationMode::ExactCount,
            count: Some(count),
            selectors: Vec::new(),
            admin_access: None,
        }
    }

    /// Request all matching devices of a class
    pub fn all(name: impl Into<String>, class: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            device_class_name: class.into(),
            allocation_mode: AllocationMode::All,
            count: None,
            selectors: Vec::new(),
            admin_access: None,
        }
    }

    pub fn with_selector(mut self, expression: impl Into<String>) -> Self {
        self.selectors.push(DeviceSelector::cel(expression));
        self
    }

    pub fn with_admin_access(mut self) -> Self {
        self.admin_access = Some(true);
        self
    }

    pub fn is_admin_access(&self) -> bool {
        self.admin_access.unwrap_or(false)
    }

    pub fn count(&self) -> u64 {
        self.count.unwrap_or(DEFAULT_REQUEST_COUNT)
    }
}

/// A device selector. Only CEL-style expressions exist today; a selector
/// without any known kind comes from a newer producer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cel: Option<CelDeviceSelector>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CelDeviceSelector {
    pub expression: String,
}

impl DeviceSelector {
    pub fn cel(expression: impl Into<String>) -> Self {
        Self {
            cel: Some(CelDeviceSelector {
                expression: expression.into(),
            }),
        }
    }

    /// The expression text, if the selector kind is known
    pub fn expression(&self) -> Option<&str> {
        self.cel.as_ref().map(|c| c.expression.as_str())
    }
}

/// A constraint across the requests of one claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConstraint {
    /// Requests the constraint applies to; empty means all of them
    #[serde(default)]
    pub requests: Vec<String>,

    /// All devices must have the same value for this attribute
    #[serde(rename = "matchAttribute")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub match_attribute: Option<String>,
}

impl DeviceConstraint {
    pub fn match_attribute<I, S>(attribute: impl Into<String>, requests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            requests: requests.into_iter().map(Into::into).collect(),
            match_attribute: Some(attribute.into()),
        }
    }
}

/// Opaque, driver-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpaqueDeviceConfiguration {
    pub driver: String,

    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Configuration attached to a claim, optionally scoped to some requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClaimConfiguration {
    #[serde(default)]
    pub requests: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueDeviceConfiguration>,
}

/// Configuration attached to a device class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClassConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opaque: Option<OpaqueDeviceConfiguration>,
}

/// A named bundle of selectors and configuration shared by many requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceClass {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: DeviceClassSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceClassSpec {
    #[serde(default)]
    pub selectors: Vec<DeviceSelector>,

    #[serde(default)]
    pub config: Vec<DeviceClassConfiguration>,
}

impl DeviceClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.into(),
                namespace: None,
            },
            spec: DeviceClassSpec::default(),
        }
    }

    pub fn with_selector(mut self, expression: impl Into<String>) -> Self {
        self.spec.selectors.push(DeviceSelector::cel(expression));
        self
    }

    pub fn with_config(mut self, opaque: OpaqueDeviceConfiguration) -> Self {
        self.spec.config.push(DeviceClassConfiguration {
            opaque: Some(opaque),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_key() {
        assert_eq!(ResourceClaim::new("gpus").key(), "gpus");
        assert_eq!(
            ResourceClaim::new("gpus").in_namespace("team-a").key(),
            "team-a/gpus"
        );
    }

    #[test]
    fn test_parse_request_defaults() {
        let json = r#"{"name": "gpu", "deviceClassName": "gpu.example.com"}"#;
        let request: DeviceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.allocation_mode, AllocationMode::ExactCount);
        assert_eq!(request.count(), 1);
        assert!(!request.is_admin_access());
    }

    #[test]
    fn test_unknown_allocation_mode() {
        let json = r#"{"name": "gpu", "deviceClassName": "c", "allocationMode": "Fraction"}"#;
        let request: DeviceRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.allocation_mode, AllocationMode::Unsupported);
    }

    #[test]
    fn test_unknown_selector_kind() {
        let json = r#"{"jsonPath": {"path": "$.x"}}"#;
        let selector: DeviceSelector = serde_json::from_str(json).unwrap();
        assert_eq!(selector.expression(), None);
    }

    #[test]
    fn test_parse_constraint() {
        let json = r#"{"requests": ["a", "b"], "matchAttribute": "gpu.example.com/numa"}"#;
        let constraint: DeviceConstraint = serde_json::from_str(json).unwrap();
        assert_eq!(
            constraint,
            DeviceConstraint::match_attribute("gpu.example.com/numa", ["a", "b"])
        );
    }
}
