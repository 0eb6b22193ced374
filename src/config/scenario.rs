use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::allocator::{Allocator, AllocatorConfig};
use crate::classes::ClassRegistry;
use crate::model::{DeviceClass, DeviceId, Node, ResourceClaim, ResourceSlice};
use crate::selector::SelectorEngine;

/// Object names follow the Kubernetes DNS subdomain rules
const DNS_SUBDOMAIN: &str = r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$";
const DNS_SUBDOMAIN_MAX_LEN: usize = 253;

/// Errors that can occur during scenario parsing and validation
#[derive(Error, Debug, PartialEq)]
pub enum ScenarioError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Duplicate device class: '{0}'")]
    DuplicateClass(String),

    #[error("Duplicate claim: '{0}'")]
    DuplicateClaim(String),

    #[error("Duplicate node: '{0}'")]
    DuplicateNode(String),

    #[error("Duplicate request '{request}' in claim '{claim}'")]
    DuplicateRequest { claim: String, request: String },

    #[error("Claim '{claim}': {context} refers to unknown request '{request}'")]
    UnknownRequest {
        claim: String,
        request: String,
        context: &'static str,
    },

    #[error("Invalid allocated device: {0}")]
    MalformedDeviceId(String),

    #[error("Invalid {kind} name '{name}': must be a lowercase DNS subdomain")]
    InvalidName { kind: &'static str, name: String },
}

/// Input syntax of a scenario file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioFormat {
    /// JSON, with C-style comments allowed
    Json,
    Yaml,
}

impl ScenarioFormat {
    /// Pick the syntax from a file extension; anything but YAML is JSON(C)
    pub fn from_extension(extension: Option<&str>) -> Self {
        match extension.map(str::to_ascii_lowercase).as_deref() {
            Some("yaml") | Some("yml") => ScenarioFormat::Yaml,
            _ => ScenarioFormat::Json,
        }
    }
}

/// Everything needed to run the allocator offline: one cycle's inputs plus
/// the candidate nodes to try
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Scenario {
    #[serde(default)]
    pub settings: AllocatorConfig,

    #[serde(default)]
    pub classes: Vec<DeviceClass>,

    /// Claims to allocate, in allocation order
    #[serde(default)]
    pub claims: Vec<ResourceClaim>,

    /// Devices already in use, as `driver/pool/device`
    #[serde(rename = "allocatedDevices")]
    #[serde(default)]
    pub allocated_devices: Vec<String>,

    #[serde(default)]
    pub slices: Vec<ResourceSlice>,

    #[serde(default)]
    pub nodes: Vec<Node>,
}

// ============================================================================
// SBIO: Pure parsing functions (no I/O)
// ============================================================================

/// Strip C-style comments from JSONC content.
/// This is a pure function - no I/O.
pub fn strip_jsonc_comments(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    let mut in_string = false;
    let mut escape_next = false;

    while let Some(c) = chars.next() {
        if escape_next {
            result.push(c);
            escape_next = false;
            continue;
        }

        match c {
            '\\' if in_string => {
                result.push(c);
                escape_next = true;
            }
            '"' => {
                in_string = !in_string;
                result.push(c);
            }
            '/' if !in_string && chars.peek() == Some(&'/') => {
                chars.next();
                // Keep the newline so error positions stay meaningful
                if chars.by_ref().any(|nc| nc == '\n') {
                    result.push('\n');
                }
            }
            '/' if !in_string && chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for nc in chars.by_ref() {
                    if prev == '*' && nc == '/' {
                        break;
                    }
                    if nc == '\n' {
                        result.push('\n');
                    }
                    prev = nc;
                }
            }
            _ => result.push(c),
        }
    }

    result
}

/// Parse scenario text without validating it.
/// This is a pure function - no I/O.
pub fn parse_scenario(content: &str, format: ScenarioFormat) -> Result<Scenario, ScenarioError> {
    match format {
        ScenarioFormat::Json => serde_json::from_str(&strip_jsonc_comments(content))
            .map_err(|e| ScenarioError::ParseError(e.to_string())),
        ScenarioFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ScenarioError::ParseError(e.to_string()))
        }
    }
}

fn is_dns_subdomain(name: &str) -> bool {
    name.len() <= DNS_SUBDOMAIN_MAX_LEN
        && Regex::new(DNS_SUBDOMAIN).is_ok_and(|pattern| pattern.is_match(name))
}

/// Validate a scenario for consistency.
/// This is a pure function - no I/O.
pub fn validate_scenario(scenario: &Scenario) -> Result<(), ScenarioError> {
    let mut classes = HashSet::new();
    for class in &scenario.classes {
        if !is_dns_subdomain(class.name()) {
            return Err(ScenarioError::InvalidName {
                kind: "device class",
                name: class.name().to_string(),
            });
        }
        if !classes.insert(class.name()) {
            return Err(ScenarioError::DuplicateClass(class.name().to_string()));
        }
    }

    let mut claims = HashSet::new();
    for claim in &scenario.claims {
        let key = claim.key();
        if !claims.insert(key.clone()) {
            return Err(ScenarioError::DuplicateClaim(key));
        }

        let mut requests = HashSet::new();
        for request in claim.requests() {
            if !requests.insert(request.name.as_str()) {
                return Err(ScenarioError::DuplicateRequest {
                    claim: key,
                    request: request.name.clone(),
                });
            }
        }

        let referenced = claim
            .constraints()
            .iter()
            .flat_map(|c| c.requests.iter().map(|r| (r, "constraint")))
            .chain(
                claim
                    .spec
                    .devices
                    .config
                    .iter()
                    .flat_map(|c| c.requests.iter().map(|r| (r, "config"))),
            );
        for (request, context) in referenced {
            if !requests.contains(request.as_str()) {
                return Err(ScenarioError::UnknownRequest {
                    claim: key,
                    request: request.clone(),
                    context,
                });
            }
        }
    }

    for slice in &scenario.slices {
        if !is_dns_subdomain(&slice.driver) {
            return Err(ScenarioError::InvalidName {
                kind: "driver",
                name: slice.driver.clone(),
            });
        }
    }

    let mut nodes = HashSet::new();
    for node in &scenario.nodes {
        if !nodes.insert(node.name()) {
            return Err(ScenarioError::DuplicateNode(node.name().to_string()));
        }
    }

    scenario.allocated_device_ids()?;

    Ok(())
}

impl Scenario {
    /// Parse and validate scenario text.
    /// Pure function - no I/O.
    pub fn from_str(content: &str, format: ScenarioFormat) -> Result<Self, ScenarioError> {
        let scenario = parse_scenario(content, format)?;
        validate_scenario(&scenario)?;
        Ok(scenario)
    }

    pub fn allocated_device_ids(&self) -> Result<HashSet<DeviceId>, ScenarioError> {
        self.allocated_devices
            .iter()
            .map(|id| {
                id.parse::<DeviceId>()
                    .map_err(|e| ScenarioError::MalformedDeviceId(e.to_string()))
            })
            .collect()
    }

    pub fn class_registry(&self) -> ClassRegistry {
        self.classes.iter().cloned().collect()
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    /// Build an allocator for this scenario's claims
    pub fn allocator(&self, selectors: Arc<dyn SelectorEngine>) -> Result<Allocator, ScenarioError> {
        Ok(Allocator::new(
            self.settings,
            self.claims.clone(),
            self.allocated_device_ids()?,
            Arc::new(self.class_registry()),
            self.slices.clone(),
            selectors,
        ))
    }
}
