//! Cross-request constraints within one claim
//!
//! Constraints are stateful and incremental: the search calls [`Constraint::add`]
//! when it tentatively binds a device and [`Constraint::remove`] when it backs
//! that binding out again. They must be monotonic: once `add` rejects a device
//! for some set of bound devices, adding more devices to that set never makes
//! it acceptable.

use std::collections::HashSet;

use tracing::trace;

use crate::model::{BasicDevice, DeviceAttribute, DeviceConstraint, DeviceId};

/// Incremental constraint protocol used by the search
pub trait Constraint: Send {
    /// Try to add a device bound to `request`. Returns false and leaves the
    /// state untouched when the device would violate the constraint.
    fn add(&mut self, request: &str, device: &BasicDevice, id: &DeviceId) -> bool;

    /// Undo a previous successful `add` with the same arguments
    fn remove(&mut self, request: &str, device: &BasicDevice, id: &DeviceId);
}

/// Build the runtime constraint for a claim constraint, or `None` when
/// the constraint kind is unknown.
pub fn from_spec(spec: &DeviceConstraint) -> Option<Box<dyn Constraint>> {
    let attribute = spec.match_attribute.as_deref()?;
    Some(Box::new(MatchAttributeConstraint::new(
        attribute,
        spec.requests.iter().cloned(),
    )))
}

/// All devices of the constrained requests carry the same attribute value
#[derive(Debug, Clone)]
pub struct MatchAttributeConstraint {
    /// Empty means the constraint applies to every request of the claim
    requests: HashSet<String>,
    attribute: String,
    /// Value fixed by the first device in the set
    reference: Option<DeviceAttribute>,
    num_devices: usize,
}

impl MatchAttributeConstraint {
    pub fn new(attribute: impl Into<String>, requests: impl IntoIterator<Item = String>) -> Self {
        Self {
            requests: requests.into_iter().collect(),
            attribute: attribute.into(),
            reference: None,
            num_devices: 0,
        }
    }

    fn applies_to(&self, request: &str) -> bool {
        self.requests.is_empty() || self.requests.contains(request)
    }

    /// Number of devices currently in the constrained set
    pub fn len(&self) -> usize {
        self.num_devices
    }

    pub fn is_empty(&self) -> bool {
        self.num_devices == 0
    }
}

impl Constraint for MatchAttributeConstraint {
    fn add(&mut self, request: &str, device: &BasicDevice, id: &DeviceId) -> bool {
        if !self.applies_to(request) {
            trace!(request, attribute = %self.attribute, "Constraint does not apply to request");
            return true;
        }

        let Some(value) = device.lookup_attribute(&id.driver, &self.attribute) else {
            trace!(device = %id, attribute = %self.attribute, "Constraint not satisfied, attribute not set");
            return false;
        };

        if self.num_devices == 0 {
            self.reference = Some(value.clone());
            self.num_devices = 1;
            trace!(device = %id, attribute = %self.attribute, value = %value, "First in set");
            return true;
        }

        // Kinds must match too: a string "1" never equals an int 1
        if self.reference.as_ref() != Some(value) {
            trace!(
                device = %id,
                attribute = %self.attribute,
                value = %value,
                "Constraint not satisfied, values differ"
            );
            return false;
        }

        self.num_devices += 1;
        trace!(device = %id, num_devices = self.num_devices, "Constraint satisfied by device");
        true
    }

    fn remove(&mut self, request: &str, _device: &BasicDevice, id: &DeviceId) {
        if !self.applies_to(request) {
            return;
        }
        self.num_devices = self.num_devices.saturating_sub(1);
        if self.num_devices == 0 {
            self.reference = None;
        }
        trace!(device = %id, num_devices = self.num_devices, "Device removed from constraint set");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Device;

    const DRIVER: &str = "gpu.example.com";

    fn device(name: &str, color: Option<DeviceAttribute>) -> (BasicDevice, DeviceId) {
        let mut d = Device::basic(name);
        if let Some(color) = color {
            d = d.with_attribute("color", color);
        }
        (d.basic.unwrap(), DeviceId::new(DRIVER, "pool", name))
    }

    fn colored(name: &str, color: &str) -> (BasicDevice, DeviceId) {
        device(name, Some(DeviceAttribute::string(color)))
    }

    #[test]
    fn test_first_device_sets_reference() {
        let mut c = MatchAttributeConstraint::new("color", Vec::new());
        let (red1, id1) = colored("a", "red");
        let (red2, id2) = colored("b", "red");
        let (blue, id3) = colored("c", "blue");

        assert!(c.add("r", &red1, &id1));
        assert!(c.add("r", &red2, &id2));
        assert!(!c.add("r", &blue, &id3));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn test_missing_attribute_never_satisfies() {
        let mut c = MatchAttributeConstraint::new("color", Vec::new());
        let (bare, id) = device("a", None);
        assert!(!c.add("r", &bare, &id));
        assert!(c.is_empty());
    }

    #[test]
    fn test_fully_qualified_name() {
        let mut c = MatchAttributeConstraint::new("gpu.example.com/color", Vec::new());
        let (red, id) = colored("a", "red");
        assert!(c.add("r", &red, &id));

        let mut other = MatchAttributeConstraint::new("nic.example.com/color", Vec::new());
        assert!(!other.add("r", &red, &id));
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let mut c = MatchAttributeConstraint::new("color", Vec::new());
        let (s, id1) = device("a", Some(DeviceAttribute::string("1")));
        let (i, id2) = device("b", Some(DeviceAttribute::Int(1)));
        assert!(c.add("r", &s, &id1));
        assert!(!c.add("r", &i, &id2));
    }

    #[test]
    fn test_requests_outside_scope_are_exempt() {
        let mut c = MatchAttributeConstraint::new("color", vec!["a".to_string()]);
        let (red, id1) = colored("x", "red");
        let (bare, id2) = device("y", None);
        assert!(c.add("a", &red, &id1));
        assert!(c.add("b", &bare, &id2));
        c.remove("b", &bare, &id2);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn test_remove_resets_reference() {
        let mut c = MatchAttributeConstraint::new("color", Vec::new());
        let (red, id1) = colored("a", "red");
        let (blue, id2) = colored("b", "blue");

        assert!(c.add("r", &red, &id1));
        c.remove("r", &red, &id1);
        assert!(c.is_empty());
        assert!(c.add("r", &blue, &id2));
    }

    #[test]
    fn test_from_spec() {
        assert!(from_spec(&DeviceConstraint::match_attribute("color", ["a"])).is_some());
        assert!(from_spec(&DeviceConstraint::default()).is_none());
    }
}
