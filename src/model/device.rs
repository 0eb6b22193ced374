//! Device identity and the attribute/capacity records advertised by drivers

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Globally unique key for one device: `driver/pool/device`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId {
    pub driver: String,
    pub pool: String,
    pub device: String,
}

impl DeviceId {
    pub fn new(
        driver: impl Into<String>,
        pool: impl Into<String>,
        device: impl Into<String>,
    ) -> Self {
        Self {
            driver: driver.into(),
            pool: pool.into(),
            device: device.into(),
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.driver, self.pool, self.device)
    }
}

/// Errors when parsing a `driver/pool/device` string
#[derive(Error, Debug, PartialEq)]
pub enum DeviceIdError {
    #[error("Device ID '{0}' must have the form driver/pool/device")]
    Malformed(String),
}

impl FromStr for DeviceId {
    type Err = DeviceIdError;

    /// Pool names may contain slashes, so the driver is everything before
    /// the first slash and the device everything after the last one.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (driver, rest) = s
            .split_once('/')
            .ok_or_else(|| DeviceIdError::Malformed(s.to_string()))?;
        let (pool, device) = rest
            .rsplit_once('/')
            .ok_or_else(|| DeviceIdError::Malformed(s.to_string()))?;
        if driver.is_empty() || pool.is_empty() || device.is_empty() {
            return Err(DeviceIdError::Malformed(s.to_string()));
        }
        Ok(DeviceId::new(driver, pool, device))
    }
}

/// One device entry inside a slice
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Name, unique within its pool
    pub name: String,

    /// The only device kind known today. `None` means the slice was
    /// written by a newer producer with a kind this crate cannot read.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basic: Option<BasicDevice>,
}

impl Device {
    /// Create a basic device without attributes or capacity
    pub fn basic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            basic: Some(BasicDevice::default()),
        }
    }

    /// Add an attribute (builder style). No-op for unknown device kinds.
    pub fn with_attribute(mut self, name: impl Into<String>, value: DeviceAttribute) -> Self {
        if let Some(basic) = self.basic.as_mut() {
            basic.attributes.insert(name.into(), value);
        }
        self
    }

    /// Add a capacity entry (builder style). No-op for unknown device kinds.
    pub fn with_capacity(mut self, name: impl Into<String>, value: Quantity) -> Self {
        if let Some(basic) = self.basic.as_mut() {
            basic.capacity.insert(name.into(), value);
        }
        self
    }
}

/// Attributes and capacities of a basic device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicDevice {
    #[serde(default)]
    pub attributes: HashMap<String, DeviceAttribute>,

    #[serde(default)]
    pub capacity: HashMap<String, Quantity>,
}

impl BasicDevice {
    /// Look up an attribute by its fully qualified name.
    ///
    /// Drivers may publish attributes without their own domain prefix, so
    /// `driver/name` also finds `name` when `driver` is the device's driver.
    pub fn lookup_attribute(&self, driver: &str, name: &str) -> Option<&DeviceAttribute> {
        if let Some(attribute) = self.attributes.get(name) {
            return Some(attribute);
        }
        let (domain, id) = name.split_once('/')?;
        if domain != driver {
            return None;
        }
        self.attributes.get(id)
    }

    /// Same lookup rules as [`BasicDevice::lookup_attribute`], for capacity
    pub fn lookup_capacity(&self, driver: &str, name: &str) -> Option<&Quantity> {
        if let Some(quantity) = self.capacity.get(name) {
            return Some(quantity);
        }
        let (domain, id) = name.split_once('/')?;
        if domain != driver {
            return None;
        }
        self.capacity.get(id)
    }
}

/// A typed attribute value
///
/// Serialized the Kubernetes way, e.g. `{"string": "red"}` or `{"int": 4}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceAttribute {
    String(String),
    Int(i64),
    Bool(bool),
    /// Semantic version in its normalized form, so equality is string equality
    Version(String),
}

impl DeviceAttribute {
    pub fn string(value: impl Into<String>) -> Self {
        DeviceAttribute::String(value.into())
    }

    pub fn version(value: impl Into<String>) -> Self {
        DeviceAttribute::Version(value.into())
    }

    /// Name of the value kind, for diagnostics
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceAttribute::String(_) => "string",
            DeviceAttribute::Int(_) => "int",
            DeviceAttribute::Bool(_) => "bool",
            DeviceAttribute::Version(_) => "version",
        }
    }
}

impl fmt::Display for DeviceAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceAttribute::String(s) => write!(f, "{:?}", s),
            DeviceAttribute::Int(i) => write!(f, "{}", i),
            DeviceAttribute::Bool(b) => write!(f, "{}", b),
            DeviceAttribute::Version(v) => write!(f, "semver({:?})", v),
        }
    }
}

/// Errors when parsing a quantity string
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QuantityError {
    #[error("Invalid quantity '{0}'")]
    Invalid(String),

    #[error("Quantity '{0}' is out of range")]
    OutOfRange(String),
}

/// A Kubernetes-style resource quantity such as `16Gi`, `500m` or `2`
///
/// Stored as the original text plus its value in milli-units, which is
/// what comparisons use.
#[derive(Debug, Clone)]
pub struct Quantity {
    text: String,
    millis: i128,
}

impl Quantity {
    pub fn parse(text: &str) -> Result<Self, QuantityError> {
        let trimmed = text.trim();
        let split = trimmed
            .find(|c: char| c.is_ascii_alphabetic())
            .unwrap_or(trimmed.len());
        let (number, suffix) = trimmed.split_at(split);
        if number.is_empty() {
            return Err(QuantityError::Invalid(text.to_string()));
        }

        let (whole, fraction) = match number.split_once('.') {
            Some((w, f)) => (w, f),
            None => (number, ""),
        };
        let negative = whole.starts_with('-');
        let whole = whole.trim_start_matches(['+', '-']);
        if (whole.is_empty() && fraction.is_empty())
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
            || fraction.len() > 3
        {
            return Err(QuantityError::Invalid(text.to_string()));
        }

        let out_of_range = || QuantityError::OutOfRange(text.to_string());
        let whole_value: i128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| out_of_range())?
        };
        let fraction_millis: i128 = if fraction.is_empty() {
            0
        } else {
            let padded = format!("{:0<3}", fraction);
            padded.parse().map_err(|_| out_of_range())?
        };
        let base_millis = whole_value
            .checked_mul(1000)
            .and_then(|v| v.checked_add(fraction_millis))
            .ok_or_else(out_of_range)?;

        let millis = match suffix {
            "m" => {
                if !fraction.is_empty() {
                    return Err(QuantityError::Invalid(text.to_string()));
                }
                Some(whole_value)
            }
            "" => Some(base_millis),
            _ => {
                let multiplier = suffix_multiplier(suffix)
                    .ok_or_else(|| QuantityError::Invalid(text.to_string()))?;
                base_millis.checked_mul(multiplier)
            }
        }
        .ok_or_else(out_of_range)?;

        Ok(Self {
            text: trimmed.to_string(),
            millis: if negative { -millis } else { millis },
        })
    }

    /// Value in milli-units (`1` == `1000m`)
    pub fn millis(&self) -> i128 {
        self.millis
    }

    /// The original text
    pub fn as_str(&self) -> &str {
        &self.text
    }
}

fn suffix_multiplier(suffix: &str) -> Option<i128> {
    let m = match suffix {
        "k" => 1000_i128,
        "M" => 1000_i128.pow(2),
        "G" => 1000_i128.pow(3),
        "T" => 1000_i128.pow(4),
        "P" => 1000_i128.pow(5),
        "E" => 1000_i128.pow(6),
        "Ki" => 1 << 10,
        "Mi" => 1 << 20,
        "Gi" => 1 << 30,
        "Ti" => 1 << 40,
        "Pi" => 1 << 50,
        "Ei" => 1 << 60,
        _ => return None,
    };
    Some(m)
}

impl FromStr for Quantity {
    type Err = QuantityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl PartialEq for Quantity {
    fn eq(&self, other: &Self) -> bool {
        self.millis == other.millis
    }
}

impl Eq for Quantity {}

impl PartialOrd for Quantity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Quantity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.millis.cmp(&other.millis)
    }
}

impl Serialize for Quantity {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.text)
    }
}

impl<'de> Deserialize<'de> for Quantity {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        // Plain integers are accepted too, e.g. `"cores": 8`
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Int(i64),
        }
        let text = match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s,
            Raw::Int(i) => i.to_string(),
        };
        Quantity::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_id_display_and_parse() {
        let id = DeviceId::new("gpu.example.com", "node-1", "gpu-0");
        assert_eq!(id.to_string(), "gpu.example.com/node-1/gpu-0");

        let parsed: DeviceId = "gpu.example.com/rack/a/gpu-0".parse().unwrap();
        assert_eq!(parsed.driver, "gpu.example.com");
        assert_eq!(parsed.pool, "rack/a");
        assert_eq!(parsed.device, "gpu-0");
    }

    #[test]
    fn test_device_id_malformed() {
        assert!("driver-only".parse::<DeviceId>().is_err());
        assert!("driver/device".parse::<DeviceId>().is_err());
        assert!("driver//device".parse::<DeviceId>().is_err());
    }

    #[test]
    fn test_attribute_serde_shape() {
        let attr: DeviceAttribute = serde_json::from_str(r#"{"string": "red"}"#).unwrap();
        assert_eq!(attr, DeviceAttribute::string("red"));

        let attr: DeviceAttribute = serde_json::from_str(r#"{"version": "1.2.3"}"#).unwrap();
        assert_eq!(attr, DeviceAttribute::version("1.2.3"));
        assert_eq!(attr.kind(), "version");
    }

    #[test]
    fn test_lookup_attribute_strips_driver_domain() {
        let device = Device::basic("gpu-0").with_attribute("model", DeviceAttribute::string("a100"));
        let basic = device.basic.as_ref().unwrap();

        assert!(basic.lookup_attribute("gpu.example.com", "model").is_some());
        assert!(basic
            .lookup_attribute("gpu.example.com", "gpu.example.com/model")
            .is_some());
        assert!(basic
            .lookup_attribute("gpu.example.com", "other.example.com/model")
            .is_none());
    }

    #[test]
    fn test_quantity_parsing() {
        assert_eq!(Quantity::parse("2").unwrap().millis(), 2000);
        assert_eq!(Quantity::parse("500m").unwrap().millis(), 500);
        assert_eq!(Quantity::parse("1.5").unwrap().millis(), 1500);
        assert_eq!(Quantity::parse("1Ki").unwrap().millis(), 1024 * 1000);
        assert_eq!(Quantity::parse("1k").unwrap().millis(), 1000 * 1000);
        assert_eq!(Quantity::parse("-3").unwrap().millis(), -3000);
        assert!(Quantity::parse("Gi").is_err());
        assert!(Quantity::parse("12Xi").is_err());
        assert!(Quantity::parse("1.5m").is_err());
    }

    #[test]
    fn test_quantity_ordering() {
        let a = Quantity::parse("16Gi").unwrap();
        let b = Quantity::parse("17179869184").unwrap();
        let c = Quantity::parse("8Gi").unwrap();
        assert_eq!(a, b);
        assert!(c < a);
        assert_eq!(a.to_string(), "16Gi");
    }

    #[test]
    fn test_quantity_deserialize_from_int() {
        let q: Quantity = serde_json::from_str("8").unwrap();
        assert_eq!(q.millis(), 8000);
        let q: Quantity = serde_json::from_str(r#""40Gi""#).unwrap();
        assert_eq!(q.as_str(), "40Gi");
    }
}
