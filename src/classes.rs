//! Device class lookup
//!
//! The allocator only needs to read classes. [`ClassRegistry`] is the default
//! in-memory implementation; it can be updated while allocators hold it.

use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;

use crate::model::DeviceClass;

/// Errors from a class lookup
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClassLookupError {
    #[error("Device class '{0}' not found")]
    NotFound(String),

    #[error("Device class lookup failed: {0}")]
    Unavailable(String),
}

/// Read access to device classes
pub trait DeviceClassLister: Send + Sync {
    /// All known classes, ordered by name
    fn list(&self) -> Vec<Arc<DeviceClass>>;

    /// One class by name
    fn get(&self, name: &str) -> Result<Arc<DeviceClass>, ClassLookupError>;
}

/// Concurrent in-memory class registry
#[derive(Clone, Default)]
pub struct ClassRegistry {
    classes: Arc<DashMap<String, Arc<DeviceClass>>>,
}

impl ClassRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a class, returning the previous one
    pub fn insert(&self, class: DeviceClass) -> Option<Arc<DeviceClass>> {
        self.classes
            .insert(class.metadata.name.clone(), Arc::new(class))
    }

    pub fn remove(&self, name: &str) -> Option<Arc<DeviceClass>> {
        self.classes.remove(name).map(|(_, c)| c)
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }
}

impl FromIterator<DeviceClass> for ClassRegistry {
    fn from_iter<T: IntoIterator<Item = DeviceClass>>(iter: T) -> Self {
        let registry = ClassRegistry::new();
        for class in iter {
            registry.insert(class);
        }
        registry
    }
}

impl DeviceClassLister for ClassRegistry {
    fn list(&self) -> Vec<Arc<DeviceClass>> {
        let mut classes: Vec<_> = self.classes.iter().map(|r| r.value().clone()).collect();
        classes.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        classes
    }

    fn get(&self, name: &str) -> Result<Arc<DeviceClass>, ClassLookupError> {
        self.classes
            .get(name)
            .map(|r| r.value().clone())
            .ok_or_else(|| ClassLookupError::NotFound(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_list() {
        let registry: ClassRegistry = [
            DeviceClass::new("nic.example.com"),
            DeviceClass::new("gpu.example.com"),
        ]
        .into_iter()
        .collect();

        assert_eq!(registry.len(), 2);
        assert_eq!(
            registry.get("gpu.example.com").unwrap().name(),
            "gpu.example.com"
        );
        let names: Vec<_> = registry
            .list()
            .iter()
            .map(|c| c.name().to_string())
            .collect();
        assert_eq!(names, vec!["gpu.example.com", "nic.example.com"]);
    }

    #[test]
    fn test_not_found() {
        let registry = ClassRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(
            registry.get("missing").unwrap_err(),
            ClassLookupError::NotFound("missing".into())
        );
    }

    #[test]
    fn test_replace_and_remove() {
        let registry = ClassRegistry::new();
        assert!(registry.insert(DeviceClass::new("gpu")).is_none());
        let previous = registry.insert(DeviceClass::new("gpu").with_selector("true"));
        assert!(previous.is_some());
        assert_eq!(registry.get("gpu").unwrap().spec.selectors.len(), 1);
        assert!(registry.remove("gpu").is_some());
        assert!(registry.get("gpu").is_err());
    }
}
