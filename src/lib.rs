//! # devalloc
//!
//! Structured device allocation: bind resource claims to the devices that
//! drivers advertise in resource slices, one candidate node at a time.
//!
//! - [`model`]: serde records for slices, claims, classes and results
//! - [`pools`]: slices visible from a node, grouped into pools
//! - [`selector`]: device selector compilation and evaluation
//! - [`classes`]: device class lookup
//! - [`constraint`]: cross-request constraints within a claim
//! - [`allocator`]: the backtracking search
//! - [`config`]: offline scenario files
//! - [`cli`]: command line front end

pub mod allocator;
pub mod classes;
pub mod cli;
pub mod config;
pub mod constraint;
pub mod model;
pub mod pools;
pub mod selector;

pub use allocator::{AllocationError, Allocator, AllocatorConfig};
pub use classes::{ClassLookupError, ClassRegistry, DeviceClassLister};
pub use selector::{ExpressionEngine, SelectorCache, SelectorEngine};
