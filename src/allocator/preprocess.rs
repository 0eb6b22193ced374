//! Request preprocessing
//!
//! Everything that does not depend on search order is resolved once, before
//! the search starts: device classes, slot counts, the fixed candidate lists
//! of "all" requests and the claim constraints. Any problem found here is a
//! hard error and the search never runs.

use std::sync::Arc;

use tracing::debug;

use super::matching::{RequestIndices, Selectability};
use super::{AllocationError, Allocator};
use crate::constraint::{self, Constraint};
use crate::model::{AllocationMode, BasicDevice, DeviceClass, DeviceId, ResourceSlice};
use crate::pools::Pool;

/// Upper bound for exact counts, the range of the wire format's int64
const MAX_EXACT_COUNT: u64 = i64::MAX as u64;

/// A device fixed in advance for an "all" request
#[derive(Debug, Clone)]
pub(crate) struct DeviceWithId<'a> {
    pub id: DeviceId,
    pub device: &'a BasicDevice,
    pub slice: &'a ResourceSlice,
}

/// Per-request facts the search relies on
#[derive(Debug)]
pub(crate) struct RequestData<'a> {
    pub class: Arc<DeviceClass>,
    /// Slots to fill
    pub num_devices: usize,
    /// Fixed candidates, only for "all" requests
    pub all_devices: Option<Vec<DeviceWithId<'a>>>,
}

/// Output of preprocessing, indexed by claim then request
pub(crate) struct Plan<'a> {
    pub requests: Vec<Vec<RequestData<'a>>>,
    pub constraints: Vec<Vec<Box<dyn Constraint>>>,
    pub devices_per_claim: Vec<usize>,
    pub total_devices: usize,
}

pub(crate) fn preprocess<'a>(
    allocator: &Allocator,
    pools: &[Pool<'a>],
    selectability: &mut Selectability,
) -> Result<Plan<'a>, AllocationError> {
    let mut plan = Plan {
        requests: Vec::with_capacity(allocator.claims.len()),
        constraints: Vec::with_capacity(allocator.claims.len()),
        devices_per_claim: Vec::with_capacity(allocator.claims.len()),
        total_devices: 0,
    };

    for (claim_index, claim) in allocator.claims.iter().enumerate() {
        let claim_key = claim.key();
        let mut requests = Vec::with_capacity(claim.requests().len());
        let mut devices_per_claim: usize = 0;

        for (request_index, request) in claim.requests().iter().enumerate() {
            let request_error_context = || (claim_key.clone(), request.name.clone());

            for (index, selector) in request.selectors.iter().enumerate() {
                if selector.expression().is_none() {
                    let (claim, request) = request_error_context();
                    return Err(AllocationError::UnsupportedSelector {
                        claim,
                        request,
                        index,
                    });
                }
            }

            if request.admin_access.is_some() && !allocator.config.admin_access_enabled {
                let (claim, request) = request_error_context();
                return Err(AllocationError::AdminAccessDisabled { claim, request });
            }

            if request.device_class_name.is_empty() {
                let (claim, request) = request_error_context();
                return Err(AllocationError::MissingDeviceClassName { claim, request });
            }
            let class = allocator
                .class_lister
                .get(&request.device_class_name)
                .map_err(|source| {
                    let (claim, request_name) = request_error_context();
                    AllocationError::DeviceClass {
                        claim,
                        request: request_name,
                        class: request.device_class_name.clone(),
                        source,
                    }
                })?;
            for (index, selector) in class.spec.selectors.iter().enumerate() {
                if selector.expression().is_none() {
                    let (claim, request) = request_error_context();
                    return Err(AllocationError::UnsupportedClassSelector {
                        claim,
                        request,
                        class: class.name().to_string(),
                        index,
                    });
                }
            }

            let r = RequestIndices {
                claim: claim_index,
                request: request_index,
            };
            let data = match request.allocation_mode {
                AllocationMode::ExactCount => {
                    let count = request.count();
                    let num_devices = usize::try_from(count)
                        .ok()
                        .filter(|_| count <= MAX_EXACT_COUNT)
                        .ok_or_else(|| {
                            let (claim, request) = request_error_context();
                            AllocationError::CountTooLarge {
                                claim,
                                request,
                                count,
                            }
                        })?;
                    RequestData {
                        class,
                        num_devices,
                        all_devices: None,
                    }
                }
                AllocationMode::All => {
                    let all_devices = collect_all_devices(
                        allocator,
                        pools,
                        selectability,
                        r,
                        &class,
                        &claim_key,
                        &request.name,
                    )?;
                    debug!(
                        claim = %claim_key,
                        request = %request.name,
                        num_devices = all_devices.len(),
                        "Request for 'all' devices"
                    );
                    RequestData {
                        class,
                        num_devices: all_devices.len(),
                        all_devices: Some(all_devices),
                    }
                }
                AllocationMode::Unsupported => {
                    let (claim, request) = request_error_context();
                    return Err(AllocationError::UnsupportedAllocationMode { claim, request });
                }
            };

            devices_per_claim = devices_per_claim.saturating_add(data.num_devices);
            requests.push(data);
        }

        debug!(claim = %claim_key, num_devices = devices_per_claim, "Checked claim");

        if devices_per_claim > allocator.config.max_devices_per_claim {
            return Err(AllocationError::TooManyDevices {
                claim: claim_key,
                requested: devices_per_claim,
                limit: allocator.config.max_devices_per_claim,
            });
        }

        let mut constraints = Vec::with_capacity(claim.constraints().len());
        for (index, spec) in claim.constraints().iter().enumerate() {
            let constraint =
                constraint::from_spec(spec).ok_or_else(|| AllocationError::UnsupportedConstraint {
                    claim: claim_key.clone(),
                    index,
                })?;
            constraints.push(constraint);
        }

        plan.requests.push(requests);
        plan.constraints.push(constraints);
        plan.devices_per_claim.push(devices_per_claim);
        plan.total_devices = plan.total_devices.saturating_add(devices_per_claim);
    }

    Ok(plan)
}

/// Every selectable device on the node, in pool/slice/device order
fn collect_all_devices<'a>(
    allocator: &Allocator,
    pools: &[Pool<'a>],
    selectability: &mut Selectability,
    r: RequestIndices,
    class: &DeviceClass,
    claim_key: &str,
    request_name: &str,
) -> Result<Vec<DeviceWithId<'a>>, AllocationError> {
    let mut devices = Vec::new();

    for pool in pools {
        if pool.is_incomplete {
            return Err(AllocationError::PoolIncomplete {
                claim: claim_key.to_string(),
                request: request_name.to_string(),
                pool: pool.id.to_string(),
            });
        }
        if pool.is_invalid {
            return Err(AllocationError::PoolInvalidForAll {
                claim: claim_key.to_string(),
                request: request_name.to_string(),
                pool: pool.id.to_string(),
                reason: pool.invalid_reason.clone().unwrap_or_default(),
            });
        }

        for &slice in &pool.slices {
            for device in &slice.devices {
                if !selectability.check(allocator, r, class, slice, device)? {
                    continue;
                }
                // Selectable implies a known device kind
                if let Some(basic) = device.basic.as_ref() {
                    devices.push(DeviceWithId {
                        id: DeviceId::new(&pool.id.driver, &pool.id.pool, &device.name),
                        device: basic,
                        slice,
                    });
                }
            }
        }
    }

    Ok(devices)
}
