//! Backtracking search
//!
//! Walks claims in input order, requests within a claim in input order, and
//! the slots of each request in order. Every slot gets one device; when a
//! later slot cannot be filled the search backs out the most recent binding
//! and tries the next candidate.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::matching::{RequestIndices, Selectability};
use super::preprocess::{Plan, RequestData};
use super::{AllocationError, Allocator};
use crate::constraint::Constraint;
use crate::model::{BasicDevice, DeviceId, DeviceRequest, ResourceSlice};
use crate::pools::Pool;

/// Why a branch ended without a solution
#[derive(Debug)]
pub(crate) enum SearchError {
    /// No solution exists anywhere in the remaining search space
    Stop,
    Failed(AllocationError),
}

impl From<AllocationError> for SearchError {
    fn from(e: AllocationError) -> Self {
        SearchError::Failed(e)
    }
}

/// Cursor into the search space
#[derive(Debug, Clone, Copy, Default)]
struct DeviceIndices {
    claim: usize,
    request: usize,
    device: usize,
}

impl DeviceIndices {
    fn request_indices(&self) -> RequestIndices {
        RequestIndices {
            claim: self.claim,
            request: self.request,
        }
    }

    fn next_device(self) -> Self {
        Self {
            device: self.device + 1,
            ..self
        }
    }

    fn next_request(self) -> Self {
        Self {
            claim: self.claim,
            request: self.request + 1,
            device: 0,
        }
    }

    fn next_claim(self) -> Self {
        Self {
            claim: self.claim + 1,
            request: 0,
            device: 0,
        }
    }
}

/// One device bound to one request, as recorded during the search
#[derive(Debug, Clone)]
pub(crate) struct InternalDeviceResult<'a> {
    pub request: &'a str,
    pub id: DeviceId,
    pub slice: &'a ResourceSlice,
    pub admin_access: Option<bool>,
}

/// Undo record for a successful [`Search::bind`]. Consumed by
/// [`Search::unbind`], so a binding can be rolled back at most once.
#[must_use]
#[derive(Debug)]
struct Binding<'a> {
    claim: usize,
    request: &'a DeviceRequest,
    device: &'a BasicDevice,
    id: DeviceId,
    previous_len: usize,
}

/// Working state of one `allocate` call
pub(crate) struct Search<'a> {
    allocator: &'a Allocator,
    ctx: &'a CancellationToken,
    pools: &'a [Pool<'a>],
    requests: Vec<Vec<RequestData<'a>>>,
    constraints: Vec<Vec<Box<dyn Constraint>>>,
    selectability: Selectability,
    /// Devices bound so far in this call (non-admin-access only)
    allocating: HashSet<DeviceId>,
    results: Vec<Vec<InternalDeviceResult<'a>>>,
}

impl<'a> Search<'a> {
    pub fn new(
        allocator: &'a Allocator,
        ctx: &'a CancellationToken,
        pools: &'a [Pool<'a>],
        plan: Plan<'a>,
        selectability: Selectability,
    ) -> Self {
        let results = plan
            .devices_per_claim
            .iter()
            .map(|n| Vec::with_capacity(*n))
            .collect();
        Self {
            allocator,
            ctx,
            pools,
            requests: plan.requests,
            constraints: plan.constraints,
            selectability,
            allocating: HashSet::with_capacity(plan.total_devices),
            results,
        }
    }

    /// Run the search. `Ok(false)` means there is no solution on this node.
    pub fn run(&mut self) -> Result<bool, AllocationError> {
        match self.allocate_one(DeviceIndices::default()) {
            Ok(done) => Ok(done),
            Err(SearchError::Stop) => Ok(false),
            Err(SearchError::Failed(e)) => Err(e),
        }
    }

    pub fn into_parts(self) -> (Vec<Vec<RequestData<'a>>>, Vec<Vec<InternalDeviceResult<'a>>>) {
        (self.requests, self.results)
    }

    fn allocate_one(&mut self, r: DeviceIndices) -> Result<bool, SearchError> {
        let allocator = self.allocator;
        let Some(claim) = allocator.claims.get(r.claim) else {
            // Without scoring the first complete solution is the answer
            trace!("Allocation result found");
            return Ok(true);
        };

        let Some(request) = claim.requests().get(r.request) else {
            return self.allocate_one(r.next_claim());
        };

        let request_data = &self.requests[r.claim][r.request];
        if r.device >= request_data.num_devices {
            return self.allocate_one(r.next_request());
        }

        trace!(
            claim = r.claim,
            total_claims = allocator.claims.len(),
            request = r.request,
            total_requests = claim.requests().len(),
            device = r.device,
            devices_per_request = request_data.num_devices,
            all_devices = request_data.all_devices.is_some(),
            admin_access = request.is_admin_access(),
            "Allocating one device"
        );

        if let Some(all_devices) = &request_data.all_devices {
            // The candidate is fixed. If it cannot be used, no other choice
            // anywhere can help.
            let candidate = &all_devices[r.device];
            let (device, id, slice) = (candidate.device, candidate.id.clone(), candidate.slice);
            let Some(binding) = self.bind(r, request, device, id, slice, true)? else {
                return Err(SearchError::Stop);
            };
            if self.allocate_one(r.next_device())? {
                return Ok(true);
            }
            self.unbind(binding);
            return Ok(false);
        }

        let admin_access = request.is_admin_access();
        let pools = self.pools;
        for pool in pools {
            for &slice in &pool.slices {
                for device in &slice.devices {
                    if self.ctx.is_cancelled() {
                        return Err(AllocationError::Cancelled.into());
                    }

                    let id = DeviceId::new(&pool.id.driver, &pool.id.pool, &device.name);

                    // Cheap, so it goes first
                    if !admin_access && self.in_use(&id) {
                        trace!(device = %id, "Device in use");
                        continue;
                    }

                    let class = &self.requests[r.claim][r.request].class;
                    if !self.selectability.check(
                        allocator,
                        r.request_indices(),
                        class,
                        slice,
                        device,
                    )? {
                        trace!(device = %id, "Device not selectable");
                        continue;
                    }

                    // Other pools may be fine, but this one cannot be trusted
                    if pool.is_invalid {
                        return Err(AllocationError::InvalidPool {
                            pool: pool.id.to_string(),
                            reason: pool.invalid_reason.clone().unwrap_or_default(),
                        }
                        .into());
                    }

                    let Some(basic) = device.basic.as_ref() else {
                        continue;
                    };
                    let Some(binding) = self.bind(r, request, basic, id, slice, false)? else {
                        continue;
                    };

                    if self.allocate_one(r.next_device())? {
                        return Ok(true);
                    }

                    trace!(device = %binding.id, "Rolling back device");
                    self.unbind(binding);
                }
            }
        }

        Ok(false)
    }

    fn in_use(&self, id: &DeviceId) -> bool {
        self.allocator.allocated_devices.contains(id) || self.allocating.contains(id)
    }

    /// Tentatively bind a selectable device to the request at `r`.
    ///
    /// Returns `None` when the device is in use or a claim constraint
    /// rejects it, leaving all state untouched. `must` marks a candidate
    /// without alternatives; a constraint rejecting it is a hard error.
    fn bind(
        &mut self,
        r: DeviceIndices,
        request: &'a DeviceRequest,
        device: &'a BasicDevice,
        id: DeviceId,
        slice: &'a ResourceSlice,
        must: bool,
    ) -> Result<Option<Binding<'a>>, AllocationError> {
        let admin_access = request.is_admin_access();
        if !admin_access && self.in_use(&id) {
            trace!(device = %id, "Device in use");
            return Ok(None);
        }

        let constraints = &mut self.constraints[r.claim];
        for i in 0..constraints.len() {
            if constraints[i].add(&request.name, device, &id) {
                continue;
            }
            if must {
                return Err(AllocationError::ConstraintViolated {
                    claim: self.allocator.claims[r.claim].key(),
                    request: request.name.clone(),
                    device: id,
                });
            }
            for accepted in constraints[..i].iter_mut().rev() {
                accepted.remove(&request.name, device, &id);
            }
            trace!(device = %id, "Device rejected by constraint");
            return Ok(None);
        }

        trace!(device = %id, "Device allocated");
        if !admin_access {
            self.allocating.insert(id.clone());
        }
        let results = &mut self.results[r.claim];
        let previous_len = results.len();
        results.push(InternalDeviceResult {
            request: &request.name,
            id: id.clone(),
            slice,
            admin_access: request.admin_access,
        });

        Ok(Some(Binding {
            claim: r.claim,
            request,
            device,
            id,
            previous_len,
        }))
    }

    /// Restore the state from before the matching `bind`
    fn unbind(&mut self, binding: Binding<'a>) {
        for constraint in self.constraints[binding.claim].iter_mut() {
            constraint.remove(&binding.request.name, binding.device, &binding.id);
        }
        if !binding.request.is_admin_access() {
            self.allocating.remove(&binding.id);
        }
        self.results[binding.claim].truncate(binding.previous_len);
        trace!(device = %binding.id, "Device deallocated");
    }
}
