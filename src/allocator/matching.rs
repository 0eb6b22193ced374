//! Selectability of a device for a request
//!
//! Whether a device matches a request does not depend on what else has been
//! bound, so results are memoized for the duration of one allocation. Each
//! selector evaluation is traced here with its result and cost; filter on
//! this module to enable just that output.

use std::collections::HashMap;

use tracing::trace;

use super::{AllocationError, Allocator, SelectorOwner};
use crate::model::{BasicDevice, Device, DeviceClass, DeviceId, DeviceSelector, ResourceSlice};
use crate::selector::{DeviceView, SelectorError};

/// Position of a request: claim index, then request index within the claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct RequestIndices {
    pub claim: usize,
    pub request: usize,
}

/// Memoized "does this device match this request" answers
#[derive(Debug, Default)]
pub(crate) struct Selectability {
    matches: HashMap<(DeviceId, RequestIndices), bool>,
}

impl Selectability {
    /// Check class and request selectors of `r` against one device.
    ///
    /// Devices of unknown kinds are never selectable.
    pub fn check(
        &mut self,
        allocator: &Allocator,
        r: RequestIndices,
        class: &DeviceClass,
        slice: &ResourceSlice,
        device: &Device,
    ) -> Result<bool, AllocationError> {
        let Some(basic) = device.basic.as_ref() else {
            return Ok(false);
        };

        let key = (
            DeviceId::new(&slice.driver, &slice.pool.name, &device.name),
            r,
        );
        if let Some(matches) = self.matches.get(&key) {
            return Ok(*matches);
        }

        let claim = &allocator.claims[r.claim];
        let request = &claim.requests()[r.request];
        let matches = selectors_match(
            allocator,
            &key.0,
            basic,
            &class.spec.selectors,
            || SelectorOwner::Class(class.name().to_string()),
        )? && selectors_match(allocator, &key.0, basic, &request.selectors, || {
            SelectorOwner::Claim(claim.key())
        })?;

        self.matches.insert(key, matches);
        Ok(matches)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.matches.len()
    }
}

fn selectors_match(
    allocator: &Allocator,
    id: &DeviceId,
    device: &BasicDevice,
    selectors: &[DeviceSelector],
    owner: impl Fn() -> SelectorOwner,
) -> Result<bool, AllocationError> {
    let view = DeviceView {
        driver: &id.driver,
        device,
    };

    for (index, selector) in selectors.iter().enumerate() {
        // Selector kinds are validated during preprocessing
        let Some(expression) = selector.expression() else {
            return Err(AllocationError::Selector {
                owner: owner(),
                index,
                source: SelectorError::Compile("unsupported selector type".to_string()),
            });
        };
        let program = allocator
            .selectors
            .compile(expression)
            .map_err(|source| AllocationError::Selector {
                owner: owner(),
                index,
                source,
            })?;

        let evaluation = program.matches(&view);
        match &evaluation {
            Ok(e) => trace!(
                device = %id,
                owner = %owner(),
                selector = index,
                expression,
                matches = e.matches,
                cost = e.cost,
                "Selector result"
            ),
            Err(err) => trace!(
                device = %id,
                owner = %owner(),
                selector = index,
                expression,
                error = %err,
                "Selector failed"
            ),
        }

        let evaluation = evaluation.map_err(|source| AllocationError::Selector {
            owner: owner(),
            index,
            source,
        })?;
        if !evaluation.matches {
            return Ok(false);
        }
    }

    Ok(true)
}
